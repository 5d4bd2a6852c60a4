//! Health of the CQRS pipeline.
//!
//! Four components are checked: the stream bus (`redis`), the outbox backlog, the
//! projection streams and the dead-letter queue. The overall status is the worst
//! component status, and results are cached briefly so probe storms do not hammer
//! Redis or Postgres.

use crate::maintenance::OutboxBacklog;
use crate::metrics::DlqMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sparkle_cqrs_core::event_bus::EventBus;
use sparkle_cqrs_core::routing::{STREAM_COMMUNITY, STREAM_DLQ, STREAM_GALAXY, STREAM_TASK};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Health check status levels, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Operational with issues, e.g. a growing backlog.
    Degraded,
    /// Not operational.
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of checking one component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentHealth {
    /// Component name.
    pub name: String,
    /// Its status.
    pub status: HealthStatus,
    /// What is wrong, if anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the check ran.
    pub last_checked: DateTime<Utc>,
    /// Measurements behind the status.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, Value>,
}

impl ComponentHealth {
    fn with_status(name: &str, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message,
            last_checked: Utc::now(),
            details: BTreeMap::new(),
        }
    }

    /// A healthy result.
    #[must_use]
    pub fn healthy(name: &str) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    /// A degraded result.
    #[must_use]
    pub fn degraded(name: &str, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    /// An unhealthy result.
    #[must_use]
    pub fn unhealthy(name: &str, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Attach a measurement.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Aggregated health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CqrsHealth {
    /// Worst component status.
    pub status: HealthStatus,
    /// Per-component results.
    pub components: Vec<ComponentHealth>,
    /// When the report was built.
    pub timestamp: DateTime<Utc>,
}

impl CqrsHealth {
    /// Combine component results.
    #[must_use]
    pub fn new(components: Vec<ComponentHealth>) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            components,
            timestamp: Utc::now(),
        }
    }

    /// Look up one component.
    #[must_use]
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Thresholds and cache lifetime.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Outbox backlog above this is degraded.
    pub outbox_warn_threshold: i64,
    /// Outbox backlog above this is unhealthy.
    pub outbox_critical_threshold: i64,
    /// DLQ length above this is degraded.
    pub dlq_threshold: u64,
    /// Ping latency above this is degraded.
    pub max_bus_latency: Duration,
    /// How long a report is reused.
    pub cache_ttl: Duration,
    /// Streams whose lengths are reported.
    pub streams: Vec<String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            outbox_warn_threshold: 100,
            outbox_critical_threshold: 1000,
            dlq_threshold: 100,
            max_bus_latency: Duration::from_millis(100),
            cache_ttl: Duration::from_secs(5),
            streams: [STREAM_COMMUNITY, STREAM_TASK, STREAM_GALAXY]
                .map(String::from)
                .to_vec(),
        }
    }
}

/// Checks pipeline components and caches the result.
pub struct HealthChecker {
    bus: Arc<dyn EventBus>,
    outbox: Option<Arc<dyn OutboxBacklog>>,
    config: HealthConfig,
    cache: Mutex<Option<(Instant, CqrsHealth)>>,
}

impl HealthChecker {
    /// Create a checker over the stream bus.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, config: HealthConfig) -> Self {
        Self {
            bus,
            outbox: None,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Also check the outbox backlog.
    #[must_use]
    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxBacklog>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// The current report, at most `cache_ttl` old.
    pub async fn check(&self) -> CqrsHealth {
        let mut cache = self.cache.lock().await;
        if let Some((at, report)) = cache.as_ref() {
            if at.elapsed() < self.config.cache_ttl {
                return report.clone();
            }
        }

        let report = self.check_now().await;
        if report.status != HealthStatus::Healthy {
            tracing::warn!(status = %report.status, "CQRS health check not healthy");
        }
        *cache = Some((Instant::now(), report.clone()));
        report
    }

    /// Whether the pipeline can take traffic (not unhealthy).
    pub async fn is_ready(&self) -> bool {
        !self.check().await.status.is_unhealthy()
    }

    /// Run every check, bypassing the cache.
    pub async fn check_now(&self) -> CqrsHealth {
        CqrsHealth::new(vec![
            self.check_bus().await,
            self.check_outbox().await,
            self.check_streams().await,
            self.check_dlq().await,
        ])
    }

    async fn check_bus(&self) -> ComponentHealth {
        let started = Instant::now();
        if let Err(e) = self.bus.ping().await {
            return ComponentHealth::unhealthy("redis", format!("ping failed: {e}"));
        }

        let latency = started.elapsed();
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let health = if latency > self.config.max_bus_latency {
            ComponentHealth::degraded("redis", format!("high latency: {latency_ms}ms"))
        } else {
            ComponentHealth::healthy("redis")
        };
        health.with_detail("latency_ms", latency_ms)
    }

    async fn check_outbox(&self) -> ComponentHealth {
        let Some(outbox) = &self.outbox else {
            return ComponentHealth::healthy("outbox").with_detail("monitored", false);
        };

        match outbox.pending_count().await {
            Err(e) => ComponentHealth::degraded("outbox", format!("pending count failed: {e}")),
            Ok(pending) => {
                let health = if pending > self.config.outbox_critical_threshold {
                    ComponentHealth::unhealthy("outbox", format!("critical backlog: {pending} pending"))
                } else if pending > self.config.outbox_warn_threshold {
                    ComponentHealth::degraded("outbox", format!("high backlog: {pending} pending"))
                } else {
                    ComponentHealth::healthy("outbox")
                };
                health.with_detail("pending_count", pending)
            }
        }
    }

    async fn check_streams(&self) -> ComponentHealth {
        let mut health = ComponentHealth::healthy("event_streams");
        for stream in &self.config.streams {
            match self.bus.stream_length(stream).await {
                Ok(Some(length)) => health = health.with_detail(stream.clone(), length),
                Ok(None) => health = health.with_detail(stream.clone(), "not_created"),
                Err(e) => {
                    return ComponentHealth::degraded(
                        "event_streams",
                        format!("length of {stream} unavailable: {e}"),
                    );
                }
            }
        }
        health
    }

    async fn check_dlq(&self) -> ComponentHealth {
        match self.bus.stream_length(STREAM_DLQ).await {
            Err(e) => ComponentHealth::degraded("dlq", format!("length unavailable: {e}")),
            Ok(length) => {
                let pending = length.unwrap_or(0);
                DlqMetrics::set_pending(pending);
                let health = if pending > self.config.dlq_threshold {
                    ComponentHealth::degraded("dlq", format!("{pending} messages in DLQ"))
                } else {
                    ComponentHealth::healthy("dlq")
                };
                health.with_detail("pending_count", pending)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sparkle_cqrs_testing::InMemoryStreamBus;
    use std::future::Future;
    use std::pin::Pin;

    struct Backlog(Result<i64, String>);

    impl OutboxBacklog for Backlog {
        fn pending_count(&self) -> Pin<Box<dyn Future<Output = Result<i64, String>> + Send + '_>> {
            Box::pin(async move { self.0.clone() })
        }
    }

    fn checker(bus: &Arc<InMemoryStreamBus>, backlog: Result<i64, String>) -> HealthChecker {
        HealthChecker::new(bus.clone(), HealthConfig::default()).with_outbox(Arc::new(Backlog(backlog)))
    }

    #[test]
    fn test_worst_status_wins() {
        assert_eq!(HealthStatus::Healthy.worst(HealthStatus::Degraded), HealthStatus::Degraded);
        assert_eq!(HealthStatus::Unhealthy.worst(HealthStatus::Degraded), HealthStatus::Unhealthy);
        assert_eq!(CqrsHealth::new(vec![]).status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_idle_pipeline_is_healthy() {
        let bus = Arc::new(InMemoryStreamBus::new());
        bus.append(STREAM_TASK, vec![("k".into(), "v".into())]).await.unwrap();

        let report = checker(&bus, Ok(3)).check_now().await;

        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.components.len(), 4);
        let streams = report.component("event_streams").unwrap();
        assert_eq!(streams.details.get(STREAM_TASK), Some(&Value::from(1)));
        assert_eq!(streams.details.get(STREAM_GALAXY), Some(&Value::from("not_created")));
    }

    #[tokio::test]
    async fn test_offline_bus_is_unhealthy() {
        let bus = Arc::new(InMemoryStreamBus::new());
        bus.set_offline(true);
        let checker = checker(&bus, Ok(0));

        let report = checker.check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.component("redis").unwrap().status, HealthStatus::Unhealthy);
        assert!(!checker.is_ready().await);
    }

    #[tokio::test]
    async fn test_outbox_thresholds() {
        let bus = Arc::new(InMemoryStreamBus::new());

        let status = |report: CqrsHealth| report.component("outbox").unwrap().status;
        assert_eq!(status(checker(&bus, Ok(100)).check_now().await), HealthStatus::Healthy);
        assert_eq!(status(checker(&bus, Ok(101)).check_now().await), HealthStatus::Degraded);
        assert_eq!(status(checker(&bus, Ok(1001)).check_now().await), HealthStatus::Unhealthy);
        assert_eq!(
            status(checker(&bus, Err("down".into())).check_now().await),
            HealthStatus::Degraded
        );
    }

    #[tokio::test]
    async fn test_large_dlq_degrades() {
        let bus = Arc::new(InMemoryStreamBus::new());
        for _ in 0..101 {
            bus.append(STREAM_DLQ, vec![("payload".into(), "{}".into())]).await.unwrap();
        }

        let report = checker(&bus, Ok(0)).check_now().await;
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(
            report.component("dlq").unwrap().details.get("pending_count"),
            Some(&Value::from(101))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_is_cached() {
        let bus = Arc::new(InMemoryStreamBus::new());
        let checker = checker(&bus, Ok(0));
        assert_eq!(checker.check().await.status, HealthStatus::Healthy);

        bus.set_offline(true);
        assert_eq!(checker.check().await.status, HealthStatus::Healthy);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(checker.check().await.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_report_serializes_snake_case() {
        let report = CqrsHealth::new(vec![ComponentHealth::degraded("dlq", "x").with_detail("n", 1)]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["components"][0]["details"]["n"], 1);
    }
}
