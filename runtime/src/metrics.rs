//! Prometheus metrics for the CQRS substrate.
//!
//! Components never touch the `metrics` macros directly; they go through the recorder
//! structs below, so metric names and label sets live in one place. Projection metrics
//! are recorded by `sparkle-cqrs-projections` and only described here.
//!
//! # Example
//!
//! ```rust,no_run
//! use sparkle_cqrs_runtime::metrics::PrometheusMetrics;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut metrics = PrometheusMetrics::new();
//! metrics.install()?;
//!
//! // Serve metrics.render() on GET /metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Buckets for outbox publish lag, in seconds.
pub const PUBLISH_LAG_BUCKETS: [f64; 9] = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Buckets for processing and rebuild durations, in seconds.
pub const DURATION_BUCKETS: [f64; 12] = [
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// The process-wide Prometheus recorder.
#[derive(Default)]
pub struct PrometheusMetrics {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl PrometheusMetrics {
    /// Create an uninstalled recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe every metric and install the recorder globally.
    ///
    /// A second installation in the same process (tests) is logged and ignored; the
    /// first recorder keeps collecting and this instance renders nothing.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full("sparkle_cqrs_outbox_publish_lag_seconds".to_string()),
                &PUBLISH_LAG_BUCKETS,
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &DURATION_BUCKETS,
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                register_metrics();
                self.handle = Some(handle);
                tracing::info!("Prometheus recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this instance did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Outbox
    describe_gauge!(
        "sparkle_cqrs_outbox_pending_count",
        "Number of unpublished outbox entries"
    );
    describe_histogram!(
        "sparkle_cqrs_outbox_publish_lag_seconds",
        "Time between outbox insert and publication"
    );
    describe_counter!(
        "sparkle_cqrs_outbox_publish_errors_total",
        "Outbox entries that failed to publish"
    );
    describe_counter!(
        "sparkle_cqrs_outbox_undecodable_total",
        "Outbox entries marked without publishing because they cannot be decoded"
    );
    describe_counter!(
        "sparkle_cqrs_events_published_total",
        "Events relayed from the outbox to the stream bus"
    );

    // Workers
    describe_counter!(
        "sparkle_cqrs_events_processed_total",
        "Events handled successfully by a worker"
    );
    describe_histogram!(
        "sparkle_cqrs_event_processing_duration_seconds",
        "Time from receipt to successful handling, including retries"
    );
    describe_counter!("sparkle_cqrs_worker_errors_total", "Worker failures by kind");
    describe_counter!("sparkle_cqrs_retry_attempts_total", "Handler retries");
    describe_counter!(
        "sparkle_cqrs_duplicate_events_total",
        "Redelivered events skipped by the idempotency check"
    );
    describe_gauge!(
        "sparkle_cqrs_consumer_lag",
        "Delivered but unacknowledged messages per stream and group"
    );

    // Dead-letter queue
    describe_counter!(
        "sparkle_cqrs_dlq_messages_total",
        "Messages written to the dead-letter queue"
    );
    describe_gauge!(
        "sparkle_cqrs_dlq_pending_count",
        "Entries currently in the dead-letter queue"
    );

    // Projections
    describe_gauge!(
        "sparkle_cqrs_projection_lag",
        "Events behind the event store per projection"
    );
    describe_histogram!(
        "sparkle_cqrs_projection_rebuild_duration_seconds",
        "Duration of projection rebuilds"
    );
    describe_gauge!(
        "sparkle_cqrs_projection_status",
        "Projection status (1=active, 0=paused, -1=rebuilding, -2=error)"
    );
    describe_gauge!(
        "sparkle_cqrs_event_store_size",
        "Event store rows per aggregate type"
    );
    describe_gauge!("sparkle_cqrs_snapshot_count", "Stored snapshots per projection");
}

/// Publisher and outbox maintenance metrics.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record one relayed event.
    pub fn record_published(event_type: &str, lag: Duration) {
        counter!("sparkle_cqrs_events_published_total", "event_type" => event_type.to_string())
            .increment(1);
        histogram!("sparkle_cqrs_outbox_publish_lag_seconds").record(lag.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_publish_error() {
        counter!("sparkle_cqrs_outbox_publish_errors_total").increment(1);
    }

    /// Record a row set aside because it cannot be decoded.
    pub fn record_undecodable(event_type: &str) {
        counter!("sparkle_cqrs_outbox_undecodable_total", "event_type" => event_type.to_string())
            .increment(1);
    }

    /// Set the pending gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_pending(count: i64) {
        gauge!("sparkle_cqrs_outbox_pending_count").set(count as f64);
    }
}

/// Base worker metrics.
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record a successfully handled event.
    pub fn record_processed(event_type: &str, group: &str, duration: Duration) {
        counter!(
            "sparkle_cqrs_events_processed_total",
            "event_type" => event_type.to_string(),
            "consumer_group" => group.to_string()
        )
        .increment(1);
        histogram!(
            "sparkle_cqrs_event_processing_duration_seconds",
            "event_type" => event_type.to_string(),
            "consumer_group" => group.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a worker failure of `kind` (`parse_error`, `process_event`, `read_batch`).
    pub fn record_error(group: &str, kind: &str) {
        counter!(
            "sparkle_cqrs_worker_errors_total",
            "consumer_group" => group.to_string(),
            "error_type" => kind.to_string()
        )
        .increment(1);
    }

    /// Record one handler retry.
    pub fn record_retry(group: &str) {
        counter!("sparkle_cqrs_retry_attempts_total", "consumer_group" => group.to_string())
            .increment(1);
    }

    /// Record a skipped duplicate.
    pub fn record_duplicate(group: &str) {
        counter!("sparkle_cqrs_duplicate_events_total", "consumer_group" => group.to_string())
            .increment(1);
    }

    /// Set the pending-message gauge of a group.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_consumer_lag(stream: &str, group: &str, pending: u64) {
        gauge!(
            "sparkle_cqrs_consumer_lag",
            "stream" => stream.to_string(),
            "group" => group.to_string()
        )
        .set(pending as f64);
    }
}

/// Dead-letter queue metrics.
pub struct DlqMetrics;

impl DlqMetrics {
    /// Record a dead-lettered message.
    pub fn record_message(error_type: &str, group: &str) {
        counter!(
            "sparkle_cqrs_dlq_messages_total",
            "error_type" => error_type.to_string(),
            "consumer_group" => group.to_string()
        )
        .increment(1);
    }

    /// Set the queue length gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_pending(count: u64) {
        gauge!("sparkle_cqrs_dlq_pending_count").set(count as f64);
    }
}
