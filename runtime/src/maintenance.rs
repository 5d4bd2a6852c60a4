//! Periodic housekeeping tasks.
//!
//! - [`OutboxCleaner`]: deletes published outbox rows past retention
//! - [`PendingMonitor`]: exports the outbox backlog and warns when it grows
//! - [`DlqCleaner`]: removes expired dead letters
//! - [`LedgerPruner`]: trims the idempotency ledger
//!
//! Each one runs until the shutdown channel flips, and a failing tick is logged and
//! retried on the next tick.

use crate::dlq::DlqHandler;
use crate::metrics::OutboxMetrics;
use sparkle_cqrs_core::idempotency::ProcessedEventStore;
use sparkle_cqrs_postgres::{OutboxError, OutboxRepository};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

/// Source of the outbox backlog size.
///
/// Implemented by [`OutboxRepository`]; tests substitute a fixed count.
pub trait OutboxBacklog: Send + Sync {
    /// Number of unpublished outbox entries.
    ///
    /// # Errors
    ///
    /// Returns a description of the storage failure.
    fn pending_count(&self) -> Pin<Box<dyn Future<Output = Result<i64, String>> + Send + '_>>;
}

impl OutboxBacklog for OutboxRepository {
    fn pending_count(&self) -> Pin<Box<dyn Future<Output = Result<i64, String>> + Send + '_>> {
        Box::pin(async move {
            OutboxRepository::pending_count(self)
                .await
                .map_err(|e: OutboxError| e.to_string())
        })
    }
}

/// Call `tick` every `period`, starting one period from now, until shutdown.
pub(crate) async fn run_periodic<F, Fut>(
    task: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(task, period_secs = period.as_secs(), "Periodic task started");

    while !*shutdown.borrow() {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => tick().await,
        }
    }

    tracing::info!(task, "Periodic task stopped");
}

/// Outbox cleaner settings.
#[derive(Debug, Clone)]
pub struct OutboxCleanerConfig {
    /// Published rows older than this many days are deleted.
    pub retention_days: u32,
    /// Time between runs.
    pub interval: Duration,
}

impl Default for OutboxCleanerConfig {
    fn default() -> Self {
        Self {
            retention_days: 7,
            interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Deletes published outbox rows past retention.
pub struct OutboxCleaner {
    outbox: OutboxRepository,
    config: OutboxCleanerConfig,
}

impl OutboxCleaner {
    /// Create a cleaner.
    #[must_use]
    pub const fn new(outbox: OutboxRepository, config: OutboxCleanerConfig) -> Self {
        Self { outbox, config }
    }

    /// Run one cleanup pass.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] on failure.
    pub async fn clean_once(&self) -> Result<u64, OutboxError> {
        let deleted = self.outbox.delete_old(self.config.retention_days).await?;
        if deleted > 0 {
            tracing::info!(
                deleted,
                retention_days = self.config.retention_days,
                "Old outbox entries deleted"
            );
        }
        Ok(deleted)
    }

    /// Run until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        run_periodic("outbox_cleaner", self.config.interval, shutdown, move || async move {
            if let Err(e) = self.clean_once().await {
                tracing::error!(error = %e, "Outbox cleanup failed");
            }
        })
        .await;
    }
}

/// Pending monitor settings.
#[derive(Debug, Clone)]
pub struct PendingMonitorConfig {
    /// Time between checks.
    pub interval: Duration,
    /// Backlog size that triggers a warning.
    pub alert_threshold: i64,
}

impl Default for PendingMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            alert_threshold: 1000,
        }
    }
}

/// Exports the outbox backlog as a gauge.
pub struct PendingMonitor {
    outbox: Arc<dyn OutboxBacklog>,
    config: PendingMonitorConfig,
}

impl PendingMonitor {
    /// Create a monitor.
    #[must_use]
    pub fn new(outbox: Arc<dyn OutboxBacklog>, config: PendingMonitorConfig) -> Self {
        Self { outbox, config }
    }

    /// Read the backlog, update the gauge and warn above the threshold.
    ///
    /// # Errors
    ///
    /// Returns the storage error description.
    pub async fn check(&self) -> Result<i64, String> {
        let pending = self.outbox.pending_count().await?;
        OutboxMetrics::set_pending(pending);

        if pending > self.config.alert_threshold {
            tracing::warn!(
                pending,
                threshold = self.config.alert_threshold,
                "Outbox backlog above alert threshold"
            );
        }
        Ok(pending)
    }

    /// Check immediately, then every interval until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let check = move || async move {
            if let Err(e) = self.check().await {
                tracing::error!(error = %e, "Outbox pending count failed");
            }
        };
        check().await;
        run_periodic("pending_monitor", self.config.interval, shutdown, check).await;
    }
}

/// Periodically removes expired dead letters.
pub struct DlqCleaner {
    dlq: Arc<DlqHandler>,
    interval: Duration,
}

impl DlqCleaner {
    /// Default time between runs.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Create a cleaner.
    #[must_use]
    pub const fn new(dlq: Arc<DlqHandler>, interval: Duration) -> Self {
        Self { dlq, interval }
    }

    /// Run until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        run_periodic("dlq_cleaner", self.interval, shutdown, move || async move {
            match self.dlq.cleanup().await {
                Ok(deleted) => tracing::debug!(deleted, "DLQ cleanup finished"),
                Err(e) => tracing::error!(error = %e, "DLQ cleanup failed"),
            }
        })
        .await;
    }
}

/// Periodically trims the idempotency ledger.
pub struct LedgerPruner {
    ledger: Arc<dyn ProcessedEventStore>,
    retention_days: u32,
    interval: Duration,
}

impl LedgerPruner {
    /// Create a pruner keeping marks for `retention_days`.
    #[must_use]
    pub fn new(ledger: Arc<dyn ProcessedEventStore>, retention_days: u32, interval: Duration) -> Self {
        Self {
            ledger,
            retention_days,
            interval,
        }
    }

    /// Run until shutdown.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        run_periodic("ledger_pruner", self.interval, shutdown, move || async move {
            match self.ledger.cleanup(self.retention_days).await {
                Ok(deleted) if deleted > 0 => {
                    tracing::info!(deleted, retention_days = self.retention_days, "Processed events pruned");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Processed events cleanup failed"),
            }
        })
        .await;
    }
}
