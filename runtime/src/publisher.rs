//! Outbox relay.
//!
//! Each tick locks a batch of unpublished rows, appends them to the stream bus in
//! `created_at` order and marks the successful ones published in the same transaction.
//! A row that fails to publish is skipped and retried on a later tick. A row that cannot
//! be decoded never will be: it is logged, counted and marked so it stops taking a slot
//! in every batch. Its payload stays in the table until the cleaner prunes it.
//!
//! ```text
//!  event_outbox ──get_unpublished (FOR UPDATE SKIP LOCKED)──► Publisher
//!                                                             │ publish each
//!                                                             ▼
//!                                                       EventBus stream
//!  event_outbox ◄──mark_published + COMMIT────────────────────┘
//! ```

use crate::metrics::OutboxMetrics;
use chrono::Utc;
use sparkle_cqrs_core::event_bus::EventBus;
use sparkle_cqrs_postgres::{OutboxError, OutboxRepository};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Errors that end a publish tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublisherError {
    /// The outbox could not be read, marked or committed.
    #[error(transparent)]
    Outbox(#[from] OutboxError),
}

/// Publisher settings.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Rows per tick.
    pub batch_size: usize,
    /// Time between ticks.
    pub poll_interval: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Rows locked.
    pub fetched: usize,
    /// Rows appended and marked.
    pub published: usize,
    /// Rows left for a later tick.
    pub failed: usize,
    /// Rows marked without publishing because they cannot be decoded.
    pub undecodable: usize,
}

/// Relays outbox rows to the stream bus.
pub struct Publisher {
    outbox: OutboxRepository,
    bus: Arc<dyn EventBus>,
    config: PublisherConfig,
}

impl Publisher {
    /// Create a publisher.
    #[must_use]
    pub fn new(outbox: OutboxRepository, bus: Arc<dyn EventBus>, config: PublisherConfig) -> Self {
        Self {
            outbox,
            bus,
            config,
        }
    }

    /// Run one poll/publish/mark cycle.
    ///
    /// # Errors
    ///
    /// Returns [`PublisherError::Outbox`] if the batch cannot be read or the marks cannot
    /// be committed. Rows published before a failed commit are published again on a later
    /// tick; workers deduplicate them.
    pub async fn publish_once(&self) -> Result<PublishReport, PublisherError> {
        let mut tx = self.outbox.begin().await?;
        let entries = self.outbox.get_unpublished(&mut tx, self.config.batch_size).await?;

        let mut report = PublishReport {
            fetched: entries.len(),
            ..PublishReport::default()
        };
        if entries.is_empty() {
            return Ok(report);
        }

        let mut marked_ids = Vec::with_capacity(entries.len());
        for entry in &entries {
            let event = match entry.to_event() {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(
                        event_id = %entry.id,
                        event_type = %entry.event_type,
                        error = %e,
                        "Outbox entry cannot be decoded, marking it without publishing"
                    );
                    OutboxMetrics::record_undecodable(&entry.event_type);
                    report.undecodable += 1;
                    marked_ids.push(entry.id.clone());
                    continue;
                }
            };

            match self.bus.publish(&event).await {
                Ok(message_id) => {
                    let lag = (Utc::now() - entry.created_at).to_std().unwrap_or_default();
                    OutboxMetrics::record_published(&entry.event_type, lag);
                    tracing::debug!(
                        event_id = %entry.id,
                        event_type = %entry.event_type,
                        message_id = %message_id,
                        "Event published"
                    );
                    report.published += 1;
                    marked_ids.push(entry.id.clone());
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %entry.id,
                        event_type = %entry.event_type,
                        error = %e,
                        "Failed to publish outbox entry"
                    );
                    OutboxMetrics::record_publish_error();
                    report.failed += 1;
                }
            }
        }

        self.outbox.mark_published(&mut tx, &marked_ids).await?;
        tx.commit()
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

        tracing::debug!(
            fetched = report.fetched,
            published = report.published,
            failed = report.failed,
            undecodable = report.undecodable,
            "Outbox batch relayed"
        );
        Ok(report)
    }

    /// Tick until shutdown. A tick in progress always finishes, marks included.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = u64::try_from(self.config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            "Outbox publisher started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.publish_once().await {
                        tracing::error!(error = %e, "Outbox publish tick failed");
                    }
                }
            }
        }

        tracing::info!("Outbox publisher stopped");
    }
}
