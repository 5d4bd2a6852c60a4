//! Projection rebuilds and snapshots.
//!
//! A rebuild replays the event store into a projection:
//!
//! 1. Status moves to `rebuilding` and the projection drops its keys.
//! 2. History rows of the projection's aggregate type are read in keyset batches ordered
//!    by `(sequence_number, aggregate_id)`. No transaction spans two batches.
//! 3. Each row is handed to the projection. Failures are logged and skipped.
//! 4. After each batch the position is stored as a replay cursor and the progress
//!    callback runs.
//! 5. Exhaustion moves the status back to `active`.
//!
//! Cancelling moves the projection to `paused` at the last stored cursor, and
//! [`ProjectionBuilder::resume_rebuild`] continues from there without dropping keys.
//!
//! Snapshots store a projection's whole keyspace next to the cursor it corresponds to.
//! [`ProjectionBuilder::rebuild_from_snapshot`] restores the latest one and replays only
//! what came after it.

use crate::manager::{ProjectionManager, RebuildLease};
use crate::metrics::ProjectionMetrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sparkle_cqrs_core::event_store::{EventHistory, ReplayCursor};
use sparkle_cqrs_core::projection::{
    ProjectionError, ProjectionHandler, ProjectionStatus, Result, Snapshot, SnapshotStore,
};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// Rows per replay batch.
pub const DEFAULT_BATCH_SIZE: i64 = 1000;

/// Called after every batch.
pub type ProgressCallback = Arc<dyn Fn(&RebuildProgress) + Send + Sync>;

/// Rebuild settings.
#[derive(Clone)]
pub struct RebuildOptions {
    /// Rows per batch.
    pub batch_size: i64,
    /// Replay rows strictly after this cursor.
    pub from: ReplayCursor,
    /// Progress callback.
    pub progress: Option<ProgressCallback>,
    /// Store a snapshot once the replay completes.
    pub snapshot_on_complete: bool,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            from: ReplayCursor::START,
            progress: None,
            snapshot_on_complete: false,
        }
    }
}

impl fmt::Debug for RebuildOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebuildOptions")
            .field("batch_size", &self.batch_size)
            .field("from", &self.from)
            .field("progress", &self.progress.is_some())
            .field("snapshot_on_complete", &self.snapshot_on_complete)
            .finish()
    }
}

impl RebuildOptions {
    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Start after `cursor` instead of the beginning.
    #[must_use]
    pub const fn from_cursor(mut self, cursor: ReplayCursor) -> Self {
        self.from = cursor;
        self
    }

    /// Register a progress callback.
    #[must_use]
    pub fn on_progress(mut self, callback: impl Fn(&RebuildProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Snapshot the projection when the replay completes.
    #[must_use]
    pub const fn with_snapshot(mut self) -> Self {
        self.snapshot_on_complete = true;
        self
    }
}

/// Where a rebuild stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildStatus {
    /// Batches are still being applied.
    Running,
    /// Every row was applied.
    Completed,
}

/// Progress report of a rebuild.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildProgress {
    /// Projection name.
    pub projection_name: String,
    /// Running or completed.
    pub status: RebuildStatus,
    /// History rows of the aggregate type when the rebuild started.
    pub total_events: i64,
    /// Rows applied by this run.
    pub processed_events: i64,
    /// `processed_events / total_events`, in percent.
    pub percent: f64,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Elapsed time.
    pub duration: Duration,
    /// Cursor after the last applied row.
    pub last_position: Option<String>,
}

impl RebuildProgress {
    #[allow(clippy::cast_precision_loss)]
    fn percent(processed: i64, total: i64) -> f64 {
        if total <= 0 {
            100.0
        } else {
            (processed as f64 / total as f64 * 100.0).min(100.0)
        }
    }
}

/// Replays history into projections and manages their snapshots.
pub struct ProjectionBuilder {
    manager: Arc<ProjectionManager>,
    history: Arc<dyn EventHistory>,
    snapshots: Arc<dyn SnapshotStore>,
}

impl ProjectionBuilder {
    /// Create a builder.
    #[must_use]
    pub fn new(
        manager: Arc<ProjectionManager>,
        history: Arc<dyn EventHistory>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self {
            manager,
            history,
            snapshots,
        }
    }

    /// Drop a projection's keys and replay its history.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Cancelled`] when `cancel` flips (the projection is
    /// then `paused`), [`ProjectionError::NotFound`] for unknown names, or a storage
    /// error (the projection is then `error`).
    pub async fn rebuild_from_event_store(
        &self,
        name: &str,
        options: RebuildOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RebuildProgress> {
        let handler = self.manager.handler(name).await?;
        let lease = self.start(name, handler.as_ref()).await?;
        self.manager.clear_position(name).await?;
        let from = options.from;
        self.replay(&lease, name, handler.as_ref(), from, &options, cancel)
            .await
    }

    /// Continue an interrupted rebuild from the stored cursor, keeping existing keys.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidPosition`] when the stored position is not a
    /// replay cursor, plus everything [`ProjectionBuilder::rebuild_from_event_store`]
    /// returns.
    pub async fn resume_rebuild(
        &self,
        name: &str,
        options: RebuildOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RebuildProgress> {
        let handler = self.manager.handler(name).await?;
        let info = self.manager.get_info(name).await?;
        let from = match info.last_processed_position.as_deref() {
            Some(raw) => raw
                .parse::<ReplayCursor>()
                .map_err(|e| ProjectionError::InvalidPosition(e.to_string()))?,
            None => ReplayCursor::START,
        };

        tracing::info!(projection = name, from = %from, "Resuming projection rebuild");
        let lease = self.manager.begin_rebuild(name).await?;
        self.replay(&lease, name, handler.as_ref(), from, &options, cancel)
            .await
    }

    /// Restore the latest snapshot and replay what came after it.
    ///
    /// Falls back to a full rebuild when there is no usable snapshot.
    ///
    /// # Errors
    ///
    /// See [`ProjectionBuilder::rebuild_from_event_store`].
    pub async fn rebuild_from_snapshot(
        &self,
        name: &str,
        options: RebuildOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RebuildProgress> {
        let handler = self.manager.handler(name).await?;
        let Some(snapshot) = self.snapshots.latest(name).await? else {
            tracing::info!(projection = name, "No snapshot found, rebuilding from the beginning");
            return self.rebuild_from_event_store(name, options, cancel).await;
        };
        let Ok(from) = snapshot.stream_position.parse::<ReplayCursor>() else {
            tracing::warn!(
                projection = name,
                position = %snapshot.stream_position,
                "Snapshot position is not a replay cursor, rebuilding from the beginning"
            );
            return self.rebuild_from_event_store(name, options, cancel).await;
        };

        let lease = self.start(name, handler.as_ref()).await?;
        match handler.restore_snapshot(&snapshot.data).await {
            Ok(()) => {
                tracing::info!(projection = name, snapshot_id = %snapshot.id, from = %from, "Snapshot restored");
                self.manager.update_position(name, &from.to_string()).await?;
                self.replay(&lease, name, handler.as_ref(), from, &options, cancel)
                    .await
            }
            Err(ProjectionError::SnapshotUnsupported(_)) => {
                tracing::warn!(projection = name, "Projection cannot restore snapshots, replaying everything");
                self.manager.clear_position(name).await?;
                self.replay(&lease, name, handler.as_ref(), ReplayCursor::START, &options, cancel)
                    .await
            }
            Err(e) => self.fail(&lease, e).await,
        }
    }

    /// Store a snapshot blob at `position`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if the snapshot cannot be saved.
    pub async fn create_snapshot(&self, name: &str, data: Vec<u8>, position: &str) -> Result<Uuid> {
        let snapshot = Snapshot::new(name, data, position);
        let id = snapshot.id;
        let bytes = snapshot.data.len();
        self.snapshots.save(snapshot).await?;
        ProjectionMetrics::set_snapshot_count(name, self.snapshots.count(Some(name)).await?);

        tracing::info!(projection = name, snapshot_id = %id, position, bytes, "Snapshot created");
        Ok(id)
    }

    /// Snapshot a projection's current keyspace at its stored replay cursor.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidPosition`] when the stored position is a live
    /// stream id rather than a replay cursor, or the projection's snapshot error.
    pub async fn capture_snapshot(&self, name: &str) -> Result<Uuid> {
        let handler = self.manager.handler(name).await?;
        let info = self.manager.get_info(name).await?;
        let position = match info.last_processed_position {
            Some(raw) => {
                raw.parse::<ReplayCursor>()
                    .map_err(|e| ProjectionError::InvalidPosition(e.to_string()))?;
                raw
            }
            None => ReplayCursor::START.to_string(),
        };
        let data = handler.capture_snapshot().await?;
        self.create_snapshot(name, data, &position).await
    }

    /// Latest snapshot of a projection.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    pub async fn latest_snapshot(&self, name: &str) -> Result<Option<Snapshot>> {
        self.snapshots.latest(name).await
    }

    /// Delete every snapshot of a projection, for example after a schema change.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    pub async fn invalidate_snapshots(&self, name: &str) -> Result<u64> {
        let deleted = self.snapshots.delete_all(name).await?;
        ProjectionMetrics::set_snapshot_count(name, 0);
        tracing::info!(projection = name, deleted, "Snapshots invalidated");
        Ok(deleted)
    }

    /// Number of stored snapshots, for one projection or all of them.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    pub async fn snapshot_count(&self, name: Option<&str>) -> Result<i64> {
        self.snapshots.count(name).await
    }

    /// Take the projection for a rebuild and drop its keys.
    async fn start(&self, name: &str, handler: &dyn ProjectionHandler) -> Result<RebuildLease> {
        let lease = self.manager.begin_rebuild(name).await?;
        if let Err(e) = handler.reset().await {
            return self.fail(&lease, e).await;
        }
        Ok(lease)
    }

    async fn fail<T>(&self, lease: &RebuildLease, error: ProjectionError) -> Result<T> {
        let message = error.to_string();
        if let Err(e) = self
            .manager
            .set_rebuild_status(lease, ProjectionStatus::Error, Some(&message))
            .await
        {
            tracing::error!(projection = lease.name(), error = %e, "Failed to record rebuild failure");
        }
        Err(error)
    }

    #[allow(clippy::too_many_lines)]
    async fn replay(
        &self,
        lease: &RebuildLease,
        name: &str,
        handler: &dyn ProjectionHandler,
        from: ReplayCursor,
        options: &RebuildOptions,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RebuildProgress> {
        let started = Instant::now();
        let aggregate_type = handler.aggregate_type();

        let total = match self.history.count_by_aggregate_type(aggregate_type).await {
            Ok(total) => total,
            Err(e) => return self.fail(lease, ProjectionError::Storage(e.to_string())).await,
        };
        ProjectionMetrics::set_event_store_size(aggregate_type, total);
        tracing::info!(
            projection = name,
            aggregate_type,
            total_events = total,
            from = %from,
            "Starting projection rebuild"
        );

        let mut progress = RebuildProgress {
            projection_name: name.to_string(),
            status: RebuildStatus::Running,
            total_events: total,
            processed_events: 0,
            percent: 0.0,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            last_position: None,
        };
        let mut cursor = from;

        loop {
            if *cancel.borrow() {
                let position = cursor.to_string();
                self.manager
                    .set_rebuild_status(lease, ProjectionStatus::Paused, Some("rebuild cancelled"))
                    .await?;
                tracing::warn!(
                    projection = name,
                    position = %position,
                    processed = progress.processed_events,
                    "Projection rebuild cancelled"
                );
                return Err(ProjectionError::Cancelled(format!("{name} at {position}")));
            }

            let batch = match self
                .history
                .load_batch(aggregate_type, cursor, options.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => return self.fail(lease, ProjectionError::Storage(e.to_string())).await,
            };
            if batch.is_empty() {
                break;
            }

            for entry in &batch {
                cursor = entry.cursor();
                progress.processed_events += 1;

                let bytes = match entry.to_event().and_then(|event| event.to_json_bytes()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::error!(projection = name, event_id = %entry.id, error = %e, "Cannot decode history row");
                        continue;
                    }
                };
                if let Err(e) = handler.handle(&bytes).await {
                    tracing::error!(
                        projection = name,
                        event_id = %entry.id,
                        event_type = %entry.event_type,
                        error = %e,
                        "Failed to apply event during rebuild"
                    );
                }
            }

            let position = cursor.to_string();
            if let Err(e) = self.manager.update_position(name, &position).await {
                tracing::warn!(projection = name, error = %e, "Failed to update rebuild position");
            }
            progress.last_position = Some(position);
            progress.percent = RebuildProgress::percent(progress.processed_events, total);
            progress.duration = started.elapsed();
            ProjectionMetrics::set_lag(name, total - progress.processed_events);
            if let Some(callback) = &options.progress {
                callback(&progress);
            }
            tracing::debug!(
                projection = name,
                processed = progress.processed_events,
                total,
                "Processed rebuild batch"
            );
        }

        if options.snapshot_on_complete {
            let data = handler.capture_snapshot().await?;
            self.create_snapshot(name, data, &cursor.to_string()).await?;
        }

        self.manager
            .set_rebuild_status(lease, ProjectionStatus::Active, None)
            .await?;
        progress.status = RebuildStatus::Completed;
        progress.percent = 100.0;
        progress.duration = started.elapsed();
        progress.last_position.get_or_insert_with(|| cursor.to_string());
        ProjectionMetrics::set_lag(name, 0);
        ProjectionMetrics::record_rebuild(name, progress.duration);

        tracing::info!(
            projection = name,
            processed = progress.processed_events,
            duration_ms = u64::try_from(progress.duration.as_millis()).unwrap_or(u64::MAX),
            "Projection rebuild completed"
        );
        Ok(progress)
    }
}
