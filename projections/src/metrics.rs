//! Projection gauges and histograms.
//!
//! Descriptions and histogram buckets are registered by the runtime's Prometheus
//! recorder; this module only emits.

use metrics::{gauge, histogram};
use sparkle_cqrs_core::projection::ProjectionStatus;
use std::time::Duration;

/// Projection metrics.
pub struct ProjectionMetrics;

impl ProjectionMetrics {
    /// Publish the status gauge (1 active, 0 paused, -1 rebuilding, -2 error).
    pub fn set_status(projection: &str, status: ProjectionStatus) {
        gauge!("sparkle_cqrs_projection_status", "projection" => projection.to_string())
            .set(status.gauge_value());
    }

    /// Events the projection still has to apply.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_lag(projection: &str, behind: i64) {
        gauge!("sparkle_cqrs_projection_lag", "projection" => projection.to_string())
            .set(behind.max(0) as f64);
    }

    /// Record a finished rebuild.
    pub fn record_rebuild(projection: &str, duration: Duration) {
        histogram!(
            "sparkle_cqrs_projection_rebuild_duration_seconds",
            "projection" => projection.to_string()
        )
        .record(duration.as_secs_f64());
    }

    /// Rows of history for an aggregate type.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_event_store_size(aggregate_type: &str, rows: i64) {
        gauge!("sparkle_cqrs_event_store_size", "aggregate_type" => aggregate_type.to_string())
            .set(rows as f64);
    }

    /// Stored snapshots of a projection.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_snapshot_count(projection: &str, count: i64) {
        gauge!("sparkle_cqrs_snapshot_count", "projection" => projection.to_string())
            .set(count as f64);
    }
}
