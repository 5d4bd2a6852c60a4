//! Projection contracts: handlers, runtime metadata and snapshots.
//!
//! # Overview
//!
//! Projections are the **query side of CQRS**. A projection is a named, side-effectful
//! function that advances a read model from events. It is fed live by a base worker
//! and can be rebuilt at any time by replaying the event store.
//!
//! ```text
//! Write Side:                       Read Side:
//! ┌──────────────────┐             ┌──────────────────────┐
//! │  event_store     │── replay ──►│  ProjectionHandler   │──► read-model store
//! │  event_outbox    │             │  (community, task,   │
//! └──────────────────┘             │   galaxy)            │
//!          │                       └──────────────────────┘
//!          │ publisher                         ▲
//!          ▼                                   │ base worker
//! ┌──────────────────────────────────────────────┐
//! │        cqrs:stream:* (consumer groups)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Status machine
//!
//! ```text
//!   active ◄──► paused ◄──► rebuilding ◄──► active
//!      │           │             │
//!      └───────────┴─────────────┴──► error ──► rebuilding (reset) | active (resume)
//! ```
//!
//! Operators drive `active`, `paused` and `rebuilding`. `error` is entered automatically
//! when a reset or rebuild fails and is left only through another reset or a resume.
//! While a rebuild is running, only the rebuild itself moves the status.

use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use uuid::Uuid;

/// Error type for projection operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectionError {
    /// No projection with this name is registered.
    #[error("Projection not found: {0}")]
    NotFound(String),

    /// A projection with this name is already registered.
    #[error("Projection already registered: {0}")]
    AlreadyRegistered(String),

    /// The requested status change is not allowed.
    #[error("Invalid status transition for {name}: {from} -> {to}")]
    InvalidTransition {
        /// Projection name.
        name: String,
        /// Current status.
        from: ProjectionStatus,
        /// Requested status.
        to: ProjectionStatus,
    },

    /// A stored position cannot be interpreted.
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Event processing error
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// The projection cannot load or capture snapshots.
    #[error("Snapshots not supported by projection: {0}")]
    SnapshotUnsupported(String),

    /// A rebuild was cancelled before it finished.
    #[error("Rebuild cancelled: {0}")]
    Cancelled(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Boxed future returned by projection traits.
pub type ProjectionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Runtime status of a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    /// Consuming live events.
    Active,
    /// Stopped by an operator; messages wait in the stream.
    Paused,
    /// Unrecoverable failure, waiting for a reset or resume.
    Error,
    /// Being replayed from the event store.
    Rebuilding,
}

impl ProjectionStatus {
    /// Stored name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Rebuilding => "rebuilding",
        }
    }

    /// Value exported on the status gauge.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Active => 1.0,
            Self::Paused => 0.0,
            Self::Rebuilding => -1.0,
            Self::Error => -2.0,
        }
    }

    /// Whether a projection in this status may move to `next`.
    ///
    /// Staying put is always allowed. The only refused move is `error -> paused`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        !matches!((self, next), (Self::Error, Self::Paused))
    }
}

impl fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionStatus {
    type Err = ProjectionError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "error" => Ok(Self::Error),
            "rebuilding" => Ok(Self::Rebuilding),
            other => Err(ProjectionError::Serialization(format!(
                "unknown projection status '{other}'"
            ))),
        }
    }
}

/// Persisted runtime state of one projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionInfo {
    /// Unique projection name.
    pub name: String,
    /// Current status.
    pub status: ProjectionStatus,
    /// Stream message id (live) or replay cursor (rebuild).
    pub last_processed_position: Option<String>,
    /// When the position last moved.
    pub last_processed_at: Option<DateTime<Utc>>,
    /// Read-model schema version.
    pub version: i32,
    /// Last error message, set with the `error` status.
    pub error_message: Option<String>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl ProjectionInfo {
    /// A fresh, active projection with no position.
    #[must_use]
    pub fn new(name: impl Into<String>, version: i32) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            status: ProjectionStatus::Active,
            last_processed_position: None,
            last_processed_at: None,
            version,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A captured read-model state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: Uuid,
    /// Projection the data belongs to.
    pub projection_name: String,
    /// Aggregate scope, if the snapshot covers one aggregate.
    pub aggregate_id: Option<Uuid>,
    /// Projection-specific blob.
    pub data: Vec<u8>,
    /// Replay position the snapshot was taken at.
    pub stream_position: String,
    /// Capture time.
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    /// A new projection-wide snapshot.
    #[must_use]
    pub fn new(projection_name: impl Into<String>, data: Vec<u8>, position: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            projection_name: projection_name.into(),
            aggregate_id: None,
            data,
            stream_position: position.into(),
            created_at: Utc::now(),
        }
    }
}

/// A projection's event handler.
///
/// # Contract
///
/// - `handle` receives an event serialized as JSON. Unknown event types are ignored.
/// - `handle` must converge when re-run: rebuilds replay events the live worker already
///   applied.
/// - `reset` removes every key the projection ever writes.
pub trait ProjectionHandler: Send + Sync {
    /// Unique projection name.
    fn name(&self) -> &str;

    /// Aggregate kind whose history rebuilds this projection.
    fn aggregate_type(&self) -> &str;

    /// Apply one serialized event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::EventProcessing`] or [`ProjectionError::Storage`].
    fn handle<'a>(&'a self, event_bytes: &'a [u8]) -> ProjectionFuture<'a, ()>;

    /// Drop every key this projection owns.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    fn reset(&self) -> ProjectionFuture<'_, ()>;

    /// Serialize the current read-model state.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::SnapshotUnsupported`] unless overridden.
    fn capture_snapshot(&self) -> ProjectionFuture<'_, Vec<u8>> {
        let name = self.name().to_string();
        Box::pin(async move { Err(ProjectionError::SnapshotUnsupported(name)) })
    }

    /// Load a blob produced by [`ProjectionHandler::capture_snapshot`].
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::SnapshotUnsupported`] unless overridden.
    fn restore_snapshot<'a>(&'a self, data: &'a [u8]) -> ProjectionFuture<'a, ()> {
        let _ = data;
        let name = self.name().to_string();
        Box::pin(async move { Err(ProjectionError::SnapshotUnsupported(name)) })
    }
}

/// Storage for [`ProjectionInfo`] rows.
pub trait ProjectionMetadataStore: Send + Sync {
    /// Insert an active row for `name` unless one exists, then return the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    fn ensure<'a>(&'a self, name: &'a str, version: i32) -> ProjectionFuture<'a, ProjectionInfo>;

    /// Read one row.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    fn get<'a>(&'a self, name: &'a str) -> ProjectionFuture<'a, Option<ProjectionInfo>>;

    /// Every row, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    fn list(&self) -> ProjectionFuture<'_, Vec<ProjectionInfo>>;

    /// Record a new position and stamp `last_processed_at`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] for unknown names.
    fn update_position<'a>(&'a self, name: &'a str, position: &'a str) -> ProjectionFuture<'a, ()>;

    /// Set the status. `message` replaces the stored error message.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] for unknown names.
    fn set_status<'a>(
        &'a self,
        name: &'a str,
        status: ProjectionStatus,
        message: Option<&'a str>,
    ) -> ProjectionFuture<'a, ()>;

    /// Forget the position.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] for unknown names.
    fn clear_position<'a>(&'a self, name: &'a str) -> ProjectionFuture<'a, ()>;
}

/// Storage for [`Snapshot`]s.
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    fn save(&self, snapshot: Snapshot) -> ProjectionFuture<'_, ()>;

    /// Most recent snapshot of a projection.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    fn latest<'a>(&'a self, projection_name: &'a str) -> ProjectionFuture<'a, Option<Snapshot>>;

    /// Delete every snapshot of a projection, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    fn delete_all<'a>(&'a self, projection_name: &'a str) -> ProjectionFuture<'a, u64>;

    /// Number of snapshots, for one projection or all of them.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    fn count<'a>(&'a self, projection_name: Option<&'a str>) -> ProjectionFuture<'a, i64>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_and_gauge() {
        for status in [
            ProjectionStatus::Active,
            ProjectionStatus::Paused,
            ProjectionStatus::Error,
            ProjectionStatus::Rebuilding,
        ] {
            assert_eq!(status.as_str().parse::<ProjectionStatus>().unwrap(), status);
        }
        assert!("stopped".parse::<ProjectionStatus>().is_err());
        assert!((ProjectionStatus::Error.gauge_value() + 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_error_is_left_only_by_reset_or_resume() {
        use ProjectionStatus::{Active, Error, Paused, Rebuilding};

        assert!(Error.can_transition_to(Rebuilding));
        assert!(Error.can_transition_to(Active));
        assert!(!Error.can_transition_to(Paused));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Rebuilding));
        assert!(Rebuilding.can_transition_to(Error));
    }
}
