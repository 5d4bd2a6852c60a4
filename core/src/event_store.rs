//! Append-only event history.
//!
//! The event store keeps every event an aggregate ever emitted, numbered per aggregate
//! from 1 with no gaps. Rows are never updated or deleted; they exist to rebuild
//! projections and for audit.
//!
//! Writes happen inside a unit of work (see `sparkle-cqrs-postgres`). This module
//! carries the row type, the replay cursor and the read-side [`EventHistory`] trait that
//! the projection builder depends on.
//!
//! # Implementations
//!
//! - `EventStoreRepository` (in `sparkle-cqrs-postgres`): production storage
//! - `InMemoryEventHistory` (in `sparkle-cqrs-testing`): fast, deterministic tests

use crate::event::{DomainEvent, EventError, EventMetadata, EventType, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during event store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    /// Another writer already appended this sequence number for the aggregate.
    ///
    /// The command should fetch a fresh `next_sequence` and retry from scratch.
    #[error("Sequence conflict on {aggregate_type}/{aggregate_id} at {sequence_number}")]
    SequenceConflict {
        /// Aggregate kind.
        aggregate_type: String,
        /// Aggregate id.
        aggregate_id: Uuid,
        /// Sequence number that was already taken.
        sequence_number: i64,
    },

    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<EventError> for EventStoreError {
    fn from(err: EventError) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// One immutable row of aggregate history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStoreEntry {
    /// Event id.
    pub id: String,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Aggregate id.
    pub aggregate_id: Uuid,
    /// Dotted event type.
    pub event_type: String,
    /// Payload schema version.
    pub event_version: i32,
    /// Per-aggregate position, starting at 1.
    pub sequence_number: i64,
    /// Payload as JSON.
    pub payload: Value,
    /// Metadata as JSON.
    pub metadata: Value,
    /// Commit time.
    pub created_at: DateTime<Utc>,
}

impl EventStoreEntry {
    /// Build a history row for `event` at `sequence_number`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the metadata cannot be encoded.
    pub fn from_event(event: &DomainEvent, sequence_number: i64) -> Result<Self, EventError> {
        Ok(Self {
            id: event.id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id,
            event_type: event.event_type.to_string(),
            event_version: event.version,
            sequence_number,
            payload: Value::Object(event.payload.clone()),
            metadata: serde_json::to_value(&event.metadata)
                .map_err(|e| EventError::Serialization(e.to_string()))?,
            created_at: event.timestamp,
        })
    }

    /// Rebuild the event this row records.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the payload is not a JSON object.
    pub fn to_event(&self) -> Result<DomainEvent, EventError> {
        let payload: Payload = match &self.payload {
            Value::Object(map) => map.clone(),
            Value::Null => Payload::new(),
            other => {
                return Err(EventError::Deserialization(format!(
                    "payload must be an object, got {other}"
                )));
            }
        };
        let metadata: EventMetadata =
            serde_json::from_value(self.metadata.clone()).unwrap_or_default();

        Ok(DomainEvent {
            id: self.id.clone(),
            event_type: EventType::parse(&self.event_type),
            version: self.event_version,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id,
            timestamp: self.created_at,
            payload,
            metadata,
        })
    }

    /// The cursor that points just past this row.
    #[must_use]
    pub const fn cursor(&self) -> ReplayCursor {
        ReplayCursor::at(self.sequence_number, self.aggregate_id)
    }
}

/// Position in a replay over one aggregate kind.
///
/// Replays walk rows ordered by `(sequence_number, aggregate_id)`. Sequence numbers are
/// per aggregate, so the aggregate id breaks ties and keyset pagination never skips a
/// row. A cursor without an aggregate id means "after every row with this sequence
/// number", which is how a plain `from_sequence` is expressed.
///
/// The string form is `"{sequence}"` or `"{sequence}:{aggregate_id}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplayCursor {
    /// Last sequence number consumed.
    pub sequence_number: i64,
    /// Last aggregate consumed at that sequence number.
    pub aggregate_id: Option<Uuid>,
}

impl ReplayCursor {
    /// The beginning of history.
    pub const START: Self = Self {
        sequence_number: 0,
        aggregate_id: None,
    };

    /// Start after every row with `sequence_number <= after`.
    #[must_use]
    pub const fn after_sequence(after: i64) -> Self {
        Self {
            sequence_number: after,
            aggregate_id: None,
        }
    }

    /// Start after one specific row.
    #[must_use]
    pub const fn at(sequence_number: i64, aggregate_id: Uuid) -> Self {
        Self {
            sequence_number,
            aggregate_id: Some(aggregate_id),
        }
    }

    /// Whether a row lies strictly after this cursor.
    #[must_use]
    pub fn precedes(&self, sequence_number: i64, aggregate_id: Uuid) -> bool {
        match self.aggregate_id {
            None => sequence_number > self.sequence_number,
            Some(after) => {
                sequence_number > self.sequence_number
                    || (sequence_number == self.sequence_number && aggregate_id > after)
            }
        }
    }
}

impl fmt::Display for ReplayCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.aggregate_id {
            Some(id) => write!(f, "{}:{id}", self.sequence_number),
            None => write!(f, "{}", self.sequence_number),
        }
    }
}

/// A position string that is not a replay cursor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid replay cursor: {0}")]
pub struct InvalidCursor(pub String);

impl FromStr for ReplayCursor {
    type Err = InvalidCursor;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (sequence, aggregate) = match raw.split_once(':') {
            Some((sequence, aggregate)) => (sequence, Some(aggregate)),
            None => (raw, None),
        };
        let sequence_number = sequence
            .trim()
            .parse::<i64>()
            .map_err(|_| InvalidCursor(raw.to_string()))?;
        let aggregate_id = aggregate
            .map(|id| Uuid::parse_str(id.trim()))
            .transpose()
            .map_err(|_| InvalidCursor(raw.to_string()))?;

        Ok(Self {
            sequence_number,
            aggregate_id,
        })
    }
}

/// Read access to the event history, used for rebuilds.
///
/// # Dyn Compatibility
///
/// Methods return `Pin<Box<dyn Future>>` so the builder can hold an
/// `Arc<dyn EventHistory>`.
pub trait EventHistory: Send + Sync {
    /// Number of rows for an aggregate kind.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] on storage failure.
    fn count_by_aggregate_type(
        &self,
        aggregate_type: &str,
    ) -> Pin<Box<dyn Future<Output = Result<i64, EventStoreError>> + Send + '_>>;

    /// Up to `limit` rows of an aggregate kind strictly after `cursor`, ordered by
    /// `(sequence_number, aggregate_id)`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] on storage failure.
    fn load_batch(
        &self,
        aggregate_type: &str,
        cursor: ReplayCursor,
        limit: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventStoreEntry>, EventStoreError>> + Send + '_>>;

    /// Full history of one aggregate, ordered by sequence number.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] on storage failure.
    fn load_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventStoreEntry>, EventStoreError>> + Send + '_>>;

    /// History of one aggregate strictly after `after`.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] on storage failure.
    fn load_after_sequence(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
        after: i64,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<EventStoreEntry>, EventStoreError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::{aggregate, make_event};
    use serde_json::json;

    #[test]
    fn test_entry_round_trip() {
        let event = make_event(
            EventType::TaskCreated,
            aggregate::TASK,
            Uuid::new_v4(),
            json!({"task_id": "t", "user_id": "u"}),
            EventMetadata::from_source("task-service"),
        );
        let entry = EventStoreEntry::from_event(&event, 3).unwrap();

        assert_eq!(entry.sequence_number, 3);
        assert_eq!(entry.to_event().unwrap(), event);
    }

    #[test]
    fn test_cursor_string_forms() {
        let id = Uuid::new_v4();
        let cursor = ReplayCursor::at(12, id);

        assert_eq!(cursor.to_string().parse::<ReplayCursor>().unwrap(), cursor);
        assert_eq!("7".parse::<ReplayCursor>().unwrap(), ReplayCursor::after_sequence(7));
        assert!("seven".parse::<ReplayCursor>().is_err());
        assert!("7:nope".parse::<ReplayCursor>().is_err());
    }

    #[test]
    fn test_cursor_ordering() {
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);

        assert!(ReplayCursor::START.precedes(1, low));
        assert!(!ReplayCursor::after_sequence(1).precedes(1, high));
        assert!(ReplayCursor::at(1, low).precedes(1, high));
        assert!(!ReplayCursor::at(1, high).precedes(1, low));
        assert!(ReplayCursor::at(1, high).precedes(2, low));
    }

    #[test]
    fn sequence_conflict_error_display() {
        let error = EventStoreError::SequenceConflict {
            aggregate_type: "Task".to_string(),
            aggregate_id: Uuid::nil(),
            sequence_number: 4,
        };
        assert!(error.to_string().contains("at 4"));
    }
}
