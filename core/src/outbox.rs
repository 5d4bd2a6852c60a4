//! Outbox and event-store row types, and their conversions to and from [`DomainEvent`].

use crate::event::{DomainEvent, EventError, EventMetadata, EventType, Payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pending event written in the same transaction as the business change.
///
/// `created_at <= published_at` whenever `published_at` is set. Rows with no
/// `published_at` are polled in `created_at` order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
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
    /// JSON-encoded payload.
    pub payload: Vec<u8>,
    /// JSON-encoded metadata.
    pub metadata: Vec<u8>,
    /// Database-assigned monotonic sequence; `None` before insert.
    pub sequence_number: Option<i64>,
    /// Time the command committed the event.
    pub created_at: DateTime<Utc>,
    /// Time the publisher relayed it.
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    /// Convert an event into an unpublished outbox row.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if payload or metadata cannot be encoded.
    pub fn from_event(event: &DomainEvent) -> Result<Self, EventError> {
        Ok(Self {
            id: event.id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id,
            event_type: event.event_type.to_string(),
            event_version: event.version,
            payload: serde_json::to_vec(&event.payload)
                .map_err(|e| EventError::Serialization(e.to_string()))?,
            metadata: serde_json::to_vec(&event.metadata)
                .map_err(|e| EventError::Serialization(e.to_string()))?,
            sequence_number: None,
            created_at: event.timestamp,
            published_at: None,
        })
    }

    /// Rebuild the event this row carries.
    ///
    /// Empty or unparsable metadata decodes to empty metadata.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] if the payload is not a JSON object.
    pub fn to_event(&self) -> Result<DomainEvent, EventError> {
        let payload: Payload = if self.payload.is_empty() {
            Payload::new()
        } else {
            serde_json::from_slice(&self.payload)
                .map_err(|e| EventError::Deserialization(e.to_string()))?
        };
        let metadata: EventMetadata = serde_json::from_slice(&self.metadata).unwrap_or_default();

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

    /// Whether the publisher has relayed this row.
    #[must_use]
    pub const fn is_published(&self) -> bool {
        self.published_at.is_some()
    }
}

/// Convert an event into an outbox row.
///
/// # Errors
///
/// See [`OutboxEntry::from_event`].
pub fn to_outbox(event: &DomainEvent) -> Result<OutboxEntry, EventError> {
    OutboxEntry::from_event(event)
}

/// Convert an outbox row back into its event.
///
/// # Errors
///
/// See [`OutboxEntry::to_event`].
pub fn to_event(entry: &OutboxEntry) -> Result<DomainEvent, EventError> {
    entry.to_event()
}
