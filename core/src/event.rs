//! Domain event envelope and the event type registry.
//!
//! A [`DomainEvent`] is the unit that flows from the outbox, through the stream bus, into
//! projection handlers. Events are immutable facts: once constructed they are only ever
//! copied, serialized, or replayed.
//!
//! # Serialization
//!
//! Events serialize to JSON with stable field names (`id`, `type`, `version`,
//! `aggregate_type`, `aggregate_id`, `timestamp`, `payload`, `metadata`). Timestamps are
//! RFC 3339 in UTC with nanosecond precision.
//!
//! # Example
//!
//! ```
//! use sparkle_cqrs_core::event::{make_event, EventMetadata, EventType};
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! let task_id = Uuid::new_v4();
//! let event = make_event(
//!     EventType::TaskCompleted,
//!     "Task",
//!     task_id,
//!     json!({ "task_id": task_id.to_string(), "user_id": "u-1" }),
//!     EventMetadata::default(),
//! );
//!
//! assert_eq!(event.version, 1);
//! assert_eq!(event.event_type.as_str(), "task.completed");
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Structured event payload.
pub type Payload = Map<String, Value>;

/// Errors raised while converting events to and from their stored forms.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Failed to serialize an event component.
    #[error("Failed to serialize event: {0}")]
    Serialization(String),

    /// Failed to deserialize an event component.
    #[error("Failed to deserialize event: {0}")]
    Deserialization(String),
}

/// Aggregate kinds owned by the command services.
pub mod aggregate {
    /// Community post.
    pub const POST: &str = "Post";
    /// Study task.
    pub const TASK: &str = "Task";
    /// Study plan.
    pub const PLAN: &str = "Plan";
    /// Knowledge-graph node.
    pub const KNOWLEDGE_NODE: &str = "KnowledgeNode";
    /// Chat session.
    pub const CHAT_SESSION: &str = "ChatSession";
    /// User account.
    pub const USER: &str = "User";
    /// Push notification.
    pub const PUSH: &str = "Push";
}

/// Dotted event type tag.
///
/// Known types are enumerated so routing and payload validation are exhaustive.
/// Anything else is carried verbatim in [`EventType::Other`] and routed to the
/// default stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// `community.post.created`
    PostCreated,
    /// `community.post.updated`
    PostUpdated,
    /// `community.post.deleted`
    PostDeleted,
    /// `community.post.liked`
    PostLiked,
    /// `community.post.unliked`
    PostUnliked,
    /// `task.created`
    TaskCreated,
    /// `task.updated`
    TaskUpdated,
    /// `task.started`
    TaskStarted,
    /// `task.completed`
    TaskCompleted,
    /// `task.abandoned`
    TaskAbandoned,
    /// `task.deleted`
    TaskDeleted,
    /// `plan.created`
    PlanCreated,
    /// `plan.updated`
    PlanUpdated,
    /// `plan.completed`
    PlanCompleted,
    /// `plan.deleted`
    PlanDeleted,
    /// `galaxy.node.created`
    NodeCreated,
    /// `galaxy.node.unlocked`
    NodeUnlocked,
    /// `galaxy.node.expanded`
    NodeExpanded,
    /// `galaxy.mastery.updated`
    MasteryUpdated,
    /// `galaxy.relation.created`
    RelationCreated,
    /// `galaxy.study.recorded`
    StudyRecorded,
    /// `chat.message.sent`
    ChatMessageSent,
    /// `chat.message.received`
    ChatMessageReceived,
    /// `chat.session.created`
    ChatSessionCreated,
    /// `chat.session.ended`
    ChatSessionEnded,
    /// `user.created`
    UserCreated,
    /// `user.updated`
    UserUpdated,
    /// `user.deleted`
    UserDeleted,
    /// `user.status.changed`
    UserStatusChanged,
    /// `push.scheduled`
    PushScheduled,
    /// `push.sent`
    PushSent,
    /// `push.delivered`
    PushDelivered,
    /// `push.clicked`
    PushClicked,
    /// Any type outside the registry.
    Other(String),
}

impl EventType {
    /// Every registered event type.
    pub const KNOWN: [Self; 33] = [
        Self::PostCreated,
        Self::PostUpdated,
        Self::PostDeleted,
        Self::PostLiked,
        Self::PostUnliked,
        Self::TaskCreated,
        Self::TaskUpdated,
        Self::TaskStarted,
        Self::TaskCompleted,
        Self::TaskAbandoned,
        Self::TaskDeleted,
        Self::PlanCreated,
        Self::PlanUpdated,
        Self::PlanCompleted,
        Self::PlanDeleted,
        Self::NodeCreated,
        Self::NodeUnlocked,
        Self::NodeExpanded,
        Self::MasteryUpdated,
        Self::RelationCreated,
        Self::StudyRecorded,
        Self::ChatMessageSent,
        Self::ChatMessageReceived,
        Self::ChatSessionCreated,
        Self::ChatSessionEnded,
        Self::UserCreated,
        Self::UserUpdated,
        Self::UserDeleted,
        Self::UserStatusChanged,
        Self::PushScheduled,
        Self::PushSent,
        Self::PushDelivered,
        Self::PushClicked,
    ];

    /// The dotted wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::PostCreated => "community.post.created",
            Self::PostUpdated => "community.post.updated",
            Self::PostDeleted => "community.post.deleted",
            Self::PostLiked => "community.post.liked",
            Self::PostUnliked => "community.post.unliked",
            Self::TaskCreated => "task.created",
            Self::TaskUpdated => "task.updated",
            Self::TaskStarted => "task.started",
            Self::TaskCompleted => "task.completed",
            Self::TaskAbandoned => "task.abandoned",
            Self::TaskDeleted => "task.deleted",
            Self::PlanCreated => "plan.created",
            Self::PlanUpdated => "plan.updated",
            Self::PlanCompleted => "plan.completed",
            Self::PlanDeleted => "plan.deleted",
            Self::NodeCreated => "galaxy.node.created",
            Self::NodeUnlocked => "galaxy.node.unlocked",
            Self::NodeExpanded => "galaxy.node.expanded",
            Self::MasteryUpdated => "galaxy.mastery.updated",
            Self::RelationCreated => "galaxy.relation.created",
            Self::StudyRecorded => "galaxy.study.recorded",
            Self::ChatMessageSent => "chat.message.sent",
            Self::ChatMessageReceived => "chat.message.received",
            Self::ChatSessionCreated => "chat.session.created",
            Self::ChatSessionEnded => "chat.session.ended",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::UserDeleted => "user.deleted",
            Self::UserStatusChanged => "user.status.changed",
            Self::PushScheduled => "push.scheduled",
            Self::PushSent => "push.sent",
            Self::PushDelivered => "push.delivered",
            Self::PushClicked => "push.clicked",
            Self::Other(name) => name,
        }
    }

    /// Parse a wire name. Unregistered names become [`EventType::Other`].
    #[must_use]
    pub fn parse(name: &str) -> Self {
        Self::KNOWN
            .iter()
            .find(|known| known.as_str() == name)
            .cloned()
            .unwrap_or_else(|| Self::Other(name.to_string()))
    }

    /// Aggregate kind that emits this type, if registered.
    #[must_use]
    pub const fn aggregate_type(&self) -> Option<&'static str> {
        match self {
            Self::PostCreated
            | Self::PostUpdated
            | Self::PostDeleted
            | Self::PostLiked
            | Self::PostUnliked => Some(aggregate::POST),
            Self::TaskCreated
            | Self::TaskUpdated
            | Self::TaskStarted
            | Self::TaskCompleted
            | Self::TaskAbandoned
            | Self::TaskDeleted => Some(aggregate::TASK),
            Self::PlanCreated | Self::PlanUpdated | Self::PlanCompleted | Self::PlanDeleted => {
                Some(aggregate::PLAN)
            }
            Self::NodeCreated
            | Self::NodeUnlocked
            | Self::NodeExpanded
            | Self::MasteryUpdated
            | Self::RelationCreated
            | Self::StudyRecorded => Some(aggregate::KNOWLEDGE_NODE),
            Self::ChatMessageSent
            | Self::ChatMessageReceived
            | Self::ChatSessionCreated
            | Self::ChatSessionEnded => Some(aggregate::CHAT_SESSION),
            Self::UserCreated | Self::UserUpdated | Self::UserDeleted | Self::UserStatusChanged => {
                Some(aggregate::USER)
            }
            Self::PushScheduled | Self::PushSent | Self::PushDelivered | Self::PushClicked => {
                Some(aggregate::PUSH)
            }
            Self::Other(_) => None,
        }
    }

    /// Whether this type is in the registry.
    #[must_use]
    pub const fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventType {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<&str> for EventType {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}

impl From<EventType> for String {
    fn from(event_type: EventType) -> Self {
        event_type.as_str().to_string()
    }
}

/// Tracing and causality metadata attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Distributed trace id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// Span id within the trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    /// User that triggered the command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Correlates events that belong to one logical operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Id of the event or command that caused this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    /// Emitting service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl EventMetadata {
    /// Metadata stamped with the emitting service name.
    #[must_use]
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Self::default()
        }
    }

    /// Attach the acting user.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Attach a causation id.
    #[must_use]
    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Attach trace and span ids.
    #[must_use]
    pub fn with_trace(mut self, trace_id: impl Into<String>, span_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self.span_id = Some(span_id.into());
        self
    }
}

/// The event envelope. Identity is [`DomainEvent::id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique event id.
    pub id: String,
    /// Dotted type tag.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Payload schema version, at least 1.
    #[serde(default = "default_version")]
    pub version: i32,
    /// Aggregate kind.
    pub aggregate_type: String,
    /// Aggregate id.
    pub aggregate_id: Uuid,
    /// UTC creation time.
    #[serde(with = "rfc3339_nanos")]
    pub timestamp: DateTime<Utc>,
    /// Structured payload.
    #[serde(default)]
    pub payload: Payload,
    /// Trace and causality metadata.
    #[serde(default)]
    pub metadata: EventMetadata,
}

const fn default_version() -> i32 {
    1
}

/// Build an event with a fresh id and the current UTC time.
///
/// Non-object payloads are wrapped under a `value` key so every payload is a map.
#[must_use]
pub fn make_event(
    event_type: EventType,
    aggregate_type: impl Into<String>,
    aggregate_id: Uuid,
    payload: Value,
    metadata: EventMetadata,
) -> DomainEvent {
    let payload = match payload {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };

    DomainEvent {
        id: Uuid::new_v4().to_string(),
        event_type,
        version: 1,
        aggregate_type: aggregate_type.into(),
        aggregate_id,
        timestamp: Utc::now(),
        payload,
        metadata,
    }
}

impl DomainEvent {
    /// Override the schema version.
    #[must_use]
    pub const fn with_version(mut self, version: i32) -> Self {
        self.version = version;
        self
    }

    /// Override the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Read a string field from the payload.
    #[must_use]
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }

    /// Read a numeric field from the payload.
    #[must_use]
    pub fn payload_f64(&self, field: &str) -> Option<f64> {
        self.payload.get(field).and_then(Value::as_f64)
    }

    /// Serialize to JSON bytes, the form projection handlers consume.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Serialization`] if the payload cannot be encoded.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(self).map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Deserialize from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Deserialization`] on malformed input.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::Deserialization(e.to_string()))
    }
}

/// Format a timestamp the way it travels on the wire.
#[must_use]
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 timestamp into UTC.
///
/// # Errors
///
/// Returns the chrono parse error for malformed input.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

mod rfc3339_nanos {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_event_type_names_round_trip() {
        for known in EventType::KNOWN {
            assert_eq!(EventType::parse(known.as_str()), known);
        }
        assert_eq!(
            EventType::parse("billing.invoice.paid"),
            EventType::Other("billing.invoice.paid".to_string())
        );
    }

    #[test]
    fn test_event_type_aggregates() {
        assert_eq!(EventType::PostLiked.aggregate_type(), Some("Post"));
        assert_eq!(EventType::StudyRecorded.aggregate_type(), Some("KnowledgeNode"));
        assert_eq!(EventType::UserStatusChanged.aggregate_type(), Some("User"));
        assert_eq!(EventType::parse("x.y").aggregate_type(), None);
    }

    #[test]
    fn test_make_event_fills_identity() {
        let aggregate_id = Uuid::new_v4();
        let a = make_event(
            EventType::PostCreated,
            aggregate::POST,
            aggregate_id,
            json!({"post_id": aggregate_id.to_string()}),
            EventMetadata::from_source("community-service"),
        );
        let b = make_event(
            EventType::PostCreated,
            aggregate::POST,
            aggregate_id,
            Value::Null,
            EventMetadata::default(),
        );

        assert_ne!(a.id, b.id);
        assert_eq!(a.version, 1);
        assert!(b.payload.is_empty());
        assert_eq!(a.metadata.source.as_deref(), Some("community-service"));
    }

    #[test]
    fn test_json_uses_stable_field_names() {
        let event = make_event(
            EventType::TaskStarted,
            aggregate::TASK,
            Uuid::new_v4(),
            json!({"task_id": "t"}),
            EventMetadata::default().with_user("u-1"),
        );
        let value: Value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["type"], "task.started");
        assert_eq!(value["metadata"]["user_id"], "u-1");
        assert!(value["metadata"].get("trace_id").is_none());
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn test_missing_version_defaults_to_one() {
        let raw = json!({
            "id": "e-1",
            "type": "task.created",
            "aggregate_type": "Task",
            "aggregate_id": Uuid::nil().to_string(),
            "timestamp": "2025-01-02T03:04:05.123456789Z"
        });
        let event: DomainEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.version, 1);
        assert_eq!(event.timestamp.timestamp_subsec_nanos(), 123_456_789);
    }

    proptest! {
        #[test]
        fn prop_json_round_trip(
            nanos in 0u32..1_000_000_000,
            secs in 0i64..4_000_000_000,
            title in "[a-z ]{0,16}",
            version in 1i32..5,
        ) {
            let ts = DateTime::from_timestamp(secs, nanos).unwrap();
            let event = make_event(
                EventType::TaskUpdated,
                aggregate::TASK,
                Uuid::new_v4(),
                json!({"task_id": "t-1", "title": title}),
                EventMetadata::default().with_correlation("c-1"),
            )
            .with_version(version)
            .with_timestamp(ts);

            let bytes = event.to_json_bytes().unwrap();
            prop_assert_eq!(DomainEvent::from_json_bytes(&bytes).unwrap(), event);
        }
    }
}
