//! Stream entry codec.
//!
//! On the stream every event is a flat map of string fields: `id`, `type`, `version`,
//! `aggregate_type`, `aggregate_id`, `timestamp`, `payload` (JSON) and `metadata` (JSON).
//! Unknown fields are ignored, which lets the DLQ add `_retry_count` on republish.

use crate::event::{DomainEvent, EventMetadata, EventType, Payload, format_timestamp, parse_timestamp};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Field added by the DLQ when a message is republished.
pub const RETRY_COUNT_FIELD: &str = "_retry_count";

/// A raw entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Provider-assigned message id (e.g. `1700000000000-0`).
    pub id: String,
    /// Flat field map.
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    /// Create a message from its id and fields.
    #[must_use]
    pub const fn new(id: String, fields: HashMap<String, String>) -> Self {
        Self { id, fields }
    }

    /// Read a field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Decode the event carried by this message.
    ///
    /// # Errors
    ///
    /// See [`decode`].
    pub fn decode(&self) -> Result<DomainEvent, ParseError> {
        decode(&self.fields)
    }
}

/// A stream entry that cannot be turned into a [`DomainEvent`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A required field is absent or empty.
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    /// A field is present but malformed.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Encode an event as stream fields, in a stable order.
///
/// # Errors
///
/// Returns [`crate::event::EventError::Serialization`] if payload or metadata cannot be
/// encoded.
pub fn encode(event: &DomainEvent) -> Result<Vec<(String, String)>, crate::event::EventError> {
    let payload = serde_json::to_string(&event.payload)
        .map_err(|e| crate::event::EventError::Serialization(e.to_string()))?;
    let metadata = serde_json::to_string(&event.metadata)
        .map_err(|e| crate::event::EventError::Serialization(e.to_string()))?;

    Ok(vec![
        ("id".to_string(), event.id.clone()),
        ("type".to_string(), event.event_type.to_string()),
        ("version".to_string(), event.version.to_string()),
        ("aggregate_type".to_string(), event.aggregate_type.clone()),
        ("aggregate_id".to_string(), event.aggregate_id.to_string()),
        ("timestamp".to_string(), format_timestamp(&event.timestamp)),
        ("payload".to_string(), payload),
        ("metadata".to_string(), metadata),
    ])
}

fn required<'a>(fields: &'a HashMap<String, String>, name: &'static str) -> Result<&'a str, ParseError> {
    match fields.get(name).map(String::as_str) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ParseError::MissingField(name)),
    }
}

/// Decode stream fields into an event.
///
/// `version` defaults to 1 when absent or unparsable. An empty `payload` decodes to an
/// empty map. Unparsable `metadata` falls back to empty metadata.
///
/// # Errors
///
/// Returns [`ParseError`] when `id`, `type`, `aggregate_type`, `aggregate_id` or
/// `timestamp` is missing, when `aggregate_id` is not a UUID, when `timestamp` is not
/// RFC 3339, or when `payload` is not a JSON object.
pub fn decode(fields: &HashMap<String, String>) -> Result<DomainEvent, ParseError> {
    let id = required(fields, "id")?;
    let event_type = required(fields, "type")?;
    let aggregate_type = required(fields, "aggregate_type")?;
    let aggregate_id = Uuid::parse_str(required(fields, "aggregate_id")?).map_err(|e| {
        ParseError::InvalidField {
            field: "aggregate_id",
            reason: e.to_string(),
        }
    })?;
    let timestamp =
        parse_timestamp(required(fields, "timestamp")?).map_err(|e| ParseError::InvalidField {
            field: "timestamp",
            reason: e.to_string(),
        })?;

    let version = fields
        .get("version")
        .and_then(|v| v.parse::<i32>().ok())
        .filter(|v| *v >= 1)
        .unwrap_or(1);

    let payload = match fields.get("payload").map(String::as_str) {
        None | Some("") => Payload::new(),
        Some(raw) => serde_json::from_str::<Payload>(raw).map_err(|e| ParseError::InvalidField {
            field: "payload",
            reason: e.to_string(),
        })?,
    };

    let metadata = fields
        .get("metadata")
        .and_then(|raw| serde_json::from_str::<EventMetadata>(raw).ok())
        .unwrap_or_default();

    Ok(DomainEvent {
        id: id.to_string(),
        event_type: EventType::parse(event_type),
        version,
        aggregate_type: aggregate_type.to_string(),
        aggregate_id,
        timestamp,
        payload,
        metadata,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::event::{EventMetadata, aggregate, make_event};
    use proptest::prelude::*;
    use serde_json::json;

    fn fields_of(event: &DomainEvent) -> HashMap<String, String> {
        encode(event).unwrap().into_iter().collect()
    }

    fn sample() -> DomainEvent {
        let node = Uuid::new_v4();
        make_event(
            EventType::NodeUnlocked,
            aggregate::KNOWLEDGE_NODE,
            node,
            json!({"node_id": node.to_string(), "user_id": "u-9"}),
            EventMetadata::from_source("galaxy-service").with_trace("t", "s"),
        )
    }

    #[test]
    fn test_decode_encoded_event() {
        let event = sample();
        assert_eq!(decode(&fields_of(&event)).unwrap(), event);
    }

    #[test]
    fn test_missing_aggregate_id_is_rejected() {
        let mut fields = fields_of(&sample());
        fields.remove("aggregate_id");
        assert_eq!(decode(&fields), Err(ParseError::MissingField("aggregate_id")));
    }

    #[test]
    fn test_malformed_aggregate_id_is_rejected() {
        let mut fields = fields_of(&sample());
        fields.insert("aggregate_id".into(), "not-a-uuid".into());
        assert!(matches!(
            decode(&fields),
            Err(ParseError::InvalidField { field: "aggregate_id", .. })
        ));
    }

    #[test]
    fn test_bad_payload_is_rejected_but_bad_metadata_is_tolerated() {
        let mut fields = fields_of(&sample());
        fields.insert("metadata".into(), "{oops".into());
        assert_eq!(decode(&fields).unwrap().metadata, EventMetadata::default());

        fields.insert("payload".into(), "[1, 2".into());
        assert!(matches!(
            decode(&fields),
            Err(ParseError::InvalidField { field: "payload", .. })
        ));
    }

    #[test]
    fn test_version_defaults_and_unknown_fields_are_ignored() {
        let mut fields = fields_of(&sample());
        fields.remove("version");
        fields.insert(RETRY_COUNT_FIELD.into(), "2".into());
        fields.insert("shard".into(), "7".into());
        assert_eq!(decode(&fields).unwrap().version, 1);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(keys in proptest::collection::vec("[a-z_]{1,12}", 0..8),
                                    values in proptest::collection::vec(".{0,24}", 0..8)) {
            let fields: HashMap<String, String> = keys.into_iter().zip(values).collect();
            let _ = decode(&fields);
        }
    }
}
