//! Payload schema registry.
//!
//! Payloads stay structured maps, but each registered event type declares the fields it
//! cannot live without. Validation runs when an event enters the outbox and again when a
//! worker receives it.

use crate::event::{EventType, Payload};
use serde_json::Value;
use thiserror::Error;

/// A payload that does not satisfy its type's schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is absent or null.
    #[error("{event_type}: missing required payload field '{field}'")]
    MissingField {
        /// Event type being validated.
        event_type: String,
        /// Missing field.
        field: &'static str,
    },

    /// A field is present with the wrong JSON type.
    #[error("{event_type}: payload field '{field}' must be {expected}")]
    WrongType {
        /// Event type being validated.
        event_type: String,
        /// Offending field.
        field: &'static str,
        /// Expected JSON type.
        expected: &'static str,
    },
}

#[derive(Clone, Copy)]
enum Kind {
    Text,
    Number,
}

impl Kind {
    const fn describe(self) -> &'static str {
        match self {
            Self::Text => "a string",
            Self::Number => "a number",
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Text => value.is_string(),
            Self::Number => value.is_number(),
        }
    }
}

const POST: &[(&str, Kind)] = &[("post_id", Kind::Text)];
const POST_CREATED: &[(&str, Kind)] = &[("post_id", Kind::Text), ("user_id", Kind::Text)];
const TASK: &[(&str, Kind)] = &[("task_id", Kind::Text), ("user_id", Kind::Text)];
const TASK_UPDATED: &[(&str, Kind)] = &[("task_id", Kind::Text)];
const PLAN: &[(&str, Kind)] = &[("plan_id", Kind::Text)];
const NODE: &[(&str, Kind)] = &[("node_id", Kind::Text)];
const USER_NODE: &[(&str, Kind)] = &[("node_id", Kind::Text), ("user_id", Kind::Text)];
const MASTERY: &[(&str, Kind)] = &[
    ("node_id", Kind::Text),
    ("user_id", Kind::Text),
    ("mastery", Kind::Number),
];
const RELATION: &[(&str, Kind)] = &[("source_id", Kind::Text), ("target_id", Kind::Text)];
const STUDY: &[(&str, Kind)] = &[
    ("user_id", Kind::Text),
    ("node_id", Kind::Text),
    ("minutes", Kind::Number),
];
const CHAT: &[(&str, Kind)] = &[("session_id", Kind::Text)];
const USER: &[(&str, Kind)] = &[("user_id", Kind::Text)];
const PUSH: &[(&str, Kind)] = &[("push_id", Kind::Text)];
const NONE: &[(&str, Kind)] = &[];

fn schema(event_type: &EventType) -> &'static [(&'static str, Kind)] {
    match event_type {
        EventType::PostCreated => POST_CREATED,
        EventType::PostUpdated
        | EventType::PostDeleted
        | EventType::PostLiked
        | EventType::PostUnliked => POST,
        EventType::TaskUpdated => TASK_UPDATED,
        EventType::TaskCreated
        | EventType::TaskStarted
        | EventType::TaskCompleted
        | EventType::TaskAbandoned
        | EventType::TaskDeleted => TASK,
        EventType::PlanCreated
        | EventType::PlanUpdated
        | EventType::PlanCompleted
        | EventType::PlanDeleted => PLAN,
        EventType::NodeCreated => NODE,
        EventType::NodeUnlocked | EventType::NodeExpanded => USER_NODE,
        EventType::MasteryUpdated => MASTERY,
        EventType::RelationCreated => RELATION,
        EventType::StudyRecorded => STUDY,
        EventType::ChatMessageSent
        | EventType::ChatMessageReceived
        | EventType::ChatSessionCreated
        | EventType::ChatSessionEnded => CHAT,
        EventType::UserCreated
        | EventType::UserUpdated
        | EventType::UserDeleted
        | EventType::UserStatusChanged => USER,
        EventType::PushScheduled
        | EventType::PushSent
        | EventType::PushDelivered
        | EventType::PushClicked => PUSH,
        EventType::Other(_) => NONE,
    }
}

/// Names of the fields a type requires.
#[must_use]
pub fn required_fields(event_type: &EventType) -> Vec<&'static str> {
    schema(event_type).iter().map(|(field, _)| *field).collect()
}

/// Check a payload against its type's schema.
///
/// Unregistered types have no schema and always pass.
///
/// # Errors
///
/// Returns the first [`ValidationError`] found, in declaration order.
pub fn validate_payload(event_type: &EventType, payload: &Payload) -> Result<(), ValidationError> {
    for (field, kind) in schema(event_type) {
        match payload.get(*field) {
            None | Some(Value::Null) => {
                return Err(ValidationError::MissingField {
                    event_type: event_type.to_string(),
                    field: *field,
                });
            }
            Some(value) if !kind.accepts(value) => {
                return Err(ValidationError::WrongType {
                    event_type: event_type.to_string(),
                    field: *field,
                    expected: kind.describe(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_valid_payload_passes() {
        let payload = map(json!({"task_id": "t", "user_id": "u", "extra": 1}));
        assert!(validate_payload(&EventType::TaskCompleted, &payload).is_ok());
    }

    #[test]
    fn test_missing_field_is_reported() {
        let payload = map(json!({"task_id": "t"}));
        let err = validate_payload(&EventType::TaskStarted, &payload).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingField {
                event_type: "task.started".to_string(),
                field: "user_id",
            }
        );
    }

    #[test]
    fn test_null_counts_as_missing() {
        let payload = map(json!({"post_id": null}));
        assert!(matches!(
            validate_payload(&EventType::PostLiked, &payload),
            Err(ValidationError::MissingField { field: "post_id", .. })
        ));
    }

    #[test]
    fn test_wrong_type_is_reported() {
        let payload = map(json!({"user_id": "u", "node_id": "n", "minutes": "thirty"}));
        assert!(matches!(
            validate_payload(&EventType::StudyRecorded, &payload),
            Err(ValidationError::WrongType { field: "minutes", .. })
        ));
    }

    #[test]
    fn test_unregistered_types_have_no_schema() {
        let other = EventType::parse("billing.invoice.paid");
        assert!(required_fields(&other).is_empty());
        assert!(validate_payload(&other, &Payload::new()).is_ok());
    }
}
