//! Plumbing shared by the read-model handlers: event decoding, payload fields, key
//! ownership and snapshot blobs.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sparkle_cqrs_core::event::{DomainEvent, parse_timestamp};
use sparkle_cqrs_core::handler::HandlerError;
use sparkle_cqrs_core::projection::{ProjectionError, Result};
use sparkle_cqrs_core::read_model::{Export, ReadModelError, ReadModelStore, WriteOp};

pub(crate) fn decode(event_bytes: &[u8]) -> Result<DomainEvent> {
    DomainEvent::from_json_bytes(event_bytes)
        .map_err(|e| ProjectionError::Serialization(e.to_string()))
}

pub(crate) fn storage(e: ReadModelError) -> ProjectionError {
    ProjectionError::Storage(e.to_string())
}

pub(crate) fn lookup_failed(e: HandlerError) -> ProjectionError {
    ProjectionError::Storage(e.to_string())
}

/// A string payload field the handler cannot work without.
pub(crate) fn required<'a>(event: &'a DomainEvent, field: &str) -> Result<&'a str> {
    event.payload_str(field).ok_or_else(|| {
        ProjectionError::EventProcessing(format!(
            "{} {} is missing '{field}'",
            event.event_type, event.id
        ))
    })
}

/// A string or numeric payload field, as a string.
pub(crate) fn text(event: &DomainEvent, field: &str) -> Option<String> {
    match event.payload.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn integer(event: &DomainEvent, field: &str) -> Option<i64> {
    let value = event.payload.get(field)?;
    #[allow(clippy::cast_possible_truncation)]
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

/// A timestamp field given as RFC 3339 text or Unix seconds.
pub(crate) fn timestamp(event: &DomainEvent, field: &str) -> Option<DateTime<Utc>> {
    match event.payload.get(field)? {
        Value::String(raw) => parse_timestamp(raw).ok(),
        Value::Number(n) => n.as_i64().and_then(|secs| Utc.timestamp_opt(secs, 0).single()),
        _ => None,
    }
}

/// Sorted-set score of a timestamp.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn score(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64
}

pub(crate) async fn read_json<T: DeserializeOwned>(
    store: &dyn ReadModelStore,
    key: &str,
) -> Result<Option<T>> {
    let Some(raw) = store.get(key).await.map_err(storage)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| ProjectionError::Serialization(format!("{key}: {e}")))
}

pub(crate) fn write_json<T: Serialize>(key: &str, value: &T) -> Result<WriteOp> {
    let raw = serde_json::to_string(value)
        .map_err(|e| ProjectionError::Serialization(format!("{key}: {e}")))?;
    Ok(WriteOp::set(key, raw))
}

pub(crate) async fn apply(store: &dyn ReadModelStore, ops: Vec<WriteOp>) -> Result<()> {
    store.apply(ops).await.map_err(storage)
}

/// Delete every key matching the owned patterns.
pub(crate) async fn drop_owned(store: &dyn ReadModelStore, patterns: &[&str]) -> Result<u64> {
    let mut deleted = 0;
    for pattern in patterns {
        deleted += store.delete_pattern(pattern).await.map_err(storage)?;
    }
    Ok(deleted)
}

/// Serialize every owned key into a snapshot blob.
pub(crate) async fn capture(store: &dyn ReadModelStore, patterns: &[&str]) -> Result<Vec<u8>> {
    let dump = store.export(patterns).await.map_err(storage)?;
    serde_json::to_vec(&dump).map_err(|e| ProjectionError::Serialization(e.to_string()))
}

/// Replace the owned keys with the contents of a snapshot blob.
pub(crate) async fn restore(
    store: &dyn ReadModelStore,
    patterns: &[&str],
    data: &[u8],
) -> Result<()> {
    let dump: Export =
        serde_json::from_slice(data).map_err(|e| ProjectionError::Serialization(e.to_string()))?;
    drop_owned(store, patterns).await?;
    store.import(dump).await.map_err(storage)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use sparkle_cqrs_core::event::EventType;
    use sparkle_cqrs_testing::{InMemoryReadModelStore, event, fixed_time};
    use uuid::Uuid;

    #[test]
    fn test_payload_field_helpers() {
        let e = event(
            EventType::NodeCreated,
            Uuid::new_v4(),
            json!({"subject_id": 12, "name": "Limits", "importance": 3.0, "at": "2025-01-01T00:00:00Z"}),
        );

        assert_eq!(text(&e, "subject_id").as_deref(), Some("12"));
        assert_eq!(text(&e, "name").as_deref(), Some("Limits"));
        assert_eq!(integer(&e, "importance"), Some(3));
        assert_eq!(timestamp(&e, "at"), Some(fixed_time()));
        assert!(matches!(required(&e, "node_id"), Err(ProjectionError::EventProcessing(_))));
    }

    #[tokio::test]
    async fn test_capture_and_restore_only_touch_owned_keys() {
        let store = InMemoryReadModelStore::new();
        store
            .apply(vec![
                WriteOp::set("post:view:1", "{}"),
                WriteOp::zadd("feed:global", 1.0, "1"),
                WriteOp::set("task:view:9", "{}"),
            ])
            .await
            .unwrap();
        let patterns = ["post:view:*", "feed:global"];

        let blob = capture(&store, &patterns).await.unwrap();
        store.apply(vec![WriteOp::set("post:view:2", "{}")]).await.unwrap();
        restore(&store, &patterns, &blob).await.unwrap();

        assert_eq!(store.all_keys(), vec!["feed:global", "post:view:1", "task:view:9"]);
    }
}
