//! Dead-letter queue on the `cqrs:dlq` stream.
//!
//! Workers write here when a message cannot be parsed or its handler keeps failing. Every
//! entry stores the original stream fields, so an operator can republish it unchanged
//! with [`DlqHandler::retry_entry`]. Nothing in this module retries on its own.

use crate::metrics::DlqMetrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sparkle_cqrs_core::event::format_timestamp;
use sparkle_cqrs_core::event_bus::{EventBus, EventBusError};
use sparkle_cqrs_core::routing::STREAM_DLQ;
use sparkle_cqrs_core::wire::{RETRY_COUNT_FIELD, StreamMessage};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The message could not be decoded or failed payload validation.
pub const ERROR_PARSE: &str = "parse_error";
/// The handler failed on every attempt.
pub const ERROR_PROCESSING: &str = "processing_error";

/// Errors from DLQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DlqError {
    /// No entry with this id.
    #[error("DLQ entry not found: {0}")]
    NotFound(String),

    /// The stream bus failed.
    #[error(transparent)]
    Bus(#[from] EventBusError),

    /// An entry could not be encoded.
    #[error("DLQ serialization failed: {0}")]
    Serialization(String),

    /// A stored entry is unreadable.
    #[error("Invalid DLQ entry {id}: {reason}")]
    InvalidEntry {
        /// DLQ message id.
        id: String,
        /// Why it could not be read.
        reason: String,
    },
}

/// A dead-lettered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    /// Message id within the DLQ stream; set when read back.
    #[serde(skip)]
    pub dlq_id: Option<String>,
    /// Stream the message was read from.
    pub original_stream: String,
    /// Message id on that stream.
    pub original_message_id: String,
    /// Group that failed to process it.
    pub consumer_group: String,
    /// Last error.
    pub error_message: String,
    /// [`ERROR_PARSE`] or [`ERROR_PROCESSING`].
    pub error_type: String,
    /// When it was dead-lettered.
    pub failed_at: DateTime<Utc>,
    /// How many times an operator already republished it.
    pub retry_count: u32,
    /// The original stream fields.
    pub original_payload: BTreeMap<String, String>,
}

impl DlqEntry {
    /// Build an entry for `message` read from `stream` by `group`.
    ///
    /// `retry_count` carries over the `_retry_count` field of a message that was
    /// republished from the DLQ before.
    #[must_use]
    pub fn new(
        message: &StreamMessage,
        stream: &str,
        group: &str,
        error_type: &str,
        error_message: impl Into<String>,
    ) -> Self {
        let retry_count = message
            .field(RETRY_COUNT_FIELD)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let original_payload = message
            .fields
            .iter()
            .filter(|(key, _)| key.as_str() != RETRY_COUNT_FIELD)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            dlq_id: None,
            original_stream: stream.to_string(),
            original_message_id: message.id.clone(),
            consumer_group: group.to_string(),
            error_message: error_message.into(),
            error_type: error_type.to_string(),
            failed_at: Utc::now(),
            retry_count,
            original_payload,
        }
    }

    fn from_message(message: &StreamMessage) -> Result<Self, DlqError> {
        let invalid = |reason: String| DlqError::InvalidEntry {
            id: message.id.clone(),
            reason,
        };
        let raw = message
            .field("payload")
            .ok_or_else(|| invalid("missing payload field".to_string()))?;
        let mut entry: Self = serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        entry.dlq_id = Some(message.id.clone());
        Ok(entry)
    }

    fn to_fields(&self) -> Result<Vec<(String, String)>, DlqError> {
        let payload =
            serde_json::to_string(self).map_err(|e| DlqError::Serialization(e.to_string()))?;
        Ok(vec![
            ("payload".to_string(), payload),
            ("original_stream".to_string(), self.original_stream.clone()),
            ("original_message_id".to_string(), self.original_message_id.clone()),
            ("consumer_group".to_string(), self.consumer_group.clone()),
            ("error_type".to_string(), self.error_type.clone()),
            ("failed_at".to_string(), format_timestamp(&self.failed_at)),
        ])
    }
}

/// Aggregate view of the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DlqStats {
    /// Entries in the stream.
    pub total: u64,
    /// Entry count per error type.
    pub by_error_type: BTreeMap<String, u64>,
    /// Entry count per consumer group.
    pub by_consumer_group: BTreeMap<String, u64>,
    /// `failed_at` of the oldest entry.
    pub oldest_entry: Option<DateTime<Utc>>,
    /// `failed_at` of the newest entry.
    pub newest_entry: Option<DateTime<Utc>>,
}

/// DLQ configuration.
#[derive(Debug, Clone)]
pub struct DlqConfig {
    /// Entries older than this are removed by [`DlqHandler::cleanup`].
    pub max_age: Duration,
}

impl Default for DlqConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

/// Reads and writes the dead-letter stream.
#[derive(Clone)]
pub struct DlqHandler {
    bus: Arc<dyn EventBus>,
    config: DlqConfig,
}

impl DlqHandler {
    /// Create a handler over `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, config: DlqConfig) -> Self {
        Self { bus, config }
    }

    /// Append an entry. Returns its DLQ message id.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Serialization`] or [`DlqError::Bus`].
    pub async fn send(&self, entry: &DlqEntry) -> Result<String, DlqError> {
        let id = self.bus.append(STREAM_DLQ, entry.to_fields()?).await?;

        DlqMetrics::record_message(&entry.error_type, &entry.consumer_group);
        tracing::warn!(
            dlq_id = %id,
            original_stream = %entry.original_stream,
            original_message_id = %entry.original_message_id,
            consumer_group = %entry.consumer_group,
            error_type = %entry.error_type,
            error = %entry.error_message,
            "Message sent to DLQ"
        );
        Ok(id)
    }

    /// Up to `count` entries, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Bus`] if the range scan fails.
    pub async fn get_entries(&self, count: usize) -> Result<Vec<DlqEntry>, DlqError> {
        let messages = self.bus.range(STREAM_DLQ, "-", "+", Some(count)).await?;
        Ok(parse_all(&messages))
    }

    /// Up to `count` entries with the given error type, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Bus`] if the range scan fails.
    pub async fn get_entries_by_error_type(
        &self,
        error_type: &str,
        count: usize,
    ) -> Result<Vec<DlqEntry>, DlqError> {
        self.filtered(count, |entry| entry.error_type == error_type).await
    }

    /// Up to `count` entries from the given consumer group, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Bus`] if the range scan fails.
    pub async fn get_entries_by_group(
        &self,
        group: &str,
        count: usize,
    ) -> Result<Vec<DlqEntry>, DlqError> {
        self.filtered(count, |entry| entry.consumer_group == group).await
    }

    async fn filtered(
        &self,
        count: usize,
        keep: impl Fn(&DlqEntry) -> bool,
    ) -> Result<Vec<DlqEntry>, DlqError> {
        let messages = self.bus.range(STREAM_DLQ, "-", "+", None).await?;
        Ok(parse_all(&messages)
            .into_iter()
            .filter(|entry| keep(entry))
            .take(count)
            .collect())
    }

    /// Republish an entry to its original stream and remove it from the DLQ.
    ///
    /// The republished message carries `_retry_count` set to the entry's count plus one.
    /// Returns the new message id on the original stream.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::NotFound`] for an unknown id, [`DlqError::InvalidEntry`] for an
    /// unreadable one, and [`DlqError::Bus`] if the republish fails.
    pub async fn retry_entry(&self, dlq_id: &str) -> Result<String, DlqError> {
        let message = self
            .bus
            .range(STREAM_DLQ, dlq_id, dlq_id, Some(1))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DlqError::NotFound(dlq_id.to_string()))?;
        let entry = DlqEntry::from_message(&message)?;

        let retry_count = entry.retry_count + 1;
        let mut fields: Vec<(String, String)> = entry.original_payload.into_iter().collect();
        fields.push((RETRY_COUNT_FIELD.to_string(), retry_count.to_string()));

        let new_id = self.bus.append(&entry.original_stream, fields).await?;

        if let Err(e) = self.bus.delete(STREAM_DLQ, vec![dlq_id.to_string()]).await {
            tracing::warn!(dlq_id, error = %e, "Republished DLQ entry could not be deleted");
        }

        tracing::info!(
            dlq_id,
            new_message_id = %new_id,
            stream = %entry.original_stream,
            retry_count,
            "DLQ entry republished"
        );
        Ok(new_id)
    }

    /// Remove one entry.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::NotFound`] if nothing was deleted.
    pub async fn delete_entry(&self, dlq_id: &str) -> Result<(), DlqError> {
        let deleted = self.bus.delete(STREAM_DLQ, vec![dlq_id.to_string()]).await?;
        if deleted == 0 {
            return Err(DlqError::NotFound(dlq_id.to_string()));
        }
        tracing::info!(dlq_id, "DLQ entry deleted");
        Ok(())
    }

    /// Remove entries that failed more than `max_age` ago. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Bus`] if the scan or delete fails.
    pub async fn cleanup(&self) -> Result<u64, DlqError> {
        let max_age = ChronoDuration::from_std(self.config.max_age)
            .unwrap_or_else(|_| ChronoDuration::days(7));
        let cutoff = Utc::now() - max_age;

        let messages = self.bus.range(STREAM_DLQ, "-", "+", None).await?;
        let expired: Vec<String> = parse_all(&messages)
            .into_iter()
            .filter(|entry| entry.failed_at < cutoff)
            .filter_map(|entry| entry.dlq_id)
            .collect();

        if expired.is_empty() {
            return Ok(0);
        }

        let deleted = self.bus.delete(STREAM_DLQ, expired).await?;
        tracing::info!(deleted, "Expired DLQ entries removed");
        Ok(deleted)
    }

    /// Number of entries, also published as the DLQ pending gauge.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Bus`] on failure.
    pub async fn count(&self) -> Result<u64, DlqError> {
        let count = self.bus.stream_length(STREAM_DLQ).await?.unwrap_or(0);
        DlqMetrics::set_pending(count);
        Ok(count)
    }

    /// Totals per error type and group, with the oldest and newest failure times.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Bus`] on failure.
    pub async fn stats(&self) -> Result<DlqStats, DlqError> {
        let total = self.count().await?;
        let entries = parse_all(&self.bus.range(STREAM_DLQ, "-", "+", None).await?);

        let mut stats = DlqStats {
            total,
            oldest_entry: entries.first().map(|e| e.failed_at),
            newest_entry: entries.last().map(|e| e.failed_at),
            ..DlqStats::default()
        };
        for entry in entries {
            *stats.by_error_type.entry(entry.error_type).or_default() += 1;
            *stats.by_consumer_group.entry(entry.consumer_group).or_default() += 1;
        }
        Ok(stats)
    }
}

fn parse_all(messages: &[StreamMessage]) -> Vec<DlqEntry> {
    messages
        .iter()
        .filter_map(|message| match DlqEntry::from_message(message) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(dlq_id = %message.id, error = %e, "Skipping unreadable DLQ entry");
                None
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sparkle_cqrs_core::event::EventType;
    use sparkle_cqrs_core::routing::{GROUP_TASK, STREAM_TASK};
    use sparkle_cqrs_core::wire::encode;
    use sparkle_cqrs_testing::{InMemoryStreamBus, task_event};
    use uuid::Uuid;

    fn setup() -> (Arc<InMemoryStreamBus>, DlqHandler) {
        let bus = Arc::new(InMemoryStreamBus::new());
        let dlq = DlqHandler::new(bus.clone(), DlqConfig::default());
        (bus, dlq)
    }

    fn message(id: &str) -> StreamMessage {
        let event = task_event(EventType::TaskCreated, Uuid::new_v4(), "u-1");
        StreamMessage::new(id.to_string(), encode(&event).unwrap().into_iter().collect())
    }

    fn entry(id: &str, error_type: &str, group: &str) -> DlqEntry {
        DlqEntry::new(&message(id), STREAM_TASK, group, error_type, "boom")
    }

    #[tokio::test]
    async fn test_send_and_read_back() {
        let (bus, dlq) = setup();
        let sent = entry("1-0", ERROR_PROCESSING, GROUP_TASK);

        let dlq_id = dlq.send(&sent).await.unwrap();

        let raw = &bus.messages(STREAM_DLQ)[0];
        assert_eq!(raw.field("error_type"), Some(ERROR_PROCESSING));
        assert_eq!(raw.field("original_stream"), Some(STREAM_TASK));

        let read = dlq.get_entries(10).await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].dlq_id.as_deref(), Some(dlq_id.as_str()));
        assert_eq!(read[0].original_payload, sent.original_payload);
        assert_eq!(read[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_filters_by_type_and_group() {
        let (_bus, dlq) = setup();
        dlq.send(&entry("1-0", ERROR_PARSE, GROUP_TASK)).await.unwrap();
        dlq.send(&entry("2-0", ERROR_PROCESSING, GROUP_TASK)).await.unwrap();
        dlq.send(&entry("3-0", ERROR_PROCESSING, "other_group")).await.unwrap();

        let parse = dlq.get_entries_by_error_type(ERROR_PARSE, 10).await.unwrap();
        assert_eq!(parse.len(), 1);
        assert_eq!(parse[0].original_message_id, "1-0");

        let task = dlq.get_entries_by_group(GROUP_TASK, 10).await.unwrap();
        assert_eq!(task.len(), 2);
        assert_eq!(dlq.get_entries_by_group(GROUP_TASK, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_republishes_with_incremented_count() {
        let (bus, dlq) = setup();
        let sent = entry("1-0", ERROR_PROCESSING, GROUP_TASK);
        let dlq_id = dlq.send(&sent).await.unwrap();

        dlq.retry_entry(&dlq_id).await.unwrap();

        let republished = &bus.messages(STREAM_TASK)[0];
        assert_eq!(republished.field(RETRY_COUNT_FIELD), Some("1"));
        assert_eq!(republished.field("id"), sent.original_payload.get("id").map(String::as_str));
        assert!(republished.decode().is_ok());
        assert_eq!(dlq.count().await.unwrap(), 0);

        // A second failure keeps counting from the republished message.
        let again = DlqEntry::new(republished, STREAM_TASK, GROUP_TASK, ERROR_PROCESSING, "x");
        assert_eq!(again.retry_count, 1);
        assert!(!again.original_payload.contains_key(RETRY_COUNT_FIELD));
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found() {
        let (_bus, dlq) = setup();
        dlq.send(&entry("1-0", ERROR_PARSE, GROUP_TASK)).await.unwrap();

        assert_eq!(
            dlq.retry_entry("999-0").await,
            Err(DlqError::NotFound("999-0".to_string()))
        );
        assert_eq!(
            dlq.delete_entry("999-0").await,
            Err(DlqError::NotFound("999-0".to_string()))
        );
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let (_bus, dlq) = setup();
        let id = dlq.send(&entry("1-0", ERROR_PARSE, GROUP_TASK)).await.unwrap();

        dlq.delete_entry(&id).await.unwrap();
        assert_eq!(dlq.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_removes_only_expired_entries() {
        let (_bus, dlq) = setup();
        let mut old = entry("1-0", ERROR_PARSE, GROUP_TASK);
        old.failed_at = Utc::now() - ChronoDuration::days(8);
        dlq.send(&old).await.unwrap();
        dlq.send(&entry("2-0", ERROR_PARSE, GROUP_TASK)).await.unwrap();

        assert_eq!(dlq.cleanup().await.unwrap(), 1);
        let left = dlq.get_entries(10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].original_message_id, "2-0");
    }

    #[tokio::test]
    async fn test_stats() {
        let (bus, dlq) = setup();
        dlq.send(&entry("1-0", ERROR_PARSE, GROUP_TASK)).await.unwrap();
        dlq.send(&entry("2-0", ERROR_PROCESSING, GROUP_TASK)).await.unwrap();
        dlq.send(&entry("3-0", ERROR_PROCESSING, "other_group")).await.unwrap();
        bus.append(STREAM_DLQ, vec![("junk".into(), "1".into())]).await.unwrap();

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_error_type.get(ERROR_PROCESSING), Some(&2));
        assert_eq!(stats.by_consumer_group.get(GROUP_TASK), Some(&2));
        assert!(stats.oldest_entry <= stats.newest_entry);
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let (_bus, dlq) = setup();
        assert_eq!(dlq.count().await.unwrap(), 0);
        assert_eq!(dlq.stats().await.unwrap(), DlqStats::default());
        assert_eq!(dlq.cleanup().await.unwrap(), 0);
    }
}
