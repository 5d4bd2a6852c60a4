//! In-memory idempotency ledger and event history.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use chrono::{DateTime, Duration, Utc};
use sparkle_cqrs_core::event::DomainEvent;
use sparkle_cqrs_core::event_store::{EventHistory, EventStoreEntry, EventStoreError, ReplayCursor};
use sparkle_cqrs_core::idempotency::{LedgerFuture, ProcessedEventStore};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// In-memory [`ProcessedEventStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryProcessedEvents {
    marks: Arc<RwLock<HashMap<(String, String), DateTime<Utc>>>>,
}

impl InMemoryProcessedEvents {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of marks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.marks.read().unwrap().len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.marks.read().unwrap().is_empty()
    }

    /// Insert a mark with an explicit timestamp (for retention tests).
    pub fn mark_at(&self, event_id: &str, group: &str, processed_at: DateTime<Utc>) {
        self.marks
            .write()
            .unwrap()
            .insert((event_id.to_string(), group.to_string()), processed_at);
    }
}

impl ProcessedEventStore for InMemoryProcessedEvents {
    fn is_processed<'a>(&'a self, event_id: &'a str, group: &'a str) -> LedgerFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .marks
                .read()
                .unwrap()
                .contains_key(&(event_id.to_string(), group.to_string())))
        })
    }

    fn mark_processed<'a>(&'a self, event_id: &'a str, group: &'a str) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.marks
                .write()
                .unwrap()
                .entry((event_id.to_string(), group.to_string()))
                .or_insert_with(Utc::now);
            Ok(())
        })
    }

    fn cleanup(&self, retention_days: u32) -> LedgerFuture<'_, u64> {
        Box::pin(async move {
            let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
            let mut marks = self.marks.write().unwrap();
            let before = marks.len();
            marks.retain(|_, processed_at| *processed_at >= cutoff);
            Ok((before - marks.len()) as u64)
        })
    }
}

/// In-memory append-only [`EventHistory`].
///
/// `append` assigns per-aggregate sequence numbers the way the unit of work does.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventHistory {
    entries: Arc<RwLock<Vec<EventStoreEntry>>>,
}

impl InMemoryEventHistory {
    /// Create an empty history.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event at the aggregate's next sequence number, returning it.
    pub fn append(&self, event: &DomainEvent) -> i64 {
        let mut entries = self.entries.write().unwrap();
        let next = entries
            .iter()
            .filter(|e| {
                e.aggregate_type == event.aggregate_type && e.aggregate_id == event.aggregate_id
            })
            .map(|e| e.sequence_number)
            .max()
            .unwrap_or(0)
            + 1;
        entries.push(EventStoreEntry::from_event(event, next).unwrap());
        next
    }

    /// Number of stored rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    fn select(
        &self,
        aggregate_type: &str,
        keep: impl Fn(&EventStoreEntry) -> bool,
    ) -> Vec<EventStoreEntry> {
        let mut rows: Vec<EventStoreEntry> = self
            .entries
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type && keep(e))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.sequence_number, a.aggregate_id).cmp(&(b.sequence_number, b.aggregate_id))
        });
        rows
    }
}

type HistoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

impl EventHistory for InMemoryEventHistory {
    fn count_by_aggregate_type(&self, aggregate_type: &str) -> HistoryFuture<'_, i64> {
        let aggregate_type = aggregate_type.to_string();
        Box::pin(async move { Ok(self.select(&aggregate_type, |_| true).len() as i64) })
    }

    fn load_batch(
        &self,
        aggregate_type: &str,
        cursor: ReplayCursor,
        limit: i64,
    ) -> HistoryFuture<'_, Vec<EventStoreEntry>> {
        let aggregate_type = aggregate_type.to_string();
        Box::pin(async move {
            let mut rows = self.select(&aggregate_type, |e| {
                cursor.precedes(e.sequence_number, e.aggregate_id)
            });
            rows.truncate(usize::try_from(limit).unwrap_or(0));
            Ok(rows)
        })
    }

    fn load_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
    ) -> HistoryFuture<'_, Vec<EventStoreEntry>> {
        let aggregate_type = aggregate_type.to_string();
        Box::pin(async move { Ok(self.select(&aggregate_type, |e| e.aggregate_id == aggregate_id)) })
    }

    fn load_after_sequence(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
        after: i64,
    ) -> HistoryFuture<'_, Vec<EventStoreEntry>> {
        let aggregate_type = aggregate_type.to_string();
        Box::pin(async move {
            Ok(self.select(&aggregate_type, |e| {
                e.aggregate_id == aggregate_id && e.sequence_number > after
            }))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::helpers::task_event;
    use sparkle_cqrs_core::event::EventType;

    #[tokio::test]
    async fn test_marks_are_per_group_and_idempotent() {
        let ledger = InMemoryProcessedEvents::new();
        ledger.mark_processed("e1", "g1").await.unwrap();
        ledger.mark_processed("e1", "g1").await.unwrap();

        assert!(ledger.is_processed("e1", "g1").await.unwrap());
        assert!(!ledger.is_processed("e1", "g2").await.unwrap());
        assert_eq!(ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_prunes_old_marks() {
        let ledger = InMemoryProcessedEvents::new();
        ledger.mark_at("old", "g", Utc::now() - Duration::days(10));
        ledger.mark_processed("new", "g").await.unwrap();

        assert_eq!(ledger.cleanup(7).await.unwrap(), 1);
        assert!(ledger.is_processed("new", "g").await.unwrap());
    }

    #[tokio::test]
    async fn test_history_sequences_and_keyset_batches() {
        let history = InMemoryEventHistory::new();
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        for id in [a, b, a] {
            history.append(&task_event(EventType::TaskUpdated, id, "u"));
        }

        let all = history.load_by_aggregate("Task", a).await.unwrap();
        assert_eq!(
            all.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let first = history.load_batch("Task", ReplayCursor::START, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let rest = history
            .load_batch("Task", first[1].cursor(), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!((rest[0].sequence_number, rest[0].aggregate_id), (2, a));
        assert_eq!(history.count_by_aggregate_type("Task").await.unwrap(), 3);
        assert_eq!(history.load_after_sequence("Task", a, 1).await.unwrap().len(), 1);
    }
}
