//! In-memory stream bus with consumer-group semantics.
//!
//! Mirrors the parts of Redis Streams the CQRS runtime relies on: monotonically increasing
//! ids, groups created at offset 0, per-consumer pending lists, acknowledgements, range
//! scans, deletes and approximate trimming.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Lock poisoning only

use sparkle_cqrs_core::event_bus::{
    BusFuture, EventBus, EventBusError, Fields, MAX_STREAM_LENGTH, ReadOptions, StartPosition,
};
use sparkle_cqrs_core::wire::StreamMessage;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    /// seq -> consumer that holds it.
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<u64, Fields>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    streams: HashMap<String, Stream>,
}

fn message_id(seq: u64) -> String {
    format!("{seq}-0")
}

fn parse_id(raw: &str, open_end: u64) -> Option<u64> {
    match raw {
        "-" => Some(0),
        "+" => Some(open_end),
        other => other.split('-').next()?.parse().ok(),
    }
}

fn to_message(seq: u64, fields: &Fields) -> StreamMessage {
    StreamMessage::new(message_id(seq), fields.iter().cloned().collect())
}

/// In-memory [`EventBus`] for fast, deterministic tests.
///
/// # Example
///
/// ```
/// use sparkle_cqrs_testing::InMemoryStreamBus;
/// use sparkle_cqrs_core::event_bus::{EventBus, ReadOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryStreamBus::new();
/// bus.ensure_group("cqrs:stream:task", "task_projection_group").await?;
/// bus.append("cqrs:stream:task", vec![("k".into(), "v".into())]).await?;
///
/// let batch = bus
///     .read_group("cqrs:stream:task", "task_projection_group", "w1", &ReadOptions::default())
///     .await?;
/// assert_eq!(batch.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStreamBus {
    state: Arc<Mutex<State>>,
    offline: Arc<AtomicBool>,
    group_failures: Arc<AtomicUsize>,
    max_len: usize,
}

impl InMemoryStreamBus {
    /// Create an empty bus trimming streams at [`MAX_STREAM_LENGTH`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_len(MAX_STREAM_LENGTH)
    }

    /// Create an empty bus with a custom trim length.
    #[must_use]
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            offline: Arc::new(AtomicBool::new(false)),
            group_failures: Arc::new(AtomicUsize::new(0)),
            max_len,
        }
    }

    /// Make every operation fail with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make the next `times` calls to `ensure_group` fail.
    pub fn fail_group_creation(&self, times: usize) {
        self.group_failures.store(times, Ordering::SeqCst);
    }

    /// Every message currently in `stream`, oldest first.
    #[must_use]
    pub fn messages(&self, stream: &str) -> Vec<StreamMessage> {
        let state = self.state.lock().unwrap();
        state.streams.get(stream).map_or_else(Vec::new, |s| {
            s.entries
                .iter()
                .map(|(seq, fields)| to_message(*seq, fields))
                .collect()
        })
    }

    /// Pending message ids of a group, oldest first.
    #[must_use]
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or_else(Vec::new, |g| g.pending.keys().map(|seq| message_id(*seq)).collect())
    }

    fn check_online(&self) -> Result<(), EventBusError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(EventBusError::ConnectionFailed("bus is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn append_locked(&self, state: &mut State, stream: &str, fields: Fields) -> String {
        state.next_seq += 1;
        let seq = state.next_seq;
        let entry = state.streams.entry(stream.to_string()).or_default();
        entry.entries.insert(seq, fields);
        while entry.entries.len() > self.max_len {
            entry.entries.pop_first();
        }
        message_id(seq)
    }

    fn try_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: &ReadOptions,
    ) -> Result<Vec<StreamMessage>, EventBusError> {
        let mut state = self.state.lock().unwrap();
        let no_group = || EventBusError::ReadFailed {
            stream: stream.to_string(),
            group: group.to_string(),
            reason: "NOGROUP No such key or consumer group".to_string(),
        };
        let stream_state = state.streams.get_mut(stream).ok_or_else(no_group)?;
        let Stream { entries, groups } = stream_state;
        let group_state = groups.get_mut(group).ok_or_else(no_group)?;

        match options.start {
            StartPosition::Pending => Ok(group_state
                .pending
                .iter()
                .filter(|(_, owner)| owner.as_str() == consumer)
                .filter_map(|(seq, _)| entries.get(seq).map(|f| to_message(*seq, f)))
                .take(options.batch_size)
                .collect()),
            StartPosition::New => {
                let fresh: Vec<(u64, Fields)> = entries
                    .range(group_state.last_delivered + 1..)
                    .take(options.batch_size)
                    .map(|(seq, fields)| (*seq, fields.clone()))
                    .collect();
                for (seq, _) in &fresh {
                    group_state.last_delivered = *seq;
                    group_state.pending.insert(*seq, consumer.to_string());
                }
                Ok(fresh
                    .iter()
                    .map(|(seq, fields)| to_message(*seq, fields))
                    .collect())
            }
        }
    }
}

impl EventBus for InMemoryStreamBus {
    fn append(&self, stream: &str, fields: Fields) -> BusFuture<'_, String> {
        let stream = stream.to_string();
        Box::pin(async move {
            self.check_online().map_err(|e| EventBusError::PublishFailed {
                stream: stream.clone(),
                reason: e.to_string(),
            })?;
            let mut state = self.state.lock().unwrap();
            Ok(self.append_locked(&mut state, &stream, fields))
        })
    }

    fn append_batch(
        &self,
        entries: Vec<(String, Fields)>,
    ) -> BusFuture<'_, Vec<Result<String, EventBusError>>> {
        Box::pin(async move {
            self.check_online()?;
            let mut state = self.state.lock().unwrap();
            Ok(entries
                .into_iter()
                .map(|(stream, fields)| Ok(self.append_locked(&mut state, &stream, fields)))
                .collect())
        })
    }

    fn ensure_group(&self, stream: &str, group: &str) -> BusFuture<'_, ()> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            self.check_online()?;
            if self
                .group_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
            {
                return Err(EventBusError::ConsumerGroupError(format!(
                    "cannot create {group} on {stream}"
                )));
            }
            let mut state = self.state.lock().unwrap();
            state
                .streams
                .entry(stream)
                .or_default()
                .groups
                .entry(group)
                .or_default();
            Ok(())
        })
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: &ReadOptions,
    ) -> BusFuture<'_, Vec<StreamMessage>> {
        let stream = stream.to_string();
        let group = group.to_string();
        let consumer = consumer.to_string();
        let options = options.clone();
        Box::pin(async move {
            self.check_online()?;
            let deadline = Instant::now() + options.block;
            loop {
                let batch = self.try_read(&stream, &group, &consumer, &options)?;
                if !batch.is_empty()
                    || options.start == StartPosition::Pending
                    || Instant::now() >= deadline
                {
                    return Ok(batch);
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
    }

    fn acknowledge(&self, stream: &str, group: &str, message_id: &str) -> BusFuture<'_, ()> {
        let stream = stream.to_string();
        let group = group.to_string();
        let seq = parse_id(message_id, u64::MAX);
        Box::pin(async move {
            self.check_online()?;
            let mut state = self.state.lock().unwrap();
            if let (Some(seq), Some(g)) = (
                seq,
                state
                    .streams
                    .get_mut(&stream)
                    .and_then(|s| s.groups.get_mut(&group)),
            ) {
                g.pending.remove(&seq);
            }
            Ok(())
        })
    }

    fn pending_count(&self, stream: &str, group: &str) -> BusFuture<'_, u64> {
        let stream = stream.to_string();
        let group = group.to_string();
        Box::pin(async move {
            self.check_online()?;
            let state = self.state.lock().unwrap();
            Ok(state
                .streams
                .get(&stream)
                .and_then(|s| s.groups.get(&group))
                .map_or(0, |g| g.pending.len() as u64))
        })
    }

    fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> BusFuture<'_, Vec<StreamMessage>> {
        let stream = stream.to_string();
        let start = parse_id(start, u64::MAX);
        let end = parse_id(end, u64::MAX);
        Box::pin(async move {
            self.check_online()?;
            let (Some(start), Some(end)) = (start, end) else {
                return Err(EventBusError::TransportError(
                    "Invalid stream ID specified as stream command argument".to_string(),
                ));
            };
            let state = self.state.lock().unwrap();
            Ok(state.streams.get(&stream).map_or_else(Vec::new, |s| {
                s.entries
                    .range(start..=end)
                    .take(count.unwrap_or(usize::MAX))
                    .map(|(seq, fields)| to_message(*seq, fields))
                    .collect()
            }))
        })
    }

    fn delete(&self, stream: &str, message_ids: Vec<String>) -> BusFuture<'_, u64> {
        let stream = stream.to_string();
        Box::pin(async move {
            self.check_online()?;
            let mut state = self.state.lock().unwrap();
            let Some(s) = state.streams.get_mut(&stream) else {
                return Ok(0);
            };
            let removed = message_ids
                .iter()
                .filter_map(|id| parse_id(id, u64::MAX))
                .filter(|seq| s.entries.remove(seq).is_some())
                .count();
            Ok(removed as u64)
        })
    }

    fn stream_length(&self, stream: &str) -> BusFuture<'_, Option<u64>> {
        let stream = stream.to_string();
        Box::pin(async move {
            self.check_online()?;
            let state = self.state.lock().unwrap();
            Ok(state.streams.get(&stream).map(|s| s.entries.len() as u64))
        })
    }

    fn ping(&self) -> BusFuture<'_, ()> {
        Box::pin(async move { self.check_online() })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const STREAM: &str = "cqrs:stream:task";
    const GROUP: &str = "task_projection_group";

    fn quick() -> ReadOptions {
        ReadOptions {
            block: Duration::from_millis(20),
            ..ReadOptions::default()
        }
    }

    fn field(value: &str) -> Fields {
        vec![("n".to_string(), value.to_string())]
    }

    #[tokio::test]
    async fn test_group_reads_from_beginning_and_tracks_pending() {
        let bus = InMemoryStreamBus::new();
        bus.append(STREAM, field("1")).await.unwrap();
        bus.append(STREAM, field("2")).await.unwrap();
        bus.ensure_group(STREAM, GROUP).await.unwrap();
        bus.ensure_group(STREAM, GROUP).await.unwrap();

        let batch = bus.read_group(STREAM, GROUP, "w1", &quick()).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(bus.pending_count(STREAM, GROUP).await.unwrap(), 2);

        bus.acknowledge(STREAM, GROUP, &batch[0].id).await.unwrap();
        assert_eq!(bus.pending_ids(STREAM, GROUP), vec![batch[1].id.clone()]);
    }

    #[tokio::test]
    async fn test_pending_redelivered_to_same_consumer_only() {
        let bus = InMemoryStreamBus::new();
        bus.ensure_group(STREAM, GROUP).await.unwrap();
        bus.append(STREAM, field("1")).await.unwrap();
        bus.read_group(STREAM, GROUP, "w1", &quick()).await.unwrap();

        let pending = ReadOptions {
            start: StartPosition::Pending,
            ..quick()
        };
        assert_eq!(bus.read_group(STREAM, GROUP, "w1", &pending).await.unwrap().len(), 1);
        assert!(bus.read_group(STREAM, GROUP, "w2", &pending).await.unwrap().is_empty());
        assert!(bus.read_group(STREAM, GROUP, "w2", &quick()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let bus = InMemoryStreamBus::new();
        bus.append(STREAM, field("1")).await.unwrap();
        assert!(matches!(
            bus.read_group(STREAM, GROUP, "w1", &quick()).await,
            Err(EventBusError::ReadFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_trim_range_and_delete() {
        let bus = InMemoryStreamBus::with_max_len(3);
        for n in 0..5 {
            bus.append(STREAM, field(&n.to_string())).await.unwrap();
        }
        let all = bus.range(STREAM, "-", "+", None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].field("n"), Some("2"));

        assert_eq!(bus.delete(STREAM, vec![all[0].id.clone(), "999-0".into()]).await.unwrap(), 1);
        assert_eq!(bus.stream_length(STREAM).await.unwrap(), Some(2));
        assert_eq!(bus.stream_length("cqrs:stream:plan").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_offline_bus_fails_ping() {
        let bus = InMemoryStreamBus::new();
        assert!(bus.ping().await.is_ok());
        bus.set_offline(true);
        assert!(bus.ping().await.is_err());
        assert!(bus.append(STREAM, field("1")).await.is_err());
    }
}
