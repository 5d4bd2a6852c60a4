//! In-memory projection testing utilities
//!
//! Provides fast, deterministic testing infrastructure for projections:
//! - [`InMemoryReadModelStore`]: Redis-typed key/value store
//! - [`InMemoryProjectionMetadata`]: projection status and positions
//! - [`InMemorySnapshotStore`]: snapshot blobs
//! - [`ProjectionTestHarness`]: Fluent API for projection tests

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chrono::Utc;
use sparkle_cqrs_core::event::DomainEvent;
use sparkle_cqrs_core::projection::{
    ProjectionError, ProjectionFuture, ProjectionHandler, ProjectionInfo, ProjectionMetadataStore,
    ProjectionStatus, Result, Snapshot, SnapshotStore,
};
use sparkle_cqrs_core::read_model::{
    KeyValue, ReadModelError, ReadModelStore, StoreFuture, WriteOp, glob_match,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Str(String),
    Set(BTreeSet<String>),
    ZSet(BTreeMap<String, f64>),
    Hash(BTreeMap<String, String>),
    List(VecDeque<String>),
}

impl Entry {
    fn to_value(&self) -> KeyValue {
        match self {
            Self::Str(s) => KeyValue::String(s.clone()),
            Self::Set(members) => KeyValue::Set(members.iter().cloned().collect()),
            Self::ZSet(members) => {
                let mut pairs: Vec<(String, f64)> =
                    members.iter().map(|(m, s)| (m.clone(), *s)).collect();
                pairs.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                KeyValue::SortedSet(pairs)
            }
            Self::Hash(fields) => {
                KeyValue::Hash(fields.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
            }
            Self::List(items) => KeyValue::List(items.iter().cloned().collect()),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::Str(_) => false,
            Self::Set(m) => m.is_empty(),
            Self::ZSet(m) => m.is_empty(),
            Self::Hash(m) => m.is_empty(),
            Self::List(m) => m.is_empty(),
        }
    }
}

fn wrong_type(key: &str) -> ReadModelError {
    ReadModelError::Storage(format!(
        "WRONGTYPE Operation against a key holding the wrong kind of value: {key}"
    ))
}

fn apply_one(data: &mut HashMap<String, Entry>, op: WriteOp) -> std::result::Result<(), ReadModelError> {
    match op {
        WriteOp::Set { key, value } => {
            data.insert(key, Entry::Str(value));
        }
        WriteOp::Del { key } => {
            data.remove(&key);
        }
        WriteOp::SAdd { key, member } => {
            match data.entry(key.clone()).or_insert_with(|| Entry::Set(BTreeSet::new())) {
                Entry::Set(members) => {
                    members.insert(member);
                }
                _ => return Err(wrong_type(&key)),
            }
        }
        WriteOp::SRem { key, member } => match data.get_mut(&key) {
            Some(Entry::Set(members)) => {
                members.remove(&member);
            }
            Some(_) => return Err(wrong_type(&key)),
            None => {}
        },
        WriteOp::ZAdd { key, score, member } => {
            match data.entry(key.clone()).or_insert_with(|| Entry::ZSet(BTreeMap::new())) {
                Entry::ZSet(members) => {
                    members.insert(member, score);
                }
                _ => return Err(wrong_type(&key)),
            }
        }
        WriteOp::ZRem { key, member } => match data.get_mut(&key) {
            Some(Entry::ZSet(members)) => {
                members.remove(&member);
            }
            Some(_) => return Err(wrong_type(&key)),
            None => {}
        },
        WriteOp::HSet { key, field, value } => {
            match data.entry(key.clone()).or_insert_with(|| Entry::Hash(BTreeMap::new())) {
                Entry::Hash(fields) => {
                    fields.insert(field, value);
                }
                _ => return Err(wrong_type(&key)),
            }
        }
        WriteOp::HIncrBy { key, field, delta } => {
            match data.entry(key.clone()).or_insert_with(|| Entry::Hash(BTreeMap::new())) {
                Entry::Hash(fields) => {
                    let current = fields.get(&field).map_or(Ok(0), |v| v.parse::<i64>()).map_err(
                        |_| ReadModelError::Storage("ERR hash value is not an integer".to_string()),
                    )?;
                    fields.insert(field, (current + delta).to_string());
                }
                _ => return Err(wrong_type(&key)),
            }
        }
        WriteOp::HIncrByFloat { key, field, delta } => {
            match data.entry(key.clone()).or_insert_with(|| Entry::Hash(BTreeMap::new())) {
                Entry::Hash(fields) => {
                    let current = fields.get(&field).map_or(Ok(0.0), |v| v.parse::<f64>()).map_err(
                        |_| ReadModelError::Storage("ERR hash value is not a float".to_string()),
                    )?;
                    fields.insert(field, (current + delta).to_string());
                }
                _ => return Err(wrong_type(&key)),
            }
        }
        WriteOp::LPush { key, value } => {
            match data.entry(key.clone()).or_insert_with(|| Entry::List(VecDeque::new())) {
                Entry::List(items) => items.push_front(value),
                _ => return Err(wrong_type(&key)),
            }
        }
        WriteOp::LTrim { key, start, stop } => match data.get_mut(&key) {
            Some(Entry::List(items)) => {
                let len = items.len() as i64;
                let (start, stop) = rank_range(len, start, stop);
                if start > stop {
                    items.clear();
                } else {
                    let kept: VecDeque<String> = items
                        .iter()
                        .skip(usize::try_from(start).unwrap_or(0))
                        .take(usize::try_from(stop - start + 1).unwrap_or(0))
                        .cloned()
                        .collect();
                    *items = kept;
                }
            }
            Some(_) => return Err(wrong_type(&key)),
            None => {}
        },
        WriteOp::ZRemRangeByRank { key, start, stop } => match data.get_mut(&key) {
            Some(Entry::ZSet(members)) => {
                let mut ranked: Vec<(String, f64)> =
                    members.iter().map(|(m, s)| (m.clone(), *s)).collect();
                ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                let len = ranked.len() as i64;
                let (start, stop) = rank_range(len, start, stop);
                if start <= stop {
                    for (member, _) in ranked
                        .iter()
                        .skip(usize::try_from(start).unwrap_or(0))
                        .take(usize::try_from(stop - start + 1).unwrap_or(0))
                    {
                        members.remove(member);
                    }
                }
            }
            Some(_) => return Err(wrong_type(&key)),
            None => {}
        },
    }
    Ok(())
}

/// Redis index normalisation: negatives count from the end, `stop` is clamped to the last index.
fn rank_range(len: i64, start: i64, stop: i64) -> (i64, i64) {
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    (start, stop)
}

/// In-memory [`ReadModelStore`] with Redis data-type semantics.
///
/// Empty collections disappear the way they do in Redis, so exports from this store and
/// from a real Redis compare equal for the same history.
#[derive(Clone, Debug, Default)]
pub struct InMemoryReadModelStore {
    data: Arc<RwLock<HashMap<String, Entry>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryReadModelStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Check if a key exists in the store
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    /// Typed value at `key`, without going through the async trait.
    #[must_use]
    pub fn snapshot_of(&self, key: &str) -> Option<KeyValue> {
        self.data.read().unwrap().get(key).map(Entry::to_value)
    }

    /// Every key, sorted.
    #[must_use]
    pub fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check(&self) -> std::result::Result<(), ReadModelError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(ReadModelError::Storage("read model store unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

impl ReadModelStore for InMemoryReadModelStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            self.check()?;
            match self.data.read().unwrap().get(key) {
                None => Ok(None),
                Some(Entry::Str(value)) => Ok(Some(value.clone())),
                Some(_) => Err(wrong_type(key)),
            }
        })
    }

    fn value<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<KeyValue>> {
        Box::pin(async move {
            self.check()?;
            Ok(self.snapshot_of(key))
        })
    }

    fn is_member<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            match self.data.read().unwrap().get(key) {
                None => Ok(false),
                Some(Entry::Set(members)) => Ok(members.contains(member)),
                Some(_) => Err(wrong_type(key)),
            }
        })
    }

    fn apply(&self, ops: Vec<WriteOp>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.check()?;
            let mut data = self.data.write().unwrap();
            let mut staged = data.clone();
            for op in ops {
                apply_one(&mut staged, op)?;
            }
            staged.retain(|_, entry| !entry.is_empty());
            *data = staged;
            Ok(())
        })
    }

    fn keys<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async move {
            self.check()?;
            let mut keys: Vec<String> = self
                .data
                .read()
                .unwrap()
                .keys()
                .filter(|k| glob_match(pattern, k))
                .cloned()
                .collect();
            keys.sort();
            Ok(keys)
        })
    }

    fn delete_pattern<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            self.check()?;
            let mut data = self.data.write().unwrap();
            let before = data.len();
            data.retain(|k, _| !glob_match(pattern, k));
            Ok((before - data.len()) as u64)
        })
    }
}

/// In-memory [`ProjectionMetadataStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionMetadata {
    rows: Arc<RwLock<HashMap<String, ProjectionInfo>>>,
}

impl InMemoryProjectionMetadata {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update<'a>(
        &'a self,
        name: &'a str,
        change: impl FnOnce(&mut ProjectionInfo) + Send + 'a,
    ) -> ProjectionFuture<'a, ()> {
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap();
            let row = rows
                .get_mut(name)
                .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;
            change(row);
            row.updated_at = Utc::now();
            Ok(())
        })
    }
}

impl ProjectionMetadataStore for InMemoryProjectionMetadata {
    fn ensure<'a>(&'a self, name: &'a str, version: i32) -> ProjectionFuture<'a, ProjectionInfo> {
        Box::pin(async move {
            let mut rows = self.rows.write().unwrap();
            Ok(rows
                .entry(name.to_string())
                .or_insert_with(|| ProjectionInfo::new(name, version))
                .clone())
        })
    }

    fn get<'a>(&'a self, name: &'a str) -> ProjectionFuture<'a, Option<ProjectionInfo>> {
        Box::pin(async move { Ok(self.rows.read().unwrap().get(name).cloned()) })
    }

    fn list(&self) -> ProjectionFuture<'_, Vec<ProjectionInfo>> {
        Box::pin(async move {
            let mut rows: Vec<ProjectionInfo> = self.rows.read().unwrap().values().cloned().collect();
            rows.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(rows)
        })
    }

    fn update_position<'a>(&'a self, name: &'a str, position: &'a str) -> ProjectionFuture<'a, ()> {
        self.update(name, move |row| {
            row.last_processed_position = Some(position.to_string());
            row.last_processed_at = Some(Utc::now());
        })
    }

    fn set_status<'a>(
        &'a self,
        name: &'a str,
        status: ProjectionStatus,
        message: Option<&'a str>,
    ) -> ProjectionFuture<'a, ()> {
        self.update(name, move |row| {
            row.status = status;
            row.error_message = message.map(str::to_string);
        })
    }

    fn clear_position<'a>(&'a self, name: &'a str) -> ProjectionFuture<'a, ()> {
        self.update(name, |row| {
            row.last_processed_position = None;
            row.last_processed_at = None;
        })
    }
}

/// In-memory [`SnapshotStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: Arc<RwLock<Vec<Snapshot>>>,
}

impl InMemorySnapshotStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: Snapshot) -> ProjectionFuture<'_, ()> {
        Box::pin(async move {
            self.snapshots.write().unwrap().push(snapshot);
            Ok(())
        })
    }

    fn latest<'a>(&'a self, projection_name: &'a str) -> ProjectionFuture<'a, Option<Snapshot>> {
        Box::pin(async move {
            Ok(self
                .snapshots
                .read()
                .unwrap()
                .iter()
                .filter(|s| s.projection_name == projection_name)
                .max_by_key(|s| s.created_at)
                .cloned())
        })
    }

    fn delete_all<'a>(&'a self, projection_name: &'a str) -> ProjectionFuture<'a, u64> {
        Box::pin(async move {
            let mut snapshots = self.snapshots.write().unwrap();
            let before = snapshots.len();
            snapshots.retain(|s| s.projection_name != projection_name);
            Ok((before - snapshots.len()) as u64)
        })
    }

    fn count<'a>(&'a self, projection_name: Option<&'a str>) -> ProjectionFuture<'a, i64> {
        Box::pin(async move {
            Ok(self
                .snapshots
                .read()
                .unwrap()
                .iter()
                .filter(|s| projection_name.is_none_or(|name| s.projection_name == name))
                .count() as i64)
        })
    }
}

/// Test harness for projections providing a fluent testing API.
///
/// Feeds events to a [`ProjectionHandler`] the way the worker adapter and the builder do
/// (JSON bytes) and asserts on the backing [`InMemoryReadModelStore`].
///
/// # Example
///
/// ```ignore
/// let store = InMemoryReadModelStore::new();
/// let harness = ProjectionTestHarness::new(TaskProjection::new(Arc::new(store.clone())), store);
///
/// harness.given_events(&[created, started]).await?;
/// harness.then_contains("task:view:t-1");
/// ```
pub struct ProjectionTestHarness<P: ProjectionHandler> {
    projection: P,
    store: InMemoryReadModelStore,
}

impl<P: ProjectionHandler> ProjectionTestHarness<P> {
    /// Create a new test harness. `store` must be the store the projection writes to.
    #[must_use]
    pub const fn new(projection: P, store: InMemoryReadModelStore) -> Self {
        Self { projection, store }
    }

    /// Apply events in order.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProjectionError`] raised.
    pub async fn given_events(&self, events: &[DomainEvent]) -> Result<&Self> {
        for event in events {
            self.given_event(event).await?;
        }
        Ok(self)
    }

    /// Apply a single event.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event fails to apply.
    pub async fn given_event(&self, event: &DomainEvent) -> Result<&Self> {
        let bytes = event
            .to_json_bytes()
            .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
        self.projection.handle(&bytes).await?;
        Ok(self)
    }

    /// Assert that the store contains the given key.
    ///
    /// # Panics
    ///
    /// Panics if the key is not found in the store (this is a test assertion).
    #[allow(clippy::panic)] // Intentional panic for test assertions
    pub fn then_contains(&self, key: &str) -> &Self {
        assert!(
            self.store.contains_key(key),
            "Expected read model to contain key '{key}', keys: {:?}",
            self.store.all_keys()
        );
        self
    }

    /// Assert that the store does not contain the given key.
    ///
    /// # Panics
    ///
    /// Panics if the key is found in the store (this is a test assertion).
    #[allow(clippy::panic)] // Intentional panic for test assertions
    pub fn then_not_contains(&self, key: &str) -> &Self {
        assert!(
            !self.store.contains_key(key),
            "Expected read model to NOT contain key '{key}', but it was found"
        );
        self
    }

    /// Read a JSON string key.
    #[must_use]
    pub fn json(&self, key: &str) -> Option<serde_json::Value> {
        match self.store.snapshot_of(key)? {
            KeyValue::String(raw) => serde_json::from_str(&raw).ok(),
            _ => None,
        }
    }

    /// Read a hash field.
    #[must_use]
    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        self.store
            .snapshot_of(key)
            .and_then(|v| v.hash_field(field).map(str::to_string))
    }

    /// Get a reference to the underlying store.
    #[must_use]
    pub const fn store(&self) -> &InMemoryReadModelStore {
        &self.store
    }

    /// Get a reference to the projection.
    #[must_use]
    pub const fn projection(&self) -> &P {
        &self.projection
    }
}
