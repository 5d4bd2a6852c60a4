//! Task list projection.
//!
//! Keys:
//! - `task:view:{task_id}`: JSON [`TaskView`]
//! - `user:tasks:{uid}`: every task of a user, scored by creation time
//! - `user:tasks:{status}:{uid}`: tasks per status (`pending`, `in_progress`, `completed`)
//! - `user:task:stats:{uid}`: hash with `total_tasks`, `pending_tasks`, `in_progress_tasks`,
//!   `completed_tasks`
//!
//! Status moves read the stored view first, so replaying an event twice never counts
//! it twice.

use crate::keyspace::{self, required};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparkle_cqrs_core::event::{DomainEvent, EventType, aggregate};
use sparkle_cqrs_core::lookup::CanonicalLookup;
use sparkle_cqrs_core::projection::{ProjectionFuture, ProjectionHandler, Result};
use sparkle_cqrs_core::read_model::{ReadModelStore, WriteOp};
use std::sync::Arc;
use uuid::Uuid;

/// Projection name.
pub const TASK_PROJECTION: &str = "task_projection";

const OWNED: [&str; 3] = ["task:view:*", "user:tasks:*", "user:task:stats:*"];

/// Task statuses that have their own set and counter.
pub const TRACKED_STATUSES: [&str; 3] = ["pending", "in_progress", "completed"];

/// Key of a task view.
#[must_use]
pub fn task_view_key(task_id: &str) -> String {
    format!("task:view:{task_id}")
}

/// Key of a user's task set, optionally narrowed to one status.
#[must_use]
pub fn user_tasks_key(user_id: &str, status: Option<&str>) -> String {
    match status {
        Some(status) => format!("user:tasks:{status}:{user_id}"),
        None => format!("user:tasks:{user_id}"),
    }
}

/// Key of a user's task counters.
#[must_use]
pub fn user_stats_key(user_id: &str) -> String {
    format!("user:task:stats:{user_id}")
}

fn counter(status: &str) -> Option<String> {
    TRACKED_STATUSES
        .contains(&status)
        .then(|| format!("{status}_tasks"))
}

/// Denormalized task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    /// Task id.
    pub task_id: String,
    /// Owner.
    pub user_id: String,
    /// Title.
    pub title: String,
    /// Task kind.
    #[serde(rename = "type")]
    pub task_type: String,
    /// `pending`, `in_progress` or `completed`.
    pub status: String,
    /// Planned duration.
    pub estimated_minutes: Option<i64>,
    /// Difficulty rating.
    pub difficulty: Option<i64>,
    /// Priority.
    pub priority: Option<i64>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When work started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task was completed.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Maintains task views, per-status sets and per-user counters.
pub struct TaskProjection {
    store: Arc<dyn ReadModelStore>,
    lookup: Option<Arc<dyn CanonicalLookup>>,
}

impl TaskProjection {
    /// Create the projection. `lookup` fills fields older events do not carry.
    #[must_use]
    pub fn new(store: Arc<dyn ReadModelStore>, lookup: Option<Arc<dyn CanonicalLookup>>) -> Self {
        Self { store, lookup }
    }

    async fn view(&self, task_id: &str) -> Result<Option<TaskView>> {
        keyspace::read_json(self.store.as_ref(), &task_view_key(task_id)).await
    }

    async fn created(&self, event: &DomainEvent) -> Result<()> {
        let task_id = required(event, "task_id")?;
        let user_id = required(event, "user_id")?;
        if self.view(task_id).await?.is_some() {
            tracing::debug!(task_id, event_id = %event.id, "Task view exists, skipping create");
            return Ok(());
        }

        let mut view = TaskView {
            task_id: task_id.to_string(),
            user_id: user_id.to_string(),
            title: event.payload_str("title").unwrap_or_default().to_string(),
            task_type: keyspace::text(event, "type")
                .or_else(|| keyspace::text(event, "task_type"))
                .unwrap_or_default(),
            status: "pending".to_string(),
            estimated_minutes: keyspace::integer(event, "estimated_minutes"),
            difficulty: keyspace::integer(event, "difficulty"),
            priority: keyspace::integer(event, "priority"),
            created_at: keyspace::timestamp(event, "created_at").unwrap_or(event.timestamp),
            started_at: None,
            completed_at: None,
        };

        if event.payload_str("title").is_none() {
            if let (Some(lookup), Ok(id)) = (&self.lookup, Uuid::parse_str(task_id)) {
                if let Some(task) = lookup.task(id).await.map_err(keyspace::lookup_failed)? {
                    view.title = task.title;
                    view.task_type = task.task_type;
                    view.estimated_minutes = view.estimated_minutes.or(task.estimated_minutes.map(i64::from));
                    view.difficulty = view.difficulty.or(task.difficulty.map(i64::from));
                    view.priority = view.priority.or(task.priority.map(i64::from));
                    view.created_at = task.created_at;
                }
            }
        }

        let score = keyspace::score(view.created_at);
        let stats = user_stats_key(user_id);
        keyspace::apply(
            self.store.as_ref(),
            vec![
                keyspace::write_json(&task_view_key(task_id), &view)?,
                WriteOp::zadd(user_tasks_key(user_id, None), score, task_id),
                WriteOp::zadd(user_tasks_key(user_id, Some("pending")), score, task_id),
                WriteOp::hincr(stats.clone(), "total_tasks", 1),
                WriteOp::hincr(stats, "pending_tasks", 1),
            ],
        )
        .await
    }

    /// Move a task to `status`, updating its sets and counters once.
    async fn transition(&self, event: &DomainEvent, status: &str) -> Result<()> {
        let task_id = required(event, "task_id")?;
        let user_id = required(event, "user_id")?;
        let Some(mut view) = self.view(task_id).await? else {
            tracing::debug!(task_id, event_id = %event.id, "No task view to move");
            return Ok(());
        };
        if view.status == status || view.status == "completed" {
            return Ok(());
        }

        let previous = std::mem::replace(&mut view.status, status.to_string());
        match status {
            "in_progress" => view.started_at = Some(event.timestamp),
            "completed" => view.completed_at = Some(event.timestamp),
            _ => {}
        }

        let stats = user_stats_key(user_id);
        let mut ops = vec![
            keyspace::write_json(&task_view_key(task_id), &view)?,
            WriteOp::zrem(user_tasks_key(user_id, Some(&previous)), task_id),
            WriteOp::zadd(
                user_tasks_key(user_id, Some(status)),
                keyspace::score(event.timestamp),
                task_id,
            ),
        ];
        if let Some(field) = counter(&previous) {
            ops.push(WriteOp::hincr(stats.clone(), field, -1));
        }
        if let Some(field) = counter(status) {
            ops.push(WriteOp::hincr(stats, field, 1));
        }
        keyspace::apply(self.store.as_ref(), ops).await
    }

    /// Deleted and abandoned tasks leave every view.
    async fn removed(&self, event: &DomainEvent) -> Result<()> {
        let task_id = required(event, "task_id")?;
        let user_id = required(event, "user_id")?;
        let existing = self.view(task_id).await?;

        let mut ops = vec![
            WriteOp::del(task_view_key(task_id)),
            WriteOp::zrem(user_tasks_key(user_id, None), task_id),
        ];
        ops.extend(
            TRACKED_STATUSES
                .iter()
                .map(|status| WriteOp::zrem(user_tasks_key(user_id, Some(*status)), task_id)),
        );
        if let Some(view) = existing {
            let stats = user_stats_key(user_id);
            ops.push(WriteOp::hincr(stats.clone(), "total_tasks", -1));
            if let Some(field) = counter(&view.status) {
                ops.push(WriteOp::hincr(stats, field, -1));
            }
        }
        keyspace::apply(self.store.as_ref(), ops).await
    }

    async fn updated(&self, event: &DomainEvent) -> Result<()> {
        let task_id = required(event, "task_id")?;
        let Some(mut view) = self.view(task_id).await? else {
            return Ok(());
        };
        if let Some(title) = event.payload_str("title") {
            view.title = title.to_string();
        }
        view.difficulty = keyspace::integer(event, "difficulty").or(view.difficulty);
        view.priority = keyspace::integer(event, "priority").or(view.priority);
        view.estimated_minutes = keyspace::integer(event, "estimated_minutes").or(view.estimated_minutes);

        keyspace::apply(
            self.store.as_ref(),
            vec![keyspace::write_json(&task_view_key(task_id), &view)?],
        )
        .await
    }
}

impl ProjectionHandler for TaskProjection {
    fn name(&self) -> &str {
        TASK_PROJECTION
    }

    fn aggregate_type(&self) -> &str {
        aggregate::TASK
    }

    fn handle<'a>(&'a self, event_bytes: &'a [u8]) -> ProjectionFuture<'a, ()> {
        Box::pin(async move {
            let event = keyspace::decode(event_bytes)?;
            match event.event_type {
                EventType::TaskCreated => self.created(&event).await,
                EventType::TaskUpdated => self.updated(&event).await,
                EventType::TaskStarted => self.transition(&event, "in_progress").await,
                EventType::TaskCompleted => self.transition(&event, "completed").await,
                EventType::TaskAbandoned | EventType::TaskDeleted => self.removed(&event).await,
                _ => {
                    tracing::debug!(event_type = %event.event_type, event_id = %event.id, "Ignoring event");
                    Ok(())
                }
            }
        })
    }

    fn reset(&self) -> ProjectionFuture<'_, ()> {
        Box::pin(async move {
            let deleted = keyspace::drop_owned(self.store.as_ref(), &OWNED).await?;
            tracing::info!(projection = TASK_PROJECTION, keys_deleted = deleted, "Projection keys dropped");
            Ok(())
        })
    }

    fn capture_snapshot(&self) -> ProjectionFuture<'_, Vec<u8>> {
        Box::pin(keyspace::capture(self.store.as_ref(), &OWNED))
    }

    fn restore_snapshot<'a>(&'a self, data: &'a [u8]) -> ProjectionFuture<'a, ()> {
        Box::pin(keyspace::restore(self.store.as_ref(), &OWNED, data))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use sparkle_cqrs_core::read_model::KeyValue;
    use sparkle_cqrs_testing::{InMemoryReadModelStore, ProjectionTestHarness, at, event, task_event};

    fn harness() -> ProjectionTestHarness<TaskProjection> {
        let store = InMemoryReadModelStore::new();
        ProjectionTestHarness::new(TaskProjection::new(Arc::new(store.clone()), None), store)
    }

    fn created(task_id: Uuid) -> DomainEvent {
        event(
            EventType::TaskCreated,
            task_id,
            json!({
                "task_id": task_id.to_string(),
                "user_id": "u-1",
                "title": "Read chapter 3",
                "type": "reading",
                "estimated_minutes": 30,
                "priority": 2
            }),
        )
    }

    fn stat(h: &ProjectionTestHarness<TaskProjection>, field: &str) -> String {
        h.hash_field(&user_stats_key("u-1"), field).unwrap_or_else(|| "0".to_string())
    }

    #[tokio::test]
    async fn test_created_writes_view_sets_and_counters() {
        let h = harness();
        let id = Uuid::new_v4();
        h.given_event(&created(id)).await.unwrap();

        let view = h.json(&task_view_key(&id.to_string())).unwrap();
        assert_eq!(view["title"], "Read chapter 3");
        assert_eq!(view["type"], "reading");
        assert_eq!(view["status"], "pending");
        assert_eq!(view["estimated_minutes"], 30);
        h.then_contains(&user_tasks_key("u-1", None))
            .then_contains(&user_tasks_key("u-1", Some("pending")));
        assert_eq!(
            h.store().snapshot_of(&user_stats_key("u-1")),
            Some(KeyValue::Hash(vec![
                ("pending_tasks".to_string(), "1".to_string()),
                ("total_tasks".to_string(), "1".to_string()),
            ]))
        );
    }

    #[tokio::test]
    async fn test_lifecycle_moves_between_status_sets() {
        let h = harness();
        let id = Uuid::new_v4();
        h.given_events(&[
            created(id),
            task_event(EventType::TaskStarted, id, "u-1").with_timestamp(at(60)),
            task_event(EventType::TaskCompleted, id, "u-1").with_timestamp(at(120)),
        ])
        .await
        .unwrap();

        let view = h.json(&task_view_key(&id.to_string())).unwrap();
        assert_eq!(view["status"], "completed");
        assert!(view["started_at"].is_string());
        assert!(view["completed_at"].is_string());
        h.then_not_contains(&user_tasks_key("u-1", Some("pending")))
            .then_not_contains(&user_tasks_key("u-1", Some("in_progress")))
            .then_contains(&user_tasks_key("u-1", Some("completed")));
        assert_eq!(stat(&h, "pending_tasks"), "0");
        assert_eq!(stat(&h, "in_progress_tasks"), "0");
        assert_eq!(stat(&h, "completed_tasks"), "1");
        assert_eq!(stat(&h, "total_tasks"), "1");
    }

    #[tokio::test]
    async fn test_replayed_events_do_not_double_count() {
        let h = harness();
        let id = Uuid::new_v4();
        let started = task_event(EventType::TaskStarted, id, "u-1");
        h.given_events(&[created(id), created(id), started.clone(), started])
            .await
            .unwrap();

        assert_eq!(stat(&h, "total_tasks"), "1");
        assert_eq!(stat(&h, "pending_tasks"), "0");
        assert_eq!(stat(&h, "in_progress_tasks"), "1");
    }

    #[tokio::test]
    async fn test_completing_a_pending_task_skips_in_progress() {
        let h = harness();
        let id = Uuid::new_v4();
        h.given_events(&[created(id), task_event(EventType::TaskCompleted, id, "u-1")])
            .await
            .unwrap();

        assert_eq!(stat(&h, "pending_tasks"), "0");
        assert_eq!(stat(&h, "in_progress_tasks"), "0");
        assert_eq!(stat(&h, "completed_tasks"), "1");
    }

    #[tokio::test]
    async fn test_abandon_removes_task_everywhere() {
        let h = harness();
        let id = Uuid::new_v4();
        h.given_events(&[
            created(id),
            task_event(EventType::TaskStarted, id, "u-1"),
            task_event(EventType::TaskAbandoned, id, "u-1"),
            task_event(EventType::TaskDeleted, id, "u-1"),
        ])
        .await
        .unwrap();

        h.then_not_contains(&task_view_key(&id.to_string()))
            .then_not_contains(&user_tasks_key("u-1", None))
            .then_not_contains(&user_tasks_key("u-1", Some("in_progress")));
        assert_eq!(stat(&h, "total_tasks"), "0");
        assert_eq!(stat(&h, "in_progress_tasks"), "0");
    }

    #[tokio::test]
    async fn test_update_patches_known_fields() {
        let h = harness();
        let id = Uuid::new_v4();
        h.given_events(&[
            created(id),
            event(
                EventType::TaskUpdated,
                id,
                json!({"task_id": id.to_string(), "user_id": "u-1", "title": "Chapter 4", "difficulty": 3.0}),
            ),
        ])
        .await
        .unwrap();

        let view = h.json(&task_view_key(&id.to_string())).unwrap();
        assert_eq!(view["title"], "Chapter 4");
        assert_eq!(view["difficulty"], 3);
        assert_eq!(view["priority"], 2);
    }

    #[tokio::test]
    async fn test_missing_task_id_is_an_event_error() {
        let h = harness();
        let err = h
            .given_event(&event(EventType::TaskStarted, Uuid::new_v4(), json!({"user_id": "u-1"})))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            sparkle_cqrs_core::projection::ProjectionError::EventProcessing(_)
        ));
    }
}
