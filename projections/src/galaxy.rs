//! Knowledge galaxy projection.
//!
//! Keys:
//! - `galaxy:node:{node_id}`: JSON node view
//! - `galaxy:nodes:all`, `galaxy:nodes:roots`: sets of node ids
//! - `galaxy:node:children:{parent_id}`: children of a node
//! - `galaxy:subject:{sid}:nodes`: nodes of a subject
//! - `galaxy:user:{uid}:unlocked`: nodes a user unlocked
//! - `galaxy:user:{uid}:node:{node_id}`: JSON per-user node state
//! - `galaxy:user:{uid}:stats`: hash with `unlocked_nodes`, `total_study_minutes`, `study_count`
//! - `galaxy:user:{uid}:recent_studies`: sorted set of the ten latest study records, scored by study time (ms)
//! - `galaxy:user:{uid}:daily:{yyyy-mm-dd}`: hash with `total_minutes`, `total_score`, `study_count`
//! - `galaxy:relation:{src}:{tgt}`: JSON relation

use crate::keyspace::{self, required};
use serde_json::{Map, Value, json};
use sparkle_cqrs_core::event::{DomainEvent, EventType, aggregate, format_timestamp};
use sparkle_cqrs_core::projection::{ProjectionError, ProjectionFuture, ProjectionHandler, Result};
use sparkle_cqrs_core::read_model::{ReadModelStore, WriteOp};
use std::sync::Arc;

/// Projection name.
pub const GALAXY_PROJECTION: &str = "galaxy_projection";

/// Every node id.
pub const NODES_ALL: &str = "galaxy:nodes:all";

/// Nodes without a parent.
pub const NODES_ROOTS: &str = "galaxy:nodes:roots";

/// Relation type used when an event names none.
pub const DEFAULT_RELATION: &str = "depends_on";

/// Size of the recent-studies set.
pub const RECENT_STUDIES: i64 = 10;

const OWNED: [&str; 5] = [
    "galaxy:node:*",
    "galaxy:nodes:*",
    "galaxy:subject:*",
    "galaxy:user:*",
    "galaxy:relation:*",
];

/// Key of a node view.
#[must_use]
pub fn node_key(node_id: &str) -> String {
    format!("galaxy:node:{node_id}")
}

/// Key of a user's state for one node.
#[must_use]
pub fn user_node_key(user_id: &str, node_id: &str) -> String {
    format!("galaxy:user:{user_id}:node:{node_id}")
}

/// Key of a user's galaxy counters.
#[must_use]
pub fn user_stats_key(user_id: &str) -> String {
    format!("galaxy:user:{user_id}:stats")
}

/// Key of a user's study totals for one UTC day.
#[must_use]
pub fn daily_key(user_id: &str, day: &str) -> String {
    format!("galaxy:user:{user_id}:daily:{day}")
}

type Json = Map<String, Value>;

/// Maintains the knowledge graph and per-user progress.
pub struct GalaxyProjection {
    store: Arc<dyn ReadModelStore>,
}

impl GalaxyProjection {
    /// Create the projection. Node events carry every field the views need.
    #[must_use]
    pub fn new(store: Arc<dyn ReadModelStore>) -> Self {
        Self { store }
    }

    async fn json(&self, key: &str) -> Result<Option<Json>> {
        keyspace::read_json(self.store.as_ref(), key).await
    }

    async fn node_created(&self, event: &DomainEvent) -> Result<()> {
        let node_id = required(event, "node_id")?;
        let parent_id = event.payload_str("parent_id").filter(|p| !p.is_empty());
        let subject_id = keyspace::text(event, "subject_id");
        let mastery = self
            .json(&node_key(node_id))
            .await?
            .and_then(|view| view.get("mastery").cloned())
            .unwrap_or_else(|| json!(0.0));

        let view = json!({
            "node_id": node_id,
            "name": event.payload_str("name").unwrap_or_default(),
            "description": event.payload_str("description").unwrap_or_default(),
            "subject_id": subject_id,
            "parent_id": parent_id,
            "importance": keyspace::integer(event, "importance"),
            "mastery": mastery,
        });

        let mut ops = vec![
            keyspace::write_json(&node_key(node_id), &view)?,
            WriteOp::sadd(NODES_ALL, node_id),
        ];
        match parent_id {
            Some(parent) => ops.push(WriteOp::sadd(format!("galaxy:node:children:{parent}"), node_id)),
            None => ops.push(WriteOp::sadd(NODES_ROOTS, node_id)),
        }
        if let Some(subject) = subject_id {
            ops.push(WriteOp::sadd(format!("galaxy:subject:{subject}:nodes"), node_id));
        }
        keyspace::apply(self.store.as_ref(), ops).await
    }

    /// Merge fields into a user's node state.
    async fn merge_user_node(
        &self,
        user_id: &str,
        node_id: &str,
        fields: Json,
        mut ops: Vec<WriteOp>,
    ) -> Result<()> {
        let key = user_node_key(user_id, node_id);
        let mut state = self.json(&key).await?.unwrap_or_default();
        state.extend(fields);
        ops.insert(0, keyspace::write_json(&key, &state)?);
        keyspace::apply(self.store.as_ref(), ops).await
    }

    async fn node_unlocked(&self, event: &DomainEvent) -> Result<()> {
        let node_id = required(event, "node_id")?;
        let user_id = required(event, "user_id")?;
        let unlocked_key = format!("galaxy:user:{user_id}:unlocked");

        let mut ops = vec![WriteOp::sadd(unlocked_key.clone(), node_id)];
        let already = self
            .store
            .is_member(&unlocked_key, node_id)
            .await
            .map_err(keyspace::storage)?;
        if !already {
            ops.push(WriteOp::hincr(user_stats_key(user_id), "unlocked_nodes", 1));
        }

        let mut fields = Json::new();
        fields.insert("unlocked".into(), json!(true));
        fields.insert("unlocked_at".into(), json!(format_timestamp(&event.timestamp)));
        if !already {
            fields.insert("mastery".into(), json!(0.0));
        }
        self.merge_user_node(user_id, node_id, fields, ops).await
    }

    async fn node_expanded(&self, event: &DomainEvent) -> Result<()> {
        let node_id = required(event, "node_id")?;
        let user_id = required(event, "user_id")?;
        let mut fields = Json::new();
        fields.insert("expanded".into(), json!(true));
        fields.insert("expanded_at".into(), json!(format_timestamp(&event.timestamp)));
        self.merge_user_node(user_id, node_id, fields, Vec::new()).await
    }

    async fn mastery_updated(&self, event: &DomainEvent) -> Result<()> {
        let node_id = required(event, "node_id")?;
        let user_id = required(event, "user_id")?;
        let mastery = event.payload_f64("mastery").ok_or_else(|| {
            ProjectionError::EventProcessing(format!("{} is missing 'mastery'", event.id))
        })?;

        let mut ops = Vec::new();
        if let Some(mut view) = self.json(&node_key(node_id)).await? {
            view.insert("mastery".into(), json!(mastery));
            ops.push(keyspace::write_json(&node_key(node_id), &view)?);
        }

        let mut fields = Json::new();
        fields.insert("mastery".into(), json!(mastery));
        fields.insert("last_updated".into(), json!(format_timestamp(&event.timestamp)));
        self.merge_user_node(user_id, node_id, fields, ops).await
    }

    async fn relation_created(&self, event: &DomainEvent) -> Result<()> {
        let source = required(event, "source_id")?;
        let target = required(event, "target_id")?;
        let relation = json!({
            "source_id": source,
            "target_id": target,
            "relation_type": event.payload_str("relation_type").unwrap_or(DEFAULT_RELATION),
            "created_at": format_timestamp(&event.timestamp),
        });
        keyspace::apply(
            self.store.as_ref(),
            vec![keyspace::write_json(&format!("galaxy:relation:{source}:{target}"), &relation)?],
        )
        .await
    }

    async fn study_recorded(&self, event: &DomainEvent) -> Result<()> {
        let user_id = required(event, "user_id")?;
        let node_id = required(event, "node_id")?;
        let minutes = event.payload_f64("minutes").ok_or_else(|| {
            ProjectionError::EventProcessing(format!("{} is missing 'minutes'", event.id))
        })?;
        let score = event.payload_f64("performance_score").unwrap_or(0.0);

        let study = json!({
            "node_id": node_id,
            "minutes": minutes,
            "performance_score": score,
            "timestamp": format_timestamp(&event.timestamp),
            "event_id": event.id,
        });
        let recent = format!("galaxy:user:{user_id}:recent_studies");
        let daily = daily_key(user_id, &event.timestamp.format("%Y-%m-%d").to_string());
        let stats = user_stats_key(user_id);

        keyspace::apply(
            self.store.as_ref(),
            vec![
                WriteOp::zadd(recent.clone(), study_score(event), study.to_string()),
                WriteOp::zremrangebyrank(recent, 0, -(RECENT_STUDIES + 1)),
                WriteOp::hincr_float(daily.clone(), "total_minutes", minutes),
                WriteOp::hincr_float(daily.clone(), "total_score", score),
                WriteOp::hincr(daily, "study_count", 1),
                WriteOp::hincr_float(stats.clone(), "total_study_minutes", minutes),
                WriteOp::hincr(stats, "study_count", 1),
            ],
        )
        .await
    }
}

#[allow(clippy::cast_precision_loss)]
fn study_score(event: &DomainEvent) -> f64 {
    event.timestamp.timestamp_millis() as f64
}

impl ProjectionHandler for GalaxyProjection {
    fn name(&self) -> &str {
        GALAXY_PROJECTION
    }

    fn aggregate_type(&self) -> &str {
        aggregate::KNOWLEDGE_NODE
    }

    fn handle<'a>(&'a self, event_bytes: &'a [u8]) -> ProjectionFuture<'a, ()> {
        Box::pin(async move {
            let event = keyspace::decode(event_bytes)?;
            match event.event_type {
                EventType::NodeCreated => self.node_created(&event).await,
                EventType::NodeUnlocked => self.node_unlocked(&event).await,
                EventType::NodeExpanded => self.node_expanded(&event).await,
                EventType::MasteryUpdated => self.mastery_updated(&event).await,
                EventType::RelationCreated => self.relation_created(&event).await,
                EventType::StudyRecorded => self.study_recorded(&event).await,
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
            tracing::info!(projection = GALAXY_PROJECTION, keys_deleted = deleted, "Projection keys dropped");
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
    use sparkle_cqrs_core::read_model::KeyValue;
    use sparkle_cqrs_testing::{InMemoryReadModelStore, ProjectionTestHarness, at, event};
    use uuid::Uuid;

    fn harness() -> ProjectionTestHarness<GalaxyProjection> {
        let store = InMemoryReadModelStore::new();
        ProjectionTestHarness::new(GalaxyProjection::new(Arc::new(store.clone())), store)
    }

    fn recent_studies(h: &ProjectionTestHarness<GalaxyProjection>, user: &str) -> Vec<String> {
        match h.store().snapshot_of(&format!("galaxy:user:{user}:recent_studies")) {
            Some(KeyValue::SortedSet(pairs)) => pairs.into_iter().map(|(member, _)| member).collect(),
            _ => Vec::new(),
        }
    }

    fn members(h: &ProjectionTestHarness<GalaxyProjection>, key: &str) -> Vec<String> {
        match h.store().snapshot_of(key) {
            Some(KeyValue::Set(members)) => members,
            _ => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_node_created_indexes_roots_children_and_subjects() {
        let h = harness();
        let root = Uuid::new_v4();
        let child = Uuid::new_v4();
        h.given_events(&[
            event(
                EventType::NodeCreated,
                root,
                json!({"node_id": root.to_string(), "name": "Calculus", "subject_id": 7}),
            ),
            event(
                EventType::NodeCreated,
                child,
                json!({"node_id": child.to_string(), "name": "Limits", "parent_id": root.to_string(), "subject_id": 7}),
            ),
        ])
        .await
        .unwrap();

        assert_eq!(members(&h, NODES_ROOTS), vec![root.to_string()]);
        assert_eq!(members(&h, &format!("galaxy:node:children:{root}")), vec![child.to_string()]);
        assert_eq!(members(&h, "galaxy:subject:7:nodes").len(), 2);
        assert_eq!(members(&h, NODES_ALL).len(), 2);
        let view = h.json(&node_key(&child.to_string())).unwrap();
        assert_eq!(view["name"], "Limits");
        assert_eq!(view["subject_id"], "7");
        assert_eq!(view["mastery"], 0.0);
    }

    #[tokio::test]
    async fn test_unlock_counts_each_node_once_and_keeps_mastery() {
        let h = harness();
        let node = Uuid::new_v4();
        let payload = json!({"node_id": node.to_string(), "user_id": "u-1"});
        let mut mastery = payload.clone();
        mastery["mastery"] = json!(0.5);

        h.given_events(&[
            event(EventType::NodeUnlocked, node, payload.clone()),
            event(EventType::MasteryUpdated, node, mastery),
            event(EventType::NodeUnlocked, node, payload.clone()),
            event(EventType::NodeExpanded, node, payload),
        ])
        .await
        .unwrap();

        assert_eq!(h.hash_field(&user_stats_key("u-1"), "unlocked_nodes").as_deref(), Some("1"));
        let state = h.json(&user_node_key("u-1", &node.to_string())).unwrap();
        assert_eq!(state["unlocked"], true);
        assert_eq!(state["expanded"], true);
        assert_eq!(state["mastery"], 0.5);
    }

    #[tokio::test]
    async fn test_mastery_updates_node_view_when_present() {
        let h = harness();
        let node = Uuid::new_v4();
        h.given_events(&[
            event(EventType::NodeCreated, node, json!({"node_id": node.to_string()})),
            event(
                EventType::MasteryUpdated,
                node,
                json!({"node_id": node.to_string(), "user_id": "u-1", "mastery": 0.8}),
            ),
        ])
        .await
        .unwrap();

        assert_eq!(h.json(&node_key(&node.to_string())).unwrap()["mastery"], 0.8);
    }

    #[tokio::test]
    async fn test_relation_type_defaults_to_depends_on() {
        let h = harness();
        h.given_event(&event(
            EventType::RelationCreated,
            Uuid::new_v4(),
            json!({"source_id": "a", "target_id": "b"}),
        ))
        .await
        .unwrap();

        assert_eq!(h.json("galaxy:relation:a:b").unwrap()["relation_type"], DEFAULT_RELATION);
    }

    #[tokio::test]
    async fn test_studies_roll_up_daily_and_keep_ten_recent() {
        let h = harness();
        let node = Uuid::new_v4();
        for i in 0..12 {
            h.given_event(
                &event(
                    EventType::StudyRecorded,
                    node,
                    json!({"user_id": "u-1", "node_id": node.to_string(), "minutes": 10, "performance_score": 0.5}),
                )
                .with_timestamp(at(i)),
            )
            .await
            .unwrap();
        }

        let recent = recent_studies(&h, "u-1");
        assert_eq!(recent.len(), 10);
        let newest: Value = serde_json::from_str(&recent[9]).unwrap();
        assert_eq!(newest["timestamp"], format_timestamp(&at(11)));
        let oldest: Value = serde_json::from_str(&recent[0]).unwrap();
        assert_eq!(oldest["timestamp"], format_timestamp(&at(2)));

        let daily = daily_key("u-1", "2025-01-01");
        assert_eq!(h.hash_field(&daily, "total_minutes").as_deref(), Some("120"));
        assert_eq!(h.hash_field(&daily, "total_score").as_deref(), Some("6"));
        assert_eq!(h.hash_field(&daily, "study_count").as_deref(), Some("12"));
        assert_eq!(h.hash_field(&user_stats_key("u-1"), "study_count").as_deref(), Some("12"));
    }

    #[tokio::test]
    async fn test_recent_studies_do_not_depend_on_arrival_order() {
        let node = Uuid::new_v4();
        let studies: Vec<DomainEvent> = (0..15)
            .map(|i| {
                event(
                    EventType::StudyRecorded,
                    node,
                    json!({"user_id": "u-1", "node_id": node.to_string(), "minutes": 5}),
                )
                .with_timestamp(at(i * 60))
            })
            .collect();

        let in_order = harness();
        for study in &studies {
            in_order.given_event(study).await.unwrap();
        }
        let shuffled = harness();
        for study in studies.iter().rev().step_by(2).chain(studies.iter().skip(1).step_by(2)) {
            shuffled.given_event(study).await.unwrap();
        }

        let expected = recent_studies(&in_order, "u-1");
        assert_eq!(expected.len(), 10);
        assert_eq!(recent_studies(&shuffled, "u-1"), expected);
    }

    #[tokio::test]
    async fn test_study_without_minutes_is_rejected() {
        let h = harness();
        let result = h
            .given_event(&event(
                EventType::StudyRecorded,
                Uuid::new_v4(),
                json!({"user_id": "u-1", "node_id": "n"}),
            ))
            .await;
        assert!(matches!(result, Err(ProjectionError::EventProcessing(_))));
        assert!(h.store().is_empty());
    }
}
