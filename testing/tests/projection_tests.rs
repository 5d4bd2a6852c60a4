//! Tests for the in-memory doubles working together.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use proptest::prelude::*;
use serde_json::json;
use sparkle_cqrs_core::event::{DomainEvent, EventType};
use sparkle_cqrs_core::event_bus::{EventBus, ReadOptions, SubscribeOptions};
use sparkle_cqrs_core::projection::{ProjectionError, ProjectionFuture, ProjectionHandler};
use sparkle_cqrs_core::read_model::{ReadModelStore, WriteOp};
use sparkle_cqrs_core::routing::STREAM_TASK;
use sparkle_cqrs_core::wire;
use sparkle_cqrs_testing::properties::arb_event;
use sparkle_cqrs_testing::{
    InMemoryReadModelStore, InMemoryStreamBus, ProjectionTestHarness, RecordingMessageHandler,
    task_event,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

// Simple projection for testing: one key per task, removed on delete.
struct TaskTitles {
    store: Arc<InMemoryReadModelStore>,
}

impl ProjectionHandler for TaskTitles {
    fn name(&self) -> &'static str {
        "task_titles"
    }

    fn aggregate_type(&self) -> &'static str {
        "Task"
    }

    fn handle<'a>(&'a self, event_bytes: &'a [u8]) -> ProjectionFuture<'a, ()> {
        Box::pin(async move {
            let event = DomainEvent::from_json_bytes(event_bytes)
                .map_err(|e| ProjectionError::Serialization(e.to_string()))?;
            let key = format!("title:{}", event.aggregate_id);
            let op = match event.event_type {
                EventType::TaskDeleted => WriteOp::del(key),
                _ => WriteOp::set(key, event.payload_str("title").unwrap_or("untitled")),
            };
            self.store
                .apply(vec![op])
                .await
                .map_err(|e| ProjectionError::Storage(e.to_string()))
        })
    }

    fn reset(&self) -> ProjectionFuture<'_, ()> {
        Box::pin(async move {
            self.store
                .delete_pattern("title:*")
                .await
                .map(|_| ())
                .map_err(|e| ProjectionError::Storage(e.to_string()))
        })
    }
}

#[tokio::test]
async fn harness_applies_events_in_order() {
    let store = InMemoryReadModelStore::new();
    let harness = ProjectionTestHarness::new(
        TaskTitles {
            store: Arc::new(store.clone()),
        },
        store,
    );
    let id = Uuid::new_v4();
    let mut created = task_event(EventType::TaskCreated, id, "u");
    created.payload.insert("title".into(), json!("Read chapter 3"));

    harness.given_events(&[created]).await.unwrap();
    harness.then_contains(&format!("title:{id}"));

    harness
        .given_event(&task_event(EventType::TaskDeleted, id, "u"))
        .await
        .unwrap();
    harness.then_not_contains(&format!("title:{id}"));

    harness.projection().reset().await.unwrap();
    assert!(harness.store().is_empty());
}

#[tokio::test]
async fn subscribe_acks_accepted_messages_and_leaves_rejected_pending() {
    let bus = Arc::new(InMemoryStreamBus::new());
    let handler = Arc::new(RecordingMessageHandler::rejecting("n", "bad"));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let subscriber = {
        let bus = Arc::clone(&bus);
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            let options = SubscribeOptions {
                read: ReadOptions {
                    block: Duration::from_millis(20),
                    ..ReadOptions::default()
                },
                auto_ack: true,
            };
            bus.subscribe(STREAM_TASK, "g", "c1", handler, options, shutdown_rx)
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    bus.append(STREAM_TASK, vec![("n".into(), "good".into())]).await.unwrap();
    let bad = bus.append(STREAM_TASK, vec![("n".into(), "bad".into())]).await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), async {
        while handler.seen().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("both messages delivered");

    shutdown_tx.send(true).unwrap();
    subscriber.await.unwrap().unwrap();

    assert_eq!(bus.pending_ids(STREAM_TASK, "g"), vec![bad]);
}

#[tokio::test]
async fn publish_batch_routes_each_event_to_its_stream() {
    let bus = InMemoryStreamBus::new();
    let events = vec![
        task_event(EventType::TaskCreated, Uuid::new_v4(), "u"),
        sparkle_cqrs_testing::event(
            EventType::PostLiked,
            Uuid::new_v4(),
            json!({"post_id": "p"}),
        ),
    ];

    let result = bus.publish_batch(&events).await.unwrap();

    assert_eq!((result.succeeded, result.failed), (2, 0));
    assert_eq!(result.results[1].stream, "cqrs:stream:community");
    assert_eq!(bus.messages(STREAM_TASK).len(), 1);
    assert_eq!(
        bus.messages("cqrs:stream:community")[0].decode().unwrap(),
        events[1]
    );
}

proptest! {
    #[test]
    fn wire_round_trip_for_generated_events(event in arb_event()) {
        let fields: HashMap<String, String> = wire::encode(&event).unwrap().into_iter().collect();
        prop_assert_eq!(wire::decode(&fields).unwrap(), event);
    }
}
