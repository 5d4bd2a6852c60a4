//! # Sparkle CQRS Testing
//!
//! Testing utilities for the Sparkle CQRS substrate.
//!
//! This crate provides:
//! - In-memory implementations of every trait seam in `sparkle-cqrs-core`
//! - Recording handler doubles for worker and subscription tests
//! - Event builders with deterministic timestamps
//!
//! ## Example
//!
//! ```ignore
//! use sparkle_cqrs_testing::{InMemoryStreamBus, InMemoryProcessedEvents, RecordingHandler};
//!
//! #[tokio::test]
//! async fn worker_handles_each_event_once() {
//!     let bus = Arc::new(InMemoryStreamBus::new());
//!     let ledger = Arc::new(InMemoryProcessedEvents::new());
//!     let handler = Arc::new(RecordingHandler::new());
//!     // ... build a BaseWorker over them and publish events
//! }
//! ```

pub mod projection_mocks;
pub mod stores;
pub mod stream_bus;

pub use projection_mocks::{
    InMemoryProjectionMetadata, InMemoryReadModelStore, InMemorySnapshotStore,
    ProjectionTestHarness,
};
pub use stores::{InMemoryEventHistory, InMemoryProcessedEvents};
pub use stream_bus::InMemoryStreamBus;

/// Handler doubles.
pub mod mocks {
    #![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
    #![allow(clippy::missing_panics_doc)]

    use sparkle_cqrs_core::event::DomainEvent;
    use sparkle_cqrs_core::handler::{DeliveryContext, EventHandler, HandlerError, MessageHandler};
    use sparkle_cqrs_core::wire::StreamMessage;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// An [`EventHandler`] that records every call and can be told to fail.
    #[derive(Clone, Debug)]
    pub struct RecordingHandler {
        calls: Arc<Mutex<Vec<(String, Instant)>>>,
        failures_left: Arc<AtomicUsize>,
        always_fail: Arc<AtomicBool>,
        ready: Arc<AtomicBool>,
    }

    impl Default for RecordingHandler {
        fn default() -> Self {
            Self::new()
        }
    }

    impl RecordingHandler {
        /// A handler that always succeeds.
        #[must_use]
        pub fn new() -> Self {
            Self {
                calls: Arc::new(Mutex::new(Vec::new())),
                failures_left: Arc::new(AtomicUsize::new(0)),
                always_fail: Arc::new(AtomicBool::new(false)),
                ready: Arc::new(AtomicBool::new(true)),
            }
        }

        /// A handler that always fails.
        #[must_use]
        pub fn failing() -> Self {
            let handler = Self::new();
            handler.always_fail.store(true, Ordering::SeqCst);
            handler
        }

        /// A handler that fails its first `n` calls.
        #[must_use]
        pub fn failing_times(n: usize) -> Self {
            let handler = Self::new();
            handler.failures_left.store(n, Ordering::SeqCst);
            handler
        }

        /// Control what [`EventHandler::ready`] answers.
        pub fn set_ready(&self, ready: bool) {
            self.ready.store(ready, Ordering::SeqCst);
        }

        /// Number of calls so far.
        #[must_use]
        pub fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        /// Event ids in call order.
        #[must_use]
        pub fn event_ids(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(id, _)| id.clone()).collect()
        }

        /// When each call happened.
        #[must_use]
        pub fn call_times(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(_, at)| *at).collect()
        }
    }

    impl EventHandler for RecordingHandler {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn handle<'a>(
            &'a self,
            event: &'a DomainEvent,
            _context: &'a DeliveryContext,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push((event.id.clone(), Instant::now()));
                if self.always_fail.load(Ordering::SeqCst) {
                    return Err(HandlerError::Failed("configured to fail".to_string()));
                }
                let failed = self
                    .failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failed {
                    return Err(HandlerError::Failed("transient failure".to_string()));
                }
                Ok(())
            })
        }

        fn ready(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
            Box::pin(async move { self.ready.load(Ordering::SeqCst) })
        }
    }

    /// A [`MessageHandler`] that records message ids and rejects ids it was told to.
    #[derive(Clone, Debug, Default)]
    pub struct RecordingMessageHandler {
        seen: Arc<Mutex<Vec<String>>>,
        reject_field: Option<(String, String)>,
    }

    impl RecordingMessageHandler {
        /// Accept everything.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Reject messages whose `field` equals `value`.
        #[must_use]
        pub fn rejecting(field: &str, value: &str) -> Self {
            Self {
                seen: Arc::default(),
                reject_field: Some((field.to_string(), value.to_string())),
            }
        }

        /// Message ids seen so far.
        #[must_use]
        pub fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl MessageHandler for RecordingMessageHandler {
        fn handle<'a>(
            &'a self,
            message: &'a StreamMessage,
        ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(message.id.clone());
                match &self.reject_field {
                    Some((field, value)) if message.field(field) == Some(value.as_str()) => {
                        Err(HandlerError::Failed(format!("rejected {}", message.id)))
                    }
                    _ => Ok(()),
                }
            })
        }
    }
}

/// Event builders.
pub mod helpers {
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::{Value, json};
    use sparkle_cqrs_core::event::{DomainEvent, EventMetadata, EventType, make_event};
    use uuid::Uuid;

    /// 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// `fixed_time() + seconds`.
    #[must_use]
    pub fn at(seconds: i64) -> DateTime<Utc> {
        fixed_time() + Duration::seconds(seconds)
    }

    /// An event whose aggregate kind comes from the type registry.
    #[must_use]
    pub fn event(event_type: EventType, aggregate_id: Uuid, payload: Value) -> DomainEvent {
        let aggregate_type = event_type.aggregate_type().unwrap_or("Unknown");
        make_event(
            event_type,
            aggregate_type,
            aggregate_id,
            payload,
            EventMetadata::from_source("test"),
        )
        .with_timestamp(fixed_time())
    }

    /// Install a test-friendly tracing subscriber once. Honors `RUST_LOG`.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// A task event with the fields every task type requires.
    #[must_use]
    pub fn task_event(event_type: EventType, task_id: Uuid, user_id: &str) -> DomainEvent {
        event(
            event_type,
            task_id,
            json!({"task_id": task_id.to_string(), "user_id": user_id}),
        )
    }
}

/// Property-based testing strategies.
pub mod properties {
    use proptest::prelude::*;
    use serde_json::json;
    use sparkle_cqrs_core::event::{DomainEvent, EventType};
    use uuid::Uuid;

    /// Any registered event type.
    pub fn arb_known_event_type() -> impl Strategy<Value = EventType> {
        (0..EventType::KNOWN.len()).prop_map(|i| EventType::KNOWN[i].clone())
    }

    /// An event of a registered type with a small free-form payload.
    pub fn arb_event() -> impl Strategy<Value = DomainEvent> {
        (arb_known_event_type(), any::<u128>(), "[a-z0-9 ]{0,16}", 0i64..86_400).prop_map(
            |(event_type, id, note, offset)| {
                super::helpers::event(event_type, Uuid::from_u128(id), json!({"note": note}))
                    .with_timestamp(super::helpers::at(offset))
            },
        )
    }
}

pub use helpers::{at, event, fixed_time, init_tracing, task_event};
pub use mocks::{RecordingHandler, RecordingMessageHandler};
