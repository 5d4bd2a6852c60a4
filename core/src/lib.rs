//! # Sparkle CQRS Core
//!
//! Event model, routing and trait seams for the Sparkle CQRS substrate.
//!
//! This crate carries no I/O. It defines what an event is, where each event type flows,
//! how events look on the stream and in storage, and the traits that the Postgres, Redis
//! and in-memory crates implement.
//!
//! ## Paths
//!
//! ```text
//! command ─► UnitOfWork ─► business row + event_outbox (+ event_store) ─► commit
//! Publisher ─► event_outbox ─► EventBus::publish ─► mark published
//! BaseWorker ─► EventBus::read_group ─► ProcessedEventStore ─► EventHandler ─► ack
//! ProjectionBuilder ─► EventHistory::load_batch ─► ProjectionHandler ─► position
//! ```
//!
//! ## Modules
//!
//! - [`event`]: the [`DomainEvent`](event::DomainEvent) envelope and event-type registry
//! - [`routing`]: stream and consumer-group names
//! - [`payload`]: per-type payload validators
//! - [`wire`]: stream entry codec
//! - [`outbox`] / [`event_store`]: persisted row types
//! - [`event_bus`], [`idempotency`], [`handler`], [`projection`], [`read_model`], [`lookup`]:
//!   trait seams

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod event;
pub mod event_bus;
pub mod event_store;
pub mod handler;
pub mod idempotency;
pub mod lookup;
pub mod outbox;
pub mod payload;
pub mod projection;
pub mod read_model;
pub mod routing;
pub mod wire;

pub use event::{DomainEvent, EventMetadata, EventType, Payload, make_event};
pub use event_bus::{EventBus, EventBusError};
pub use handler::{EventHandler, HandlerError};
