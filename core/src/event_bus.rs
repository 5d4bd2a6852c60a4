//! Stream bus abstraction with consumer-group semantics.
//!
//! The [`EventBus`] trait models a persistent, append-only stream substrate (Redis
//! Streams in production) on which events fan out to named consumer groups. Each message
//! is delivered to one consumer within a group and stays pending until acknowledged.
//!
//! ```text
//!  Publisher ──publish──► cqrs:stream:task ──XREADGROUP──► task_projection_group
//!                                                              ├─ worker-1
//!                                                              └─ worker-2
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: a consumer that crashes between handling and ack sees
//!   the message again, so handlers rely on the idempotency ledger.
//! - **Per-stream order**: within one consumer, messages arrive in stream order, pending
//!   entries before new ones.
//! - **No cross-stream order**.
//!
//! Implementors provide the stream primitives; publishing, batch publishing and the
//! subscribe loop are provided on top of them.
//!
//! # Implementations
//!
//! - `RedisStreamBus` (in `sparkle-cqrs-redis`): production
//! - `InMemoryStreamBus` (in `sparkle-cqrs-testing`): deterministic tests

use crate::event::DomainEvent;
use crate::handler::MessageHandler;
use crate::routing::stream_of;
use crate::wire::{StreamMessage, encode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Approximate cap applied to every event stream on append.
pub const MAX_STREAM_LENGTH: usize = 100_000;

/// Stream fields as ordered key/value pairs.
pub type Fields = Vec<(String, String)>;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the stream substrate.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to append to a stream.
    #[error("Publish failed for stream '{stream}': {reason}")]
    PublishFailed {
        /// The stream that rejected the append.
        stream: String,
        /// The reason for failure.
        reason: String,
    },

    /// Failed to read from a stream.
    #[error("Read failed for stream '{stream}' group '{group}': {reason}")]
    ReadFailed {
        /// Stream being read.
        stream: String,
        /// Consumer group.
        group: String,
        /// The reason for failure.
        reason: String,
    },

    /// Consumer group error.
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Event could not be encoded for the wire.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    /// Network or transport error.
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only messages never delivered to this group (`>`).
    #[default]
    New,
    /// This consumer's delivered-but-unacknowledged messages (`0`), for catch-up after
    /// a restart.
    Pending,
}

impl StartPosition {
    /// The id argument passed to the read command.
    #[must_use]
    pub const fn as_id(self) -> &'static str {
        match self {
            Self::New => ">",
            Self::Pending => "0",
        }
    }
}

/// Options for a consumer-group read.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Maximum messages per read.
    pub batch_size: usize,
    /// How long a read waits for new messages.
    pub block: Duration,
    /// Start position.
    pub start: StartPosition,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            block: Duration::from_secs(2),
            start: StartPosition::New,
        }
    }
}

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Read options for each poll.
    pub read: ReadOptions,
    /// Acknowledge messages the handler accepted.
    pub auto_ack: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            read: ReadOptions::default(),
            auto_ack: true,
        }
    }
}

/// Outcome of publishing one event of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishResult {
    /// Event id.
    pub event_id: String,
    /// Stream the event was routed to.
    pub stream: String,
    /// Provider message id on success.
    pub message_id: Option<String>,
    /// Failure reason.
    pub error: Option<String>,
}

/// Outcome of [`EventBus::publish_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPublishResult {
    /// Per-event outcomes, in input order.
    pub results: Vec<PublishResult>,
    /// Number of events appended.
    pub succeeded: usize,
    /// Number of events rejected.
    pub failed: usize,
}

/// Boxed future returned by [`EventBus`] methods.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventBusError>> + Send + 'a>>;

/// Trait for stream bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so components can share an `Arc<dyn EventBus>`.
pub trait EventBus: Send + Sync {
    /// Append raw fields to a stream, trimming it to roughly [`MAX_STREAM_LENGTH`].
    ///
    /// Returns the provider-assigned message id.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the append fails.
    fn append(&self, stream: &str, fields: Fields) -> BusFuture<'_, String>;

    /// Append many entries in one round trip. Results are returned per entry, in order.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] if the pipeline as a whole fails.
    fn append_batch(
        &self,
        entries: Vec<(String, Fields)>,
    ) -> BusFuture<'_, Vec<Result<String, EventBusError>>>;

    /// Create `group` on `stream` at offset 0, creating the stream if needed.
    ///
    /// An already existing group is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConsumerGroupError`] for any other failure.
    fn ensure_group(&self, stream: &str, group: &str) -> BusFuture<'_, ()>;

    /// Read messages for `consumer` within `group`.
    ///
    /// Returns an empty batch when the block timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ReadFailed`] on failure.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        options: &ReadOptions,
    ) -> BusFuture<'_, Vec<StreamMessage>>;

    /// Remove a message from the group's pending list.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] on failure.
    fn acknowledge(&self, stream: &str, group: &str, message_id: &str) -> BusFuture<'_, ()>;

    /// Number of delivered-but-unacknowledged messages in a group.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] on failure.
    fn pending_count(&self, stream: &str, group: &str) -> BusFuture<'_, u64>;

    /// Messages between `start` and `end` inclusive (`-` and `+` for the extremes).
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] on failure.
    fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: Option<usize>,
    ) -> BusFuture<'_, Vec<StreamMessage>>;

    /// Delete messages, returning how many existed.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] on failure.
    fn delete(&self, stream: &str, message_ids: Vec<String>) -> BusFuture<'_, u64>;

    /// Length of a stream, or `None` if it was never created.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] on failure.
    fn stream_length(&self, stream: &str) -> BusFuture<'_, Option<u64>>;

    /// Round-trip check against the substrate.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] when unreachable.
    fn ping(&self) -> BusFuture<'_, ()>;

    /// Append an event to `stream_of(event.type)`.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SerializationFailed`] or [`EventBusError::PublishFailed`].
    fn publish<'a>(&'a self, event: &'a DomainEvent) -> BusFuture<'a, String> {
        Box::pin(async move {
            let fields =
                encode(event).map_err(|e| EventBusError::SerializationFailed(e.to_string()))?;
            self.append(stream_of(&event.event_type), fields).await
        })
    }

    /// Append many events with one pipelined round trip.
    ///
    /// Events that fail to encode are reported as failures without aborting the batch.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] if the pipeline as a whole fails.
    fn publish_batch<'a>(&'a self, events: &'a [DomainEvent]) -> BusFuture<'a, BatchPublishResult> {
        Box::pin(async move {
            let mut result = BatchPublishResult::default();
            let mut entries = Vec::with_capacity(events.len());
            let mut slots = Vec::with_capacity(events.len());

            for event in events {
                let stream = stream_of(&event.event_type);
                match encode(event) {
                    Ok(fields) => {
                        slots.push(Some(result.results.len()));
                        entries.push((stream.to_string(), fields));
                    }
                    Err(e) => {
                        slots.push(None);
                        result.failed += 1;
                        result.results.push(PublishResult {
                            event_id: event.id.clone(),
                            stream: stream.to_string(),
                            message_id: None,
                            error: Some(e.to_string()),
                        });
                        continue;
                    }
                }
                result.results.push(PublishResult {
                    event_id: event.id.clone(),
                    stream: stream.to_string(),
                    message_id: None,
                    error: None,
                });
            }

            let outcomes = if entries.is_empty() {
                Vec::new()
            } else {
                self.append_batch(entries).await?
            };

            for (slot, outcome) in slots.into_iter().flatten().zip(outcomes) {
                let entry = &mut result.results[slot];
                match outcome {
                    Ok(message_id) => {
                        entry.message_id = Some(message_id);
                        result.succeeded += 1;
                    }
                    Err(e) => {
                        entry.error = Some(e.to_string());
                        result.failed += 1;
                    }
                }
            }

            Ok(result)
        })
    }

    /// Read `stream` as `consumer` in `group` until `shutdown` flips to `true`.
    ///
    /// The group is created on first use. Handler errors are logged and the message is
    /// left pending; accepted messages are acknowledged when `auto_ack` is set. Read
    /// failures back off for one block interval and retry.
    ///
    /// # Errors
    ///
    /// Returns the group creation error; read errors never end the loop.
    fn subscribe<'a>(
        &'a self,
        stream: &'a str,
        group: &'a str,
        consumer: &'a str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
        mut shutdown: watch::Receiver<bool>,
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_group(stream, group).await?;
            tracing::info!(stream, group, consumer, "Subscribed to stream");

            while !*shutdown.borrow() {
                let batch = tokio::select! {
                    _ = shutdown.changed() => break,
                    batch = self.read_group(stream, group, consumer, &options.read) => batch,
                };

                let messages = match batch {
                    Ok(messages) => messages,
                    Err(e) => {
                        tracing::warn!(stream, group, error = %e, "Stream read failed");
                        tokio::time::sleep(options.read.block).await;
                        continue;
                    }
                };

                for message in messages {
                    match handler.handle(&message).await {
                        Ok(()) if options.auto_ack => {
                            if let Err(e) = self.acknowledge(stream, group, &message.id).await {
                                tracing::warn!(message_id = %message.id, error = %e, "Ack failed");
                            }
                        }
                        Ok(()) => {}
                        Err(e) => {
                            tracing::warn!(
                                stream,
                                group,
                                message_id = %message.id,
                                error = %e,
                                "Handler rejected message; left pending"
                            );
                        }
                    }
                }
            }

            tracing::info!(stream, group, consumer, "Subscription stopped");
            Ok(())
        })
    }
}
