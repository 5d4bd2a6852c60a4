//! Consumer-side handler traits.
//!
//! [`MessageHandler`] sees raw stream entries and is what [`crate::event_bus::EventBus::subscribe`]
//! drives. [`EventHandler`] sees decoded events and is what the base worker drives after
//! parsing, deduplication and payload validation.

use crate::event::DomainEvent;
use crate::wire::StreamMessage;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// A handler fault. The worker retries these with backoff and dead-letters them on
/// exhaustion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The event is well formed but its payload cannot be applied.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The read-model store rejected a write.
    #[error("Read model error: {0}")]
    ReadModel(String),

    /// An auxiliary lookup against the canonical store failed.
    #[error("Lookup failed: {0}")]
    Lookup(String),

    /// Any other failure.
    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Where a decoded event came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryContext {
    /// Source stream.
    pub stream: String,
    /// Consumer group.
    pub group: String,
    /// Provider message id.
    pub message_id: String,
}

impl DeliveryContext {
    /// Create a context.
    #[must_use]
    pub fn new(
        stream: impl Into<String>,
        group: impl Into<String>,
        message_id: impl Into<String>,
    ) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            message_id: message_id.into(),
        }
    }
}

/// Handles raw stream messages.
pub trait MessageHandler: Send + Sync {
    /// Process one message. `Ok` lets the subscriber acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] to leave the message pending.
    fn handle<'a>(
        &'a self,
        message: &'a StreamMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;
}

/// Handles decoded events for a base worker.
///
/// Implementations must be safe to re-run for the same event: the idempotency ledger
/// suppresses duplicates, but a crash between the handler's effect and the ledger write
/// replays it.
pub trait EventHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] on failure; the worker retries with backoff.
    fn handle<'a>(
        &'a self,
        event: &'a DomainEvent,
        context: &'a DeliveryContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>>;

    /// Whether the worker should fetch the next batch.
    ///
    /// A paused or rebuilding projection returns `false`, and its messages wait in the
    /// stream until it is active again.
    fn ready(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }
}
