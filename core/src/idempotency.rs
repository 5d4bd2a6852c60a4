//! Idempotency ledger.
//!
//! One mark per `(event_id, consumer_group)`. Presence of a mark means the group's
//! handler effect for that event is already visible, so redelivered messages are
//! acknowledged without running the handler again.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur while reading or writing the ledger.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessedEventError {
    /// Database connection or query error.
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Boxed future returned by [`ProcessedEventStore`] methods.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProcessedEventError>> + Send + 'a>>;

/// Storage for processed marks.
pub trait ProcessedEventStore: Send + Sync {
    /// Whether `group` already processed `event_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessedEventError::DatabaseError`] on storage failure.
    fn is_processed<'a>(&'a self, event_id: &'a str, group: &'a str) -> LedgerFuture<'a, bool>;

    /// Record that `group` processed `event_id`. Marking twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessedEventError::DatabaseError`] on storage failure.
    fn mark_processed<'a>(&'a self, event_id: &'a str, group: &'a str) -> LedgerFuture<'a, ()>;

    /// Delete marks older than `retention_days`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessedEventError::DatabaseError`] on storage failure.
    fn cleanup(&self, retention_days: u32) -> LedgerFuture<'_, u64>;
}
