//! Unit of work: one database transaction around a command.
//!
//! Every state change that projections must observe goes through [`UnitOfWork::execute`].
//! The business rows, the outbox row and the optional event-store row commit together or
//! not at all. Payloads are validated here, before anything reaches the outbox.

use crate::event_store::EventStoreRepository;
use crate::outbox::{OutboxError, OutboxRepository};
use sparkle_cqrs_core::event::{DomainEvent, EventError};
use sparkle_cqrs_core::event_store::{EventStoreEntry, EventStoreError};
use sparkle_cqrs_core::outbox::OutboxEntry;
use sparkle_cqrs_core::payload::{ValidationError, validate_payload};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by a unit of work. Any of them rolls the transaction back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitOfWorkError {
    /// The event payload or command input is malformed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A unique constraint rejected the write (sequence number or duplicate id).
    ///
    /// The command may retry from scratch.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Database connection or query error.
    #[error("Database error: {0}")]
    Database(String),

    /// Event encoding failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The command chose to abort.
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl UnitOfWorkError {
    /// Whether re-running the whole command may succeed.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<ValidationError> for UnitOfWorkError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<EventError> for UnitOfWorkError {
    fn from(err: EventError) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<OutboxError> for UnitOfWorkError {
    fn from(err: OutboxError) -> Self {
        match err {
            OutboxError::Duplicate(_) => Self::Conflict(err.to_string()),
            OutboxError::DatabaseError(msg) => Self::Database(msg),
        }
    }
}

impl From<EventStoreError> for UnitOfWorkError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::SequenceConflict { .. } => Self::Conflict(err.to_string()),
            EventStoreError::DatabaseError(msg) => Self::Database(msg),
            EventStoreError::SerializationError(msg) => Self::Serialization(msg),
        }
    }
}

impl From<sqlx::Error> for UnitOfWorkError {
    fn from(err: sqlx::Error) -> Self {
        if crate::is_unique_violation(&err) {
            Self::Conflict(err.to_string())
        } else {
            Self::Database(err.to_string())
        }
    }
}

/// Future returned by the closure given to [`UnitOfWork::execute`].
pub type TxFuture<'t, T> = Pin<Box<dyn Future<Output = Result<T, UnitOfWorkError>> + Send + 't>>;

/// Opens transactions bound to the outbox and event store.
#[derive(Clone, Debug)]
pub struct UnitOfWork {
    pool: PgPool,
    outbox: OutboxRepository,
    event_store: EventStoreRepository,
}

impl UnitOfWork {
    /// Create a unit of work over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            outbox: OutboxRepository::new(pool.clone()),
            event_store: EventStoreRepository::new(pool.clone()),
            pool,
        }
    }

    /// Open a transaction and hand back its context.
    ///
    /// Prefer [`execute`](Self::execute); a context dropped without
    /// [`TxContext::commit`] rolls back.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Database`] if the transaction cannot be opened.
    pub async fn begin(&self) -> Result<TxContext, UnitOfWorkError> {
        let tx = self.pool.begin().await?;
        Ok(TxContext {
            tx,
            outbox: self.outbox.clone(),
            event_store: self.event_store.clone(),
            staged: 0,
        })
    }

    /// Run `work` in a transaction. Commits on `Ok`, rolls back on `Err`.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or [`UnitOfWorkError::Database`] if begin or commit
    /// fails.
    ///
    /// # Example
    ///
    /// ```ignore
    /// uow.execute(|ctx| Box::pin(async move {
    ///     ctx.execute(sqlx::query("UPDATE tasks SET status = 'completed' WHERE id = $1").bind(id)).await?;
    ///     ctx.append_event(&event).await?;
    ///     Ok(())
    /// })).await?;
    /// ```
    pub async fn execute<T, F>(&self, work: F) -> Result<T, UnitOfWorkError>
    where
        T: Send,
        F: for<'t> FnOnce(&'t mut TxContext) -> TxFuture<'t, T>,
    {
        let mut ctx = self.begin().await?;
        match work(&mut ctx).await {
            Ok(value) => {
                let staged = ctx.staged;
                ctx.commit().await?;
                tracing::debug!(events = staged, "Unit of work committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = ctx.rollback().await {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                tracing::debug!(error = %err, "Unit of work rolled back");
                Err(err)
            }
        }
    }
}

/// A transaction bound to the outbox and event store.
pub struct TxContext {
    tx: Transaction<'static, Postgres>,
    outbox: OutboxRepository,
    event_store: EventStoreRepository,
    staged: usize,
}

impl TxContext {
    /// The transaction's connection, for business queries.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Run a statement in the transaction, returning rows affected.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Conflict`] on unique violations,
    /// [`UnitOfWorkError::Database`] otherwise.
    pub async fn execute<'q>(
        &mut self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Result<u64, UnitOfWorkError> {
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    /// Fetch at most one row in the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Database`] on query failure.
    pub async fn query_row<'q>(
        &mut self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Result<Option<PgRow>, UnitOfWorkError> {
        Ok(query.fetch_optional(&mut *self.tx).await?)
    }

    /// Validate `event` and insert it into the outbox.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Validation`] for a malformed payload,
    /// [`UnitOfWorkError::Conflict`] for a duplicate id.
    pub async fn save_event_to_outbox(&mut self, event: &DomainEvent) -> Result<(), UnitOfWorkError> {
        validate_payload(&event.event_type, &event.payload)?;
        let entry = OutboxEntry::from_event(event)?;
        self.outbox.insert_with_tx(&mut self.tx, &entry).await?;
        self.staged += 1;
        Ok(())
    }

    /// Validate `event` and append it to the event store at `sequence_number`.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Validation`] for a malformed payload,
    /// [`UnitOfWorkError::Conflict`] if the sequence number is taken.
    pub async fn save_event_to_store(
        &mut self,
        event: &DomainEvent,
        sequence_number: i64,
    ) -> Result<(), UnitOfWorkError> {
        validate_payload(&event.event_type, &event.payload)?;
        let entry = EventStoreEntry::from_event(event, sequence_number)?;
        self.event_store.save_with_tx(&mut self.tx, &entry).await?;
        Ok(())
    }

    /// Write `event` to both the event store and the outbox.
    ///
    /// # Errors
    ///
    /// See [`save_event_to_store`](Self::save_event_to_store) and
    /// [`save_event_to_outbox`](Self::save_event_to_outbox).
    pub async fn save_event_to_both(
        &mut self,
        event: &DomainEvent,
        sequence_number: i64,
    ) -> Result<(), UnitOfWorkError> {
        self.save_event_to_store(event, sequence_number).await?;
        self.save_event_to_outbox(event).await
    }

    /// Next sequence number for the aggregate, read inside this transaction.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Database`] on query failure.
    pub async fn next_sequence(
        &mut self,
        aggregate_type: &str,
        aggregate_id: Uuid,
    ) -> Result<i64, UnitOfWorkError> {
        Ok(self
            .event_store
            .next_sequence(&mut self.tx, aggregate_type, aggregate_id)
            .await?)
    }

    /// Append `event` at the aggregate's next sequence number and stage it for publishing.
    ///
    /// Returns the sequence number used.
    ///
    /// # Errors
    ///
    /// See [`save_event_to_both`](Self::save_event_to_both).
    pub async fn append_event(&mut self, event: &DomainEvent) -> Result<i64, UnitOfWorkError> {
        let sequence_number = self
            .next_sequence(&event.aggregate_type, event.aggregate_id)
            .await?;
        self.save_event_to_both(event, sequence_number).await?;
        Ok(sequence_number)
    }

    /// Number of events staged for the outbox so far.
    #[must_use]
    pub const fn staged_events(&self) -> usize {
        self.staged
    }

    /// Commit the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Database`] if the commit fails.
    pub async fn commit(self) -> Result<(), UnitOfWorkError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Roll the transaction back.
    ///
    /// # Errors
    ///
    /// Returns [`UnitOfWorkError::Database`] if the rollback fails.
    pub async fn rollback(self) -> Result<(), UnitOfWorkError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
