//! `PostgreSQL` persistence for the Sparkle CQRS substrate.
//!
//! Everything here shares one [`sqlx::PgPool`]:
//!
//! - [`OutboxRepository`]: transactional outbox with skip-locked polling
//! - [`EventStoreRepository`]: append-only per-aggregate history
//! - [`ProcessedEventRepository`]: idempotency ledger
//! - [`UnitOfWork`]: one transaction binding business writes to the outbox and event store
//! - [`PostgresProjectionMetadata`] / [`PostgresSnapshotStore`]: projection lifecycle state
//! - [`PostgresCanonicalLookup`]: read-only access to business rows for projection enrichment
//!
//! # Example
//!
//! ```ignore
//! use sparkle_cqrs_postgres::{UnitOfWork, migrate};
//!
//! let pool = sqlx::PgPool::connect("postgres://localhost/sparkle").await?;
//! migrate(&pool).await?;
//!
//! let uow = UnitOfWork::new(pool);
//! uow.execute(|ctx| Box::pin(async move {
//!     ctx.execute(sqlx::query("INSERT INTO posts (id, user_id, content) VALUES ($1, $2, $3)")
//!         .bind(post_id).bind(user_id).bind(content)).await?;
//!     ctx.save_event_to_outbox(&event).await?;
//!     Ok(())
//! })).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod event_store;
pub mod outbox;
pub mod processed_events;
pub mod projection_store;
pub mod unit_of_work;

pub use canonical::PostgresCanonicalLookup;
pub use event_store::EventStoreRepository;
pub use outbox::{OutboxError, OutboxRepository};
pub use processed_events::ProcessedEventRepository;
pub use projection_store::{PostgresProjectionMetadata, PostgresSnapshotStore};
pub use unit_of_work::{TxContext, UnitOfWork, UnitOfWorkError};

use sqlx::PgPool;

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// Apply the bundled migrations (outbox, event store, ledger, projection tables).
///
/// # Errors
///
/// Returns the migrator error if a migration fails or the history is inconsistent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Whether `err` is a unique-constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}
