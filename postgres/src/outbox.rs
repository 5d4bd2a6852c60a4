//! Transactional outbox.
//!
//! Commands insert rows through [`OutboxRepository::insert_with_tx`] inside their own
//! transaction. The publisher polls with `FOR UPDATE SKIP LOCKED`, so several relay
//! replicas can run at once without publishing the same row twice. The row locks are
//! held until the publisher's transaction commits after [`OutboxRepository::mark_published`].

use chrono::{DateTime, Utc};
use sparkle_cqrs_core::outbox::OutboxEntry;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Postgres, Row, Transaction};
use thiserror::Error;

/// Errors from outbox operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// An entry with this id already exists.
    #[error("Outbox entry already exists: {0}")]
    Duplicate(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Outbox table access.
#[derive(Clone, Debug)]
pub struct OutboxRepository {
    pool: PgPool,
}

impl OutboxRepository {
    /// Create a repository over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction for a poll/publish/mark cycle.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] if no connection is available.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, OutboxError> {
        self.pool
            .begin()
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))
    }

    /// Insert an unpublished entry on the caller's connection.
    ///
    /// `sequence_number` is assigned by the database.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Duplicate`] if the id exists, [`OutboxError::DatabaseError`]
    /// otherwise.
    pub async fn insert_with_tx(
        &self,
        conn: &mut PgConnection,
        entry: &OutboxEntry,
    ) -> Result<(), OutboxError> {
        sqlx::query(
            r"
            INSERT INTO event_outbox
                (id, aggregate_type, aggregate_id, event_type, event_version, payload, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(&entry.id)
        .bind(&entry.aggregate_type)
        .bind(entry.aggregate_id)
        .bind(&entry.event_type)
        .bind(entry.event_version)
        .bind(&entry.payload)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if crate::is_unique_violation(&e) {
                OutboxError::Duplicate(entry.id.clone())
            } else {
                OutboxError::DatabaseError(e.to_string())
            }
        })?;

        tracing::debug!(
            event_id = %entry.id,
            event_type = %entry.event_type,
            "Outbox entry inserted"
        );
        Ok(())
    }

    /// Insert an entry in its own transaction.
    ///
    /// # Errors
    ///
    /// See [`insert_with_tx`](Self::insert_with_tx).
    pub async fn insert(&self, entry: &OutboxEntry) -> Result<(), OutboxError> {
        let mut tx = self.begin().await?;
        self.insert_with_tx(&mut tx, entry).await?;
        tx.commit()
            .await
            .map_err(|e| OutboxError::DatabaseError(e.to_string()))
    }

    /// Lock and return up to `limit` unpublished entries, oldest first.
    ///
    /// Rows locked by another transaction are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] on query failure.
    pub async fn get_unpublished(
        &self,
        conn: &mut PgConnection,
        limit: usize,
    ) -> Result<Vec<OutboxEntry>, OutboxError> {
        #[allow(clippy::cast_possible_wrap)]
        let limit = limit as i64;

        let rows = sqlx::query(
            r"
            SELECT id, aggregate_type, aggregate_id, event_type, event_version,
                   payload, metadata, sequence_number, created_at, published_at
            FROM event_outbox
            WHERE published_at IS NULL
            ORDER BY created_at ASC, sequence_number ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(limit)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

        Ok(rows.iter().map(row_to_entry).collect())
    }

    /// Set `published_at = now()` on every listed id that is still unpublished.
    ///
    /// Marking an already published id is a no-op. Returns the number of rows changed.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] on query failure.
    pub async fn mark_published(
        &self,
        conn: &mut PgConnection,
        ids: &[String],
    ) -> Result<u64, OutboxError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            r"
            UPDATE event_outbox
            SET published_at = GREATEST(now(), created_at)
            WHERE id = ANY($1) AND published_at IS NULL
            ",
        )
        .bind(ids)
        .execute(&mut *conn)
        .await
        .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Delete entries published more than `retention_days` ago.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] on query failure.
    pub async fn delete_old(&self, retention_days: u32) -> Result<u64, OutboxError> {
        let days = i32::try_from(retention_days).unwrap_or(i32::MAX);
        let result = sqlx::query(
            r"
            DELETE FROM event_outbox
            WHERE published_at IS NOT NULL
              AND published_at < now() - make_interval(days => $1)
            ",
        )
        .bind(days)
        .execute(&self.pool)
        .await
        .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    /// Number of unpublished entries.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] on query failure.
    pub async fn pending_count(&self) -> Result<i64, OutboxError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM event_outbox WHERE published_at IS NULL")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;
        Ok(count)
    }

    /// Fetch one entry by id.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::DatabaseError`] on query failure.
    pub async fn find(&self, id: &str) -> Result<Option<OutboxEntry>, OutboxError> {
        let row = sqlx::query(
            r"
            SELECT id, aggregate_type, aggregate_id, event_type, event_version,
                   payload, metadata, sequence_number, created_at, published_at
            FROM event_outbox
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| OutboxError::DatabaseError(e.to_string()))?;

        Ok(row.as_ref().map(row_to_entry))
    }
}

fn row_to_entry(row: &PgRow) -> OutboxEntry {
    let metadata: Option<Vec<u8>> = row.get("metadata");
    let published_at: Option<DateTime<Utc>> = row.get("published_at");
    OutboxEntry {
        id: row.get("id"),
        aggregate_type: row.get("aggregate_type"),
        aggregate_id: row.get("aggregate_id"),
        event_type: row.get("event_type"),
        event_version: row.get("event_version"),
        payload: row.get("payload"),
        metadata: metadata.unwrap_or_default(),
        sequence_number: Some(row.get("sequence_number")),
        created_at: row.get("created_at"),
        published_at,
    }
}
