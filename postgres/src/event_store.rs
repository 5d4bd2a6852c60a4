//! `PostgreSQL` event store.
//!
//! Appends happen inside a unit of work. The `unique_event` constraint on
//! `(aggregate_type, aggregate_id, sequence_number)` is the optimistic-concurrency
//! anchor: of two transactions racing for the same sequence number, the second fails
//! with [`EventStoreError::SequenceConflict`] and the command retries from scratch.

use sparkle_cqrs_core::event_store::{EventHistory, EventStoreEntry, EventStoreError, ReplayCursor};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

const SELECT_COLUMNS: &str = r"
    SELECT id, aggregate_type, aggregate_id, event_type, event_version,
           sequence_number, payload, metadata, created_at
    FROM event_store
";

/// Event store table access.
#[derive(Clone, Debug)]
pub struct EventStoreRepository {
    pool: PgPool,
}

impl EventStoreRepository {
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

    /// Append a row on the caller's connection.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::SequenceConflict`] if the sequence number is taken,
    /// [`EventStoreError::DatabaseError`] otherwise.
    pub async fn save_with_tx(
        &self,
        conn: &mut PgConnection,
        entry: &EventStoreEntry,
    ) -> Result<(), EventStoreError> {
        sqlx::query(
            r"
            INSERT INTO event_store
                (id, aggregate_type, aggregate_id, event_type, event_version,
                 sequence_number, payload, metadata, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ",
        )
        .bind(&entry.id)
        .bind(&entry.aggregate_type)
        .bind(entry.aggregate_id)
        .bind(&entry.event_type)
        .bind(entry.event_version)
        .bind(entry.sequence_number)
        .bind(&entry.payload)
        .bind(&entry.metadata)
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if crate::is_unique_violation(&e) {
                EventStoreError::SequenceConflict {
                    aggregate_type: entry.aggregate_type.clone(),
                    aggregate_id: entry.aggregate_id,
                    sequence_number: entry.sequence_number,
                }
            } else {
                EventStoreError::DatabaseError(e.to_string())
            }
        })?;

        Ok(())
    }

    /// `MAX(sequence_number) + 1` for the aggregate, or 1 if it has no history.
    ///
    /// Call this on the same transaction that will insert.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::DatabaseError`] on query failure.
    pub async fn next_sequence(
        &self,
        conn: &mut PgConnection,
        aggregate_type: &str,
        aggregate_id: Uuid,
    ) -> Result<i64, EventStoreError> {
        let (next,): (i64,) = sqlx::query_as(
            r"
            SELECT COALESCE(MAX(sequence_number), 0) + 1
            FROM event_store
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ",
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

        Ok(next)
    }
}

type HistoryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventStoreError>> + Send + 'a>>;

impl EventHistory for EventStoreRepository {
    fn count_by_aggregate_type(&self, aggregate_type: &str) -> HistoryFuture<'_, i64> {
        let aggregate_type = aggregate_type.to_string();
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM event_store WHERE aggregate_type = $1")
                    .bind(aggregate_type)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;
            Ok(count)
        })
    }

    fn load_batch(
        &self,
        aggregate_type: &str,
        cursor: ReplayCursor,
        limit: i64,
    ) -> HistoryFuture<'_, Vec<EventStoreEntry>> {
        let aggregate_type = aggregate_type.to_string();
        Box::pin(async move {
            // Keyset pagination; a cursor without an aggregate id skips the whole sequence.
            let query = format!(
                "{SELECT_COLUMNS}
                WHERE aggregate_type = $1
                  AND (sequence_number > $2
                       OR ($3::uuid IS NOT NULL AND sequence_number = $2 AND aggregate_id > $3))
                ORDER BY sequence_number ASC, aggregate_id ASC
                LIMIT $4"
            );
            let rows = sqlx::query(&query)
                .bind(aggregate_type)
                .bind(cursor.sequence_number)
                .bind(cursor.aggregate_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            Ok(rows.iter().map(row_to_entry).collect())
        })
    }

    fn load_by_aggregate(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
    ) -> HistoryFuture<'_, Vec<EventStoreEntry>> {
        self.load_after_sequence(aggregate_type, aggregate_id, 0)
    }

    fn load_after_sequence(
        &self,
        aggregate_type: &str,
        aggregate_id: Uuid,
        after: i64,
    ) -> HistoryFuture<'_, Vec<EventStoreEntry>> {
        let aggregate_type = aggregate_type.to_string();
        Box::pin(async move {
            let query = format!(
                "{SELECT_COLUMNS}
                WHERE aggregate_type = $1 AND aggregate_id = $2 AND sequence_number > $3
                ORDER BY sequence_number ASC"
            );
            let rows = sqlx::query(&query)
                .bind(aggregate_type)
                .bind(aggregate_id)
                .bind(after)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| EventStoreError::DatabaseError(e.to_string()))?;

            Ok(rows.iter().map(row_to_entry).collect())
        })
    }
}

fn row_to_entry(row: &PgRow) -> EventStoreEntry {
    let metadata: Option<serde_json::Value> = row.get("metadata");
    EventStoreEntry {
        id: row.get("id"),
        aggregate_type: row.get("aggregate_type"),
        aggregate_id: row.get("aggregate_id"),
        event_type: row.get("event_type"),
        event_version: row.get("event_version"),
        sequence_number: row.get("sequence_number"),
        payload: row.get("payload"),
        metadata: metadata.unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at"),
    }
}
