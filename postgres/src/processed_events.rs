//! Idempotency ledger in `processed_events`.

use sparkle_cqrs_core::idempotency::{LedgerFuture, ProcessedEventError, ProcessedEventStore};
use sqlx::PgPool;

/// `PostgreSQL` implementation of [`ProcessedEventStore`].
///
/// Keyed by `(event_id, consumer_group)`, so one event can be processed once per group.
#[derive(Clone, Debug)]
pub struct ProcessedEventRepository {
    pool: PgPool,
}

impl ProcessedEventRepository {
    /// Create a ledger over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Number of marks held for a group.
    ///
    /// # Errors
    ///
    /// Returns [`ProcessedEventError::DatabaseError`] on query failure.
    pub async fn count_for_group(&self, group: &str) -> Result<i64, ProcessedEventError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM processed_events WHERE consumer_group = $1")
                .bind(group)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| ProcessedEventError::DatabaseError(e.to_string()))?;
        Ok(count)
    }
}

impl ProcessedEventStore for ProcessedEventRepository {
    fn is_processed<'a>(&'a self, event_id: &'a str, group: &'a str) -> LedgerFuture<'a, bool> {
        Box::pin(async move {
            let (exists,): (bool,) = sqlx::query_as(
                r"
                SELECT EXISTS (
                    SELECT 1 FROM processed_events
                    WHERE event_id = $1 AND consumer_group = $2
                )
                ",
            )
            .bind(event_id)
            .bind(group)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProcessedEventError::DatabaseError(e.to_string()))?;
            Ok(exists)
        })
    }

    fn mark_processed<'a>(&'a self, event_id: &'a str, group: &'a str) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO processed_events (event_id, consumer_group, processed_at)
                VALUES ($1, $2, now())
                ON CONFLICT (event_id, consumer_group) DO NOTHING
                ",
            )
            .bind(event_id)
            .bind(group)
            .execute(&self.pool)
            .await
            .map_err(|e| ProcessedEventError::DatabaseError(e.to_string()))?;
            Ok(())
        })
    }

    fn cleanup(&self, retention_days: u32) -> LedgerFuture<'_, u64> {
        Box::pin(async move {
            let days = i32::try_from(retention_days).unwrap_or(i32::MAX);
            let result = sqlx::query(
                "DELETE FROM processed_events WHERE processed_at < now() - make_interval(days => $1)",
            )
            .bind(days)
            .execute(&self.pool)
            .await
            .map_err(|e| ProcessedEventError::DatabaseError(e.to_string()))?;

            tracing::debug!(deleted = result.rows_affected(), "Pruned processed events");
            Ok(result.rows_affected())
        })
    }
}
