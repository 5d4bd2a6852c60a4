//! `PostgreSQL` storage for projection metadata and snapshots.

use sparkle_cqrs_core::projection::{
    ProjectionError, ProjectionFuture, ProjectionInfo, ProjectionMetadataStore, ProjectionStatus,
    Result, Snapshot, SnapshotStore,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Projection lifecycle rows in `projection_metadata`.
#[derive(Clone, Debug)]
pub struct PostgresProjectionMetadata {
    pool: PgPool,
}

impl PostgresProjectionMetadata {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch(&self, name: &str) -> Result<Option<ProjectionInfo>> {
        let row = sqlx::query(
            r"
            SELECT projection_name, status, last_processed_position, last_processed_at,
                   version, error_message, created_at, updated_at
            FROM projection_metadata
            WHERE projection_name = $1
            ",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProjectionError::Storage(e.to_string()))?;

        row.as_ref().map(row_to_info).transpose()
    }
}

fn row_to_info(row: &PgRow) -> Result<ProjectionInfo> {
    let status: String = row.get("status");
    Ok(ProjectionInfo {
        name: row.get("projection_name"),
        status: status.parse()?,
        last_processed_position: row.get("last_processed_position"),
        last_processed_at: row.get("last_processed_at"),
        version: row.get("version"),
        error_message: row.get("error_message"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn expect_one(name: &str, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        return Err(ProjectionError::NotFound(name.to_string()));
    }
    Ok(())
}

impl ProjectionMetadataStore for PostgresProjectionMetadata {
    fn ensure<'a>(&'a self, name: &'a str, version: i32) -> ProjectionFuture<'a, ProjectionInfo> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO projection_metadata (projection_name, status, version)
                VALUES ($1, 'active', $2)
                ON CONFLICT (projection_name) DO NOTHING
                ",
            )
            .bind(name)
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;

            self.fetch(name)
                .await?
                .ok_or_else(|| ProjectionError::NotFound(name.to_string()))
        })
    }

    fn get<'a>(&'a self, name: &'a str) -> ProjectionFuture<'a, Option<ProjectionInfo>> {
        Box::pin(self.fetch(name))
    }

    fn list(&self) -> ProjectionFuture<'_, Vec<ProjectionInfo>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT projection_name, status, last_processed_position, last_processed_at,
                       version, error_message, created_at, updated_at
                FROM projection_metadata
                ORDER BY projection_name
                ",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;

            rows.iter().map(row_to_info).collect()
        })
    }

    fn update_position<'a>(&'a self, name: &'a str, position: &'a str) -> ProjectionFuture<'a, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE projection_metadata
                SET last_processed_position = $2, last_processed_at = now(), updated_at = now()
                WHERE projection_name = $1
                ",
            )
            .bind(name)
            .bind(position)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;

            expect_one(name, result.rows_affected())
        })
    }

    fn set_status<'a>(
        &'a self,
        name: &'a str,
        status: ProjectionStatus,
        message: Option<&'a str>,
    ) -> ProjectionFuture<'a, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE projection_metadata
                SET status = $2, error_message = $3, updated_at = now()
                WHERE projection_name = $1
                ",
            )
            .bind(name)
            .bind(status.as_str())
            .bind(message)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;

            expect_one(name, result.rows_affected())
        })
    }

    fn clear_position<'a>(&'a self, name: &'a str) -> ProjectionFuture<'a, ()> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE projection_metadata
                SET last_processed_position = NULL, last_processed_at = NULL, updated_at = now()
                WHERE projection_name = $1
                ",
            )
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;

            expect_one(name, result.rows_affected())
        })
    }
}

/// Snapshot rows in `projection_snapshots`.
#[derive(Clone, Debug)]
pub struct PostgresSnapshotStore {
    pool: PgPool,
}

impl PostgresSnapshotStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SnapshotStore for PostgresSnapshotStore {
    fn save(&self, snapshot: Snapshot) -> ProjectionFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO projection_snapshots
                    (id, projection_name, aggregate_id, snapshot_data, stream_position, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(snapshot.id)
            .bind(&snapshot.projection_name)
            .bind(snapshot.aggregate_id)
            .bind(&snapshot.data)
            .bind(&snapshot.stream_position)
            .bind(snapshot.created_at)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;

            tracing::info!(
                projection = %snapshot.projection_name,
                position = %snapshot.stream_position,
                bytes = snapshot.data.len(),
                "Snapshot saved"
            );
            Ok(())
        })
    }

    fn latest<'a>(&'a self, projection_name: &'a str) -> ProjectionFuture<'a, Option<Snapshot>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT id, projection_name, aggregate_id, snapshot_data, stream_position, created_at
                FROM projection_snapshots
                WHERE projection_name = $1
                ORDER BY created_at DESC
                LIMIT 1
                ",
            )
            .bind(projection_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;

            Ok(row.map(|row| Snapshot {
                id: row.get("id"),
                projection_name: row.get("projection_name"),
                aggregate_id: row.get("aggregate_id"),
                data: row.get("snapshot_data"),
                stream_position: row.get("stream_position"),
                created_at: row.get("created_at"),
            }))
        })
    }

    fn delete_all<'a>(&'a self, projection_name: &'a str) -> ProjectionFuture<'a, u64> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM projection_snapshots WHERE projection_name = $1")
                .bind(projection_name)
                .execute(&self.pool)
                .await
                .map_err(|e| ProjectionError::Storage(e.to_string()))?;
            Ok(result.rows_affected())
        })
    }

    fn count<'a>(&'a self, projection_name: Option<&'a str>) -> ProjectionFuture<'a, i64> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM projection_snapshots WHERE $1::text IS NULL OR projection_name = $1",
            )
            .bind(projection_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(e.to_string()))?;
            Ok(count)
        })
    }
}
