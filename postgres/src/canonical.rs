//! Canonical-row lookups for projection enrichment.
//!
//! Reads the business tables (`posts`, `users`, `tasks`) that command services own. The
//! substrate never writes them.

use sparkle_cqrs_core::handler::HandlerError;
use sparkle_cqrs_core::lookup::{CanonicalLookup, LookupFuture, PostRecord, TaskRecord, UserSummary};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// `PostgreSQL` implementation of [`CanonicalLookup`].
#[derive(Clone, Debug)]
pub struct PostgresCanonicalLookup {
    pool: PgPool,
}

impl PostgresCanonicalLookup {
    /// Create a lookup over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl CanonicalLookup for PostgresCanonicalLookup {
    fn post(&self, post_id: Uuid) -> LookupFuture<'_, PostRecord> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT id, user_id, content, image_urls, topic, created_at
                FROM posts
                WHERE id = $1 AND deleted_at IS NULL
                ",
            )
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HandlerError::Lookup(format!("post {post_id}: {e}")))?;

            Ok(row.map(|row| {
                let images: Option<serde_json::Value> = row.get("image_urls");
                PostRecord {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    content: row.get("content"),
                    image_urls: images
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default(),
                    topic: row.get("topic"),
                    created_at: row.get("created_at"),
                }
            }))
        })
    }

    fn user(&self, user_id: Uuid) -> LookupFuture<'_, UserSummary> {
        Box::pin(async move {
            let row = sqlx::query("SELECT id, username, avatar_url FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| HandlerError::Lookup(format!("user {user_id}: {e}")))?;

            Ok(row.map(|row| UserSummary {
                id: row.get("id"),
                username: row.get("username"),
                avatar_url: row.get("avatar_url"),
            }))
        })
    }

    fn task(&self, task_id: Uuid) -> LookupFuture<'_, TaskRecord> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT id, user_id, title, type::text AS task_type, status::text AS status,
                       estimated_minutes, difficulty, priority, created_at
                FROM tasks
                WHERE id = $1
                ",
            )
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HandlerError::Lookup(format!("task {task_id}: {e}")))?;

            Ok(row.map(|row| TaskRecord {
                id: row.get("id"),
                user_id: row.get("user_id"),
                title: row.get("title"),
                task_type: row.get("task_type"),
                status: row.get("status"),
                estimated_minutes: row.get("estimated_minutes"),
                difficulty: row.get("difficulty"),
                priority: row.get("priority"),
                created_at: row.get("created_at"),
            }))
        })
    }
}
