//! Community feed projection.
//!
//! Keys:
//! - `post:view:{post_id}`: JSON [`PostView`]
//! - `feed:global`: sorted set of post ids scored by creation time (Unix seconds)

use crate::keyspace::{self, required};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sparkle_cqrs_core::event::{DomainEvent, EventType, aggregate};
use sparkle_cqrs_core::lookup::{CanonicalLookup, UserSummary};
use sparkle_cqrs_core::projection::{ProjectionFuture, ProjectionHandler, Result};
use sparkle_cqrs_core::read_model::{ReadModelStore, WriteOp};
use std::sync::Arc;
use uuid::Uuid;

/// Projection name.
pub const COMMUNITY_PROJECTION: &str = "community_projection";

/// Global feed key.
pub const FEED_GLOBAL: &str = "feed:global";

const OWNED: [&str; 2] = ["post:view:*", FEED_GLOBAL];

/// Key of a post view.
#[must_use]
pub fn post_view_key(post_id: &str) -> String {
    format!("post:view:{post_id}")
}

/// Author fields embedded in a post view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorView {
    /// User id.
    pub id: String,
    /// Display name.
    pub username: String,
    /// Avatar.
    pub avatar_url: Option<String>,
}

/// Denormalized post as served by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostView {
    /// Post id.
    pub id: String,
    /// Author id.
    pub user_id: String,
    /// Body text.
    pub content: String,
    /// Attached images.
    pub image_urls: Vec<String>,
    /// Topic tag.
    pub topic: Option<String>,
    /// Likes, never negative.
    pub like_count: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Author.
    pub user: AuthorView,
}

/// Maintains post views and the global feed.
pub struct CommunityProjection {
    store: Arc<dyn ReadModelStore>,
    lookup: Option<Arc<dyn CanonicalLookup>>,
}

impl CommunityProjection {
    /// Create the projection. `lookup` fills fields older events do not carry.
    #[must_use]
    pub fn new(store: Arc<dyn ReadModelStore>, lookup: Option<Arc<dyn CanonicalLookup>>) -> Self {
        Self { store, lookup }
    }

    async fn author(&self, event: &DomainEvent, user_id: &str) -> Result<AuthorView> {
        if let Some(username) = event.payload_str("username") {
            return Ok(AuthorView {
                id: user_id.to_string(),
                username: username.to_string(),
                avatar_url: event.payload_str("avatar_url").map(str::to_string),
            });
        }

        let summary = match (&self.lookup, Uuid::parse_str(user_id)) {
            (Some(lookup), Ok(id)) => lookup.user(id).await.map_err(keyspace::lookup_failed)?,
            _ => None,
        };
        Ok(summary.map_or_else(
            || AuthorView {
                id: user_id.to_string(),
                username: String::new(),
                avatar_url: None,
            },
            |UserSummary { id, username, avatar_url }| AuthorView {
                id: id.to_string(),
                username,
                avatar_url,
            },
        ))
    }

    async fn post_created(&self, event: &DomainEvent) -> Result<()> {
        let post_id = required(event, "post_id")?;
        let mut user_id = required(event, "user_id")?.to_string();
        let key = post_view_key(post_id);

        let mut content = event.payload_str("content").map(str::to_string);
        let mut image_urls = string_list(event, "image_urls");
        let mut topic = event.payload_str("topic").map(str::to_string);
        let mut created_at = keyspace::timestamp(event, "created_at");

        if content.is_none() {
            if let (Some(lookup), Ok(id)) = (&self.lookup, Uuid::parse_str(post_id)) {
                let Some(post) = lookup.post(id).await.map_err(keyspace::lookup_failed)? else {
                    tracing::debug!(post_id, event_id = %event.id, "Post no longer exists, skipping view");
                    return Ok(());
                };
                content = Some(post.content);
                image_urls = image_urls.or(Some(post.image_urls));
                topic = topic.or(post.topic);
                created_at = created_at.or(Some(post.created_at));
                user_id = post.user_id.to_string();
            }
        }

        let existing: Option<PostView> = keyspace::read_json(self.store.as_ref(), &key).await?;
        let created_at = created_at.unwrap_or(event.timestamp);
        let view = PostView {
            id: post_id.to_string(),
            user: self.author(event, &user_id).await?,
            user_id,
            content: content.unwrap_or_default(),
            image_urls: image_urls.unwrap_or_default(),
            topic,
            like_count: existing.map_or(0, |v| v.like_count),
            created_at,
        };

        keyspace::apply(
            self.store.as_ref(),
            vec![
                keyspace::write_json(&key, &view)?,
                WriteOp::zadd(FEED_GLOBAL, keyspace::score(created_at), post_id),
            ],
        )
        .await
    }

    async fn post_updated(&self, event: &DomainEvent) -> Result<()> {
        let post_id = required(event, "post_id")?;
        self.patch(post_id, |view| {
            if let Some(content) = event.payload_str("content") {
                view.content = content.to_string();
            }
            if let Some(images) = string_list(event, "image_urls") {
                view.image_urls = images;
            }
            if let Some(topic) = event.payload_str("topic") {
                view.topic = Some(topic.to_string());
            }
        })
        .await
    }

    async fn post_deleted(&self, event: &DomainEvent) -> Result<()> {
        let post_id = required(event, "post_id")?;
        keyspace::apply(
            self.store.as_ref(),
            vec![WriteOp::del(post_view_key(post_id)), WriteOp::zrem(FEED_GLOBAL, post_id)],
        )
        .await
    }

    /// Rewrite an existing view. A missing view is left alone.
    async fn patch(&self, post_id: &str, change: impl FnOnce(&mut PostView) + Send) -> Result<()> {
        let key = post_view_key(post_id);
        let Some(mut view) = keyspace::read_json::<PostView>(self.store.as_ref(), &key).await? else {
            tracing::debug!(post_id, "No post view to update");
            return Ok(());
        };
        change(&mut view);
        keyspace::apply(self.store.as_ref(), vec![keyspace::write_json(&key, &view)?]).await
    }

    async fn apply_event(&self, event: &DomainEvent) -> Result<()> {
        match event.event_type {
            EventType::PostCreated => self.post_created(event).await,
            EventType::PostUpdated => self.post_updated(event).await,
            EventType::PostDeleted => self.post_deleted(event).await,
            EventType::PostLiked => {
                self.patch(required(event, "post_id")?, |view| view.like_count += 1)
                    .await
            }
            EventType::PostUnliked => {
                self.patch(required(event, "post_id")?, |view| {
                    view.like_count = (view.like_count - 1).max(0);
                })
                .await
            }
            _ => {
                tracing::debug!(event_type = %event.event_type, event_id = %event.id, "Ignoring event");
                Ok(())
            }
        }
    }
}

fn string_list(event: &DomainEvent, field: &str) -> Option<Vec<String>> {
    event.payload.get(field)?.as_array().map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect()
    })
}

impl ProjectionHandler for CommunityProjection {
    fn name(&self) -> &str {
        COMMUNITY_PROJECTION
    }

    fn aggregate_type(&self) -> &str {
        aggregate::POST
    }

    fn handle<'a>(&'a self, event_bytes: &'a [u8]) -> ProjectionFuture<'a, ()> {
        Box::pin(async move {
            let event = keyspace::decode(event_bytes)?;
            self.apply_event(&event).await
        })
    }

    fn reset(&self) -> ProjectionFuture<'_, ()> {
        Box::pin(async move {
            let deleted = keyspace::drop_owned(self.store.as_ref(), &OWNED).await?;
            tracing::info!(projection = COMMUNITY_PROJECTION, keys_deleted = deleted, "Projection keys dropped");
            Ok(())
        })
    }

    fn capture_snapshot(&self) -> ProjectionFuture<'_, Vec<u8>> {
        Box::pin(keyspace::capture(self.store.as_ref(), &OWNED))
    }

    fn restore_snapshot<'a>(&'a self, data: &'a [u8]) -> ProjectionFuture<'a, ()> {
        Box::pin(keyspace::restore(self.store.as_ref(), &OWNED, data))
    }
}
