//! Read access to canonical business rows.
//!
//! Projection handlers prefer data carried in the event payload. When an older event
//! type lacks a field a view needs, a handler may fall back to the committed row
//! through [`CanonicalLookup`]. The publisher only relays after commit, so the row is
//! at least as new as the event.

use crate::handler::HandlerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// Future returned by [`CanonicalLookup`] methods.
pub type LookupFuture<'a, T> = Pin<Box<dyn Future<Output = Result<Option<T>, HandlerError>> + Send + 'a>>;

/// Public profile fields embedded in denormalized views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    /// User id.
    pub id: Uuid,
    /// Display name.
    pub username: String,
    /// Avatar, if set.
    pub avatar_url: Option<String>,
}

/// A committed community post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    /// Post id.
    pub id: Uuid,
    /// Author.
    pub user_id: Uuid,
    /// Body text.
    pub content: String,
    /// Attached images.
    pub image_urls: Vec<String>,
    /// Optional topic tag.
    pub topic: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// A committed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task id.
    pub id: Uuid,
    /// Owner.
    pub user_id: Uuid,
    /// Title.
    pub title: String,
    /// Task kind.
    pub task_type: String,
    /// Current status.
    pub status: String,
    /// Planned duration.
    pub estimated_minutes: Option<i32>,
    /// Difficulty rating.
    pub difficulty: Option<i32>,
    /// Priority.
    pub priority: Option<i32>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Lookups against the canonical store.
pub trait CanonicalLookup: Send + Sync {
    /// Fetch a post by id.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Lookup`] on storage failure.
    fn post(&self, post_id: Uuid) -> LookupFuture<'_, PostRecord>;

    /// Fetch a user's public profile.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Lookup`] on storage failure.
    fn user(&self, user_id: Uuid) -> LookupFuture<'_, UserSummary>;

    /// Fetch a task by id.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::Lookup`] on storage failure.
    fn task(&self, task_id: Uuid) -> LookupFuture<'_, TaskRecord>;
}
