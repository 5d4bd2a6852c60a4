//! `ProjectionManager`: registry and lifecycle of projections.
//!
//! # Overview
//!
//! The manager owns the set of registered [`ProjectionHandler`]s and is the only
//! writer of their runtime metadata:
//! - Registers handlers and makes sure each has a metadata row
//! - Tracks status, position and the last error per projection
//! - Validates status transitions and exports the status gauge
//! - Locks the status of a projection while a rebuild or reset owns it
//! - Resets a projection by dropping its keys and forgetting its position
//!
//! ```text
//!            register / pause / resume / reset
//! operator ─────────────────────────────────────► ProjectionManager
//!                                                   │          │
//!                                      handlers map │          │ metadata rows
//!                                                   ▼          ▼
//!                                        ProjectionHandler   ProjectionMetadataStore
//! ```
//!
//! Live delivery goes through a base worker wrapped around [`crate::ProjectionConsumer`];
//! replays go through [`crate::ProjectionBuilder`]. Both report positions here.
//!
//! # Example
//!
//! ```ignore
//! use sparkle_cqrs_projections::{ProjectionManager, TaskProjection};
//!
//! let manager = ProjectionManager::new(Arc::new(PostgresProjectionMetadata::new(pool)));
//! manager.register(Arc::new(TaskProjection::new(store, None))).await?;
//!
//! manager.pause("task_projection").await?;
//! manager.reset("task_projection").await?;
//! ```

use crate::metrics::ProjectionMetrics;
use sparkle_cqrs_core::projection::{
    ProjectionError, ProjectionHandler, ProjectionInfo, ProjectionMetadataStore, ProjectionStatus,
    Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::RwLock;

/// Schema version written when a projection is first registered.
pub const INITIAL_VERSION: i32 = 1;

/// Registry and lifecycle of projections.
pub struct ProjectionManager {
    metadata: Arc<dyn ProjectionMetadataStore>,
    /// Write-locked on register, read-locked on lookup.
    handlers: RwLock<HashMap<String, Arc<dyn ProjectionHandler>>>,
    /// Projections with a rebuild or reset in flight.
    rebuilds: Arc<Mutex<HashSet<String>>>,
}

fn lock(rebuilds: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    rebuilds.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive hold on a projection's status for the length of a rebuild.
///
/// Operator status changes are refused while it is alive. Dropping it releases the
/// projection whatever status the rebuild left behind.
pub(crate) struct RebuildLease {
    name: String,
    rebuilds: Arc<Mutex<HashSet<String>>>,
}

impl RebuildLease {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for RebuildLease {
    fn drop(&mut self) {
        lock(&self.rebuilds).remove(&self.name);
    }
}

impl ProjectionManager {
    /// Create a manager over a metadata store.
    #[must_use]
    pub fn new(metadata: Arc<dyn ProjectionMetadataStore>) -> Self {
        Self {
            metadata,
            handlers: RwLock::new(HashMap::new()),
            rebuilds: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register a handler and make sure its metadata row exists.
    ///
    /// An existing row keeps its status and position, so a restart resumes where the
    /// projection left off.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::AlreadyRegistered`] for a duplicate name, or
    /// [`ProjectionError::Storage`] if the row cannot be written.
    pub async fn register(&self, handler: Arc<dyn ProjectionHandler>) -> Result<ProjectionInfo> {
        let mut handlers = self.handlers.write().await;
        let name = handler.name().to_string();
        if handlers.contains_key(&name) {
            return Err(ProjectionError::AlreadyRegistered(name));
        }

        let info = self.metadata.ensure(&name, INITIAL_VERSION).await?;
        if info.status == ProjectionStatus::Rebuilding {
            tracing::warn!(
                projection = %name,
                position = ?info.last_processed_position,
                "Projection was left rebuilding; rebuild it again or resume it"
            );
        }
        ProjectionMetrics::set_status(&name, info.status);
        handlers.insert(name.clone(), handler);

        tracing::info!(projection = %name, status = %info.status, "Projection registered");
        Ok(info)
    }

    /// The handler registered under `name`.
    pub async fn get_handler(&self, name: &str) -> Option<Arc<dyn ProjectionHandler>> {
        self.handlers.read().await.get(name).cloned()
    }

    /// Names of every registered handler, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub(crate) async fn handler(&self, name: &str) -> Result<Arc<dyn ProjectionHandler>> {
        self.get_handler(name)
            .await
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))
    }

    /// Current metadata of one projection.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] if no row exists.
    pub async fn get_info(&self, name: &str) -> Result<ProjectionInfo> {
        self.metadata
            .get(name)
            .await?
            .ok_or_else(|| ProjectionError::NotFound(name.to_string()))
    }

    /// Metadata of every projection, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on failure.
    pub async fn list_all(&self) -> Result<Vec<ProjectionInfo>> {
        self.metadata.list().await
    }

    /// Record the last applied position.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] for unknown names.
    pub async fn update_position(&self, name: &str, position: &str) -> Result<()> {
        self.metadata.update_position(name, position).await
    }

    pub(crate) async fn clear_position(&self, name: &str) -> Result<()> {
        self.metadata.clear_position(name).await
    }

    /// Move a projection to `status`. `message` replaces the stored error message.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::InvalidTransition`] while a rebuild or reset is running,
    /// or when leaving `error` other than through a reset or resume.
    /// Returns [`ProjectionError::NotFound`] for unknown names.
    pub async fn set_status(
        &self,
        name: &str,
        status: ProjectionStatus,
        message: Option<&str>,
    ) -> Result<()> {
        if self.is_rebuilding(name) {
            return Err(ProjectionError::InvalidTransition {
                name: name.to_string(),
                from: ProjectionStatus::Rebuilding,
                to: status,
            });
        }
        self.write_status(name, status, message).await
    }

    /// Whether a rebuild or reset currently owns the projection's status.
    #[must_use]
    pub fn is_rebuilding(&self, name: &str) -> bool {
        lock(&self.rebuilds).contains(name)
    }

    /// Take the projection's status for a rebuild and move it to `rebuilding`.
    ///
    /// Fails with [`ProjectionError::InvalidTransition`] if another rebuild holds it.
    pub(crate) async fn begin_rebuild(&self, name: &str) -> Result<RebuildLease> {
        if !lock(&self.rebuilds).insert(name.to_string()) {
            return Err(ProjectionError::InvalidTransition {
                name: name.to_string(),
                from: ProjectionStatus::Rebuilding,
                to: ProjectionStatus::Rebuilding,
            });
        }
        let lease = RebuildLease {
            name: name.to_string(),
            rebuilds: Arc::clone(&self.rebuilds),
        };
        self.write_status(name, ProjectionStatus::Rebuilding, None).await?;
        Ok(lease)
    }

    /// Status write made by the rebuild holding `lease`.
    pub(crate) async fn set_rebuild_status(
        &self,
        lease: &RebuildLease,
        status: ProjectionStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.write_status(&lease.name, status, message).await
    }

    async fn write_status(
        &self,
        name: &str,
        status: ProjectionStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let current = self.get_info(name).await?.status;
        if !current.can_transition_to(status) {
            return Err(ProjectionError::InvalidTransition {
                name: name.to_string(),
                from: current,
                to: status,
            });
        }

        self.metadata.set_status(name, status, message).await?;
        ProjectionMetrics::set_status(name, status);

        if status == ProjectionStatus::Error {
            tracing::error!(projection = name, from = %current, error = ?message, "Projection failed");
        } else {
            tracing::info!(projection = name, from = %current, to = %status, "Projection status changed");
        }
        Ok(())
    }

    /// Stop feeding a projection. Its messages wait in the stream.
    ///
    /// # Errors
    ///
    /// See [`ProjectionManager::set_status`].
    pub async fn pause(&self, name: &str) -> Result<()> {
        self.set_status(name, ProjectionStatus::Paused, None).await
    }

    /// Feed a paused or failed projection again. Clears the error message.
    ///
    /// # Errors
    ///
    /// See [`ProjectionManager::set_status`].
    pub async fn resume(&self, name: &str) -> Result<()> {
        self.set_status(name, ProjectionStatus::Active, None).await
    }

    /// Drop every key of a projection and forget its position.
    ///
    /// The projection is `rebuilding` while its keys are deleted and `active` afterwards.
    /// A failed delete leaves it in `error`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] for unknown names,
    /// [`ProjectionError::InvalidTransition`] while a rebuild is running, or the
    /// handler's error.
    pub async fn reset(&self, name: &str) -> Result<()> {
        let handler = self.handler(name).await?;
        let lease = self.begin_rebuild(name).await?;

        if let Err(e) = handler.reset().await {
            let message = e.to_string();
            self.set_rebuild_status(&lease, ProjectionStatus::Error, Some(&message))
                .await?;
            return Err(e);
        }

        self.metadata.clear_position(name).await?;
        self.set_rebuild_status(&lease, ProjectionStatus::Active, None)
            .await?;

        tracing::info!(projection = name, "Projection reset");
        Ok(())
    }
}
