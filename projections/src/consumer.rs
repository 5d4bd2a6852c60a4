//! Bridges a base worker to a projection.
//!
//! The worker owns delivery (dedupe, retry, dead-lettering); this adapter serializes the
//! decoded event for the projection, records the stream position after each applied
//! message and gates fetching on the projection status.

use crate::manager::ProjectionManager;
use sparkle_cqrs_core::event::DomainEvent;
use sparkle_cqrs_core::handler::{DeliveryContext, EventHandler, HandlerError};
use sparkle_cqrs_core::projection::{ProjectionError, ProjectionHandler, ProjectionStatus};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// An [`EventHandler`] that applies events to one projection.
pub struct ProjectionConsumer {
    manager: Arc<ProjectionManager>,
    projection: Arc<dyn ProjectionHandler>,
}

impl ProjectionConsumer {
    /// Wrap a registered projection.
    #[must_use]
    pub fn new(manager: Arc<ProjectionManager>, projection: Arc<dyn ProjectionHandler>) -> Self {
        Self {
            manager,
            projection,
        }
    }

    /// Wrap the projection registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] if no such projection is registered.
    pub async fn for_registered(
        manager: Arc<ProjectionManager>,
        name: &str,
    ) -> Result<Self, ProjectionError> {
        let projection = manager.handler(name).await?;
        Ok(Self::new(manager, projection))
    }

    async fn apply(&self, event: &DomainEvent, context: &DeliveryContext) -> Result<(), HandlerError> {
        let name = self.projection.name();
        let bytes = event
            .to_json_bytes()
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;

        // Per-message failures go to retry and the DLQ; the projection status is untouched.
        match self.projection.handle(&bytes).await {
            Ok(()) => {}
            Err(ProjectionError::Storage(reason)) => return Err(HandlerError::ReadModel(reason)),
            Err(e) => {
                tracing::warn!(projection = name, event_id = %event.id, error = %e, "Projection rejected event");
                return Err(HandlerError::InvalidPayload(format!("event {}: {e}", event.id)));
            }
        }

        if let Err(e) = self.manager.update_position(name, &context.message_id).await {
            tracing::warn!(projection = name, error = %e, "Failed to record projection position");
        }
        Ok(())
    }
}

impl EventHandler for ProjectionConsumer {
    fn name(&self) -> &str {
        self.projection.name()
    }

    fn handle<'a>(
        &'a self,
        event: &'a DomainEvent,
        context: &'a DeliveryContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + 'a>> {
        Box::pin(self.apply(event, context))
    }

    /// Only an active projection takes new messages.
    fn ready(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match self.manager.get_info(self.projection.name()).await {
                Ok(info) => info.status == ProjectionStatus::Active,
                Err(e) => {
                    tracing::warn!(projection = self.projection.name(), error = %e, "Projection status unavailable");
                    false
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::task::{TaskProjection, task_view_key};
    use serde_json::json;
    use sparkle_cqrs_core::event::EventType;
    use sparkle_cqrs_core::routing::{GROUP_TASK, STREAM_TASK};
    use sparkle_cqrs_testing::{
        InMemoryProjectionMetadata, InMemoryReadModelStore, event, task_event,
    };
    use uuid::Uuid;

    async fn setup() -> (Arc<ProjectionManager>, InMemoryReadModelStore, ProjectionConsumer) {
        let store = InMemoryReadModelStore::new();
        let manager = Arc::new(ProjectionManager::new(Arc::new(InMemoryProjectionMetadata::new())));
        manager
            .register(Arc::new(TaskProjection::new(Arc::new(store.clone()), None)))
            .await
            .unwrap();
        let consumer = ProjectionConsumer::for_registered(manager.clone(), "task_projection")
            .await
            .unwrap();
        (manager, store, consumer)
    }

    fn ctx(message_id: &str) -> DeliveryContext {
        DeliveryContext::new(STREAM_TASK, GROUP_TASK, message_id)
    }

    #[tokio::test]
    async fn test_applies_event_and_records_stream_position() {
        let (manager, store, consumer) = setup().await;
        let id = Uuid::new_v4();

        consumer
            .handle(&task_event(EventType::TaskCreated, id, "u-1"), &ctx("1-0"))
            .await
            .unwrap();

        assert!(store.contains_key(&task_view_key(&id.to_string())));
        let info = manager.get_info("task_projection").await.unwrap();
        assert_eq!(info.last_processed_position.as_deref(), Some("1-0"));
    }

    #[tokio::test]
    async fn test_ready_follows_status() {
        let (manager, _store, consumer) = setup().await;
        assert!(consumer.ready().await);

        manager.pause("task_projection").await.unwrap();
        assert!(!consumer.ready().await);

        manager.resume("task_projection").await.unwrap();
        assert!(consumer.ready().await);
    }

    #[tokio::test]
    async fn test_store_failure_is_transient() {
        let (manager, store, consumer) = setup().await;
        store.set_failing(true);

        let err = consumer
            .handle(&task_event(EventType::TaskCreated, Uuid::new_v4(), "u-1"), &ctx("1-0"))
            .await
            .unwrap_err();

        assert!(matches!(err, HandlerError::ReadModel(_)));
        let info = manager.get_info("task_projection").await.unwrap();
        assert_eq!(info.status, ProjectionStatus::Active);
        assert_eq!(info.last_processed_position, None);
    }

    #[tokio::test]
    async fn test_unusable_event_leaves_projection_consuming() {
        let (manager, store, consumer) = setup().await;
        let broken = event(EventType::TaskStarted, Uuid::new_v4(), json!({"user_id": "u-1"}));

        let err = consumer.handle(&broken, &ctx("2-0")).await.unwrap_err();

        assert!(matches!(err, HandlerError::InvalidPayload(ref m) if m.contains(&broken.id)));
        let info = manager.get_info("task_projection").await.unwrap();
        assert_eq!(info.status, ProjectionStatus::Active);
        assert_eq!(info.error_message, None);
        assert_eq!(info.last_processed_position, None);
        assert!(consumer.ready().await);

        let id = Uuid::new_v4();
        consumer
            .handle(&task_event(EventType::TaskCreated, id, "u-1"), &ctx("3-0"))
            .await
            .unwrap();
        assert!(store.contains_key(&task_view_key(&id.to_string())));
        let info = manager.get_info("task_projection").await.unwrap();
        assert_eq!(info.last_processed_position.as_deref(), Some("3-0"));
    }
}
