//! Shared state of the HTTP routes.

use sparkle_cqrs_projections::ProjectionManager;
use sparkle_cqrs_runtime::{HealthChecker, PrometheusMetrics};
use std::sync::Arc;

/// Everything a handler can reach.
///
/// Cloned per request, so every field is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// Cached pipeline health.
    pub health: Arc<HealthChecker>,
    /// Prometheus recorder, rendered on `/metrics`.
    pub metrics: Arc<PrometheusMetrics>,
    /// Projection registry for the admin routes.
    pub projections: Arc<ProjectionManager>,
}

impl AppState {
    /// Bundle the shared components.
    #[must_use]
    pub const fn new(
        health: Arc<HealthChecker>,
        metrics: Arc<PrometheusMetrics>,
        projections: Arc<ProjectionManager>,
    ) -> Self {
        Self {
            health,
            metrics,
            projections,
        }
    }
}
