//! Axum routes for operating the Sparkle CQRS pipeline.
//!
//! ```text
//! GET  /health/cqrs           component report (200 healthy/degraded, 503 unhealthy)
//! GET  /health/cqrs/live      liveness
//! GET  /health/cqrs/ready     readiness
//! GET  /metrics               Prometheus exposition
//! GET  /projections[/:name]   projection metadata
//! POST /projections/:name/{pause,resume,reset}
//! ```
//!
//! # Example
//!
//! ```ignore
//! use sparkle_cqrs_web::{AppState, router};
//!
//! let app = router(AppState::new(health, metrics, projections));
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! ```

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod state;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

pub use error::AppError;
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

/// Build the router with request tracing.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/cqrs", get(handlers::health::cqrs_health))
        .route("/health/cqrs/live", get(handlers::health::liveness))
        .route("/health/cqrs/ready", get(handlers::health::readiness))
        .route("/metrics", get(handlers::health::metrics))
        .route("/projections", get(handlers::projections::list))
        .route("/projections/:name", get(handlers::projections::get))
        .route("/projections/:name/pause", post(handlers::projections::pause))
        .route("/projections/:name/resume", post(handlers::projections::resume))
        .route("/projections/:name/reset", post(handlers::projections::reset))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
