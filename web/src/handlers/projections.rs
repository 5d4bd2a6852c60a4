//! Projection admin endpoints.
//!
//! ```text
//! GET  /projections              every projection's metadata
//! GET  /projections/:name        one projection
//! POST /projections/:name/pause  stop feeding it
//! POST /projections/:name/resume feed it again
//! POST /projections/:name/reset  drop its keys and position
//! ```
//!
//! Rebuilds are long-running and stay with the operator tooling that owns the
//! [`ProjectionBuilder`](sparkle_cqrs_projections::ProjectionBuilder).

use crate::WebResult;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
};
use sparkle_cqrs_core::projection::ProjectionInfo;

/// List every projection.
///
/// # Errors
///
/// 500 when the metadata store fails.
pub async fn list(State(state): State<AppState>) -> WebResult<Json<Vec<ProjectionInfo>>> {
    Ok(Json(state.projections.list_all().await?))
}

/// One projection's metadata.
///
/// # Errors
///
/// 404 for unknown names.
pub async fn get(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> WebResult<Json<ProjectionInfo>> {
    Ok(Json(state.projections.get_info(&name).await?))
}

/// Pause a projection.
///
/// # Errors
///
/// 404 for unknown names, 409 when the projection is in `error`.
pub async fn pause(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> WebResult<Json<ProjectionInfo>> {
    state.projections.pause(&name).await?;
    tracing::info!(projection = %name, "Projection paused via admin API");
    Ok(Json(state.projections.get_info(&name).await?))
}

/// Resume a paused or failed projection.
///
/// # Errors
///
/// 404 for unknown names.
pub async fn resume(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> WebResult<Json<ProjectionInfo>> {
    state.projections.resume(&name).await?;
    tracing::info!(projection = %name, "Projection resumed via admin API");
    Ok(Json(state.projections.get_info(&name).await?))
}

/// Reset a projection.
///
/// # Errors
///
/// 404 for unknown names, 500 when its keys cannot be dropped.
pub async fn reset(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> WebResult<Json<ProjectionInfo>> {
    state.projections.reset(&name).await?;
    tracing::warn!(projection = %name, "Projection reset via admin API");
    Ok(Json(state.projections.get_info(&name).await?))
}
