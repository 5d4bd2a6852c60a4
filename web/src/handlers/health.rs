//! Health and metrics endpoints.
//!
//! Load balancers hit the liveness and readiness probes; monitoring reads the full
//! report and `/metrics`.

use crate::error::AppError;
use crate::state::AppState;
use axum::{Json, extract::State, http::StatusCode, http::header, response::IntoResponse};
use chrono::Utc;
use serde_json::{Value, json};
use sparkle_cqrs_runtime::{CqrsHealth, HealthStatus};

/// Full pipeline report.
///
/// # Endpoint
///
/// ```text
/// GET /health/cqrs
/// ```
///
/// # Status Codes
///
/// - 200 OK: healthy or degraded
/// - 503 Service Unavailable: unhealthy
pub async fn cqrs_health(State(state): State<AppState>) -> (StatusCode, Json<CqrsHealth>) {
    let report = state.health.check().await;
    let status = if report.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(report))
}

/// Liveness: the process answers. Checks nothing.
///
/// ```text
/// GET /health/cqrs/live
/// ```
#[allow(clippy::unused_async)]
pub async fn liveness() -> Json<Value> {
    Json(json!({
        "status": "alive",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Readiness: the pipeline is not unhealthy.
///
/// ```text
/// GET /health/cqrs/ready
/// ```
///
/// A 503 response names the first unhealthy component in `reason`.
pub async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let report = state.health.check().await;
    if !report.status.is_unhealthy() {
        return (StatusCode::OK, Json(json!({"status": "ready"})));
    }

    let reason = report
        .components
        .iter()
        .find(|c| c.status == HealthStatus::Unhealthy)
        .map_or_else(
            || "pipeline unhealthy".to_string(),
            |c| match &c.message {
                Some(message) => format!("{}: {message}", c.name),
                None => c.name.clone(),
            },
        );
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({"status": "not_ready", "reason": reason})),
    )
}

/// Prometheus text exposition.
///
/// ```text
/// GET /metrics
/// ```
///
/// # Errors
///
/// 503 when this process did not install the recorder.
#[allow(clippy::unused_async)]
pub async fn metrics(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let body = state
        .metrics
        .render()
        .ok_or_else(|| AppError::unavailable("metrics recorder not installed"))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
