//! HTTP routes against in-memory components.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::Value;
use sparkle_cqrs_projections::{ProjectionManager, TaskProjection};
use sparkle_cqrs_runtime::{HealthChecker, HealthConfig, PrometheusMetrics};
use sparkle_cqrs_testing::{InMemoryProjectionMetadata, InMemoryReadModelStore, InMemoryStreamBus};
use sparkle_cqrs_web::{AppState, router};
use std::sync::Arc;

struct Harness {
    server: TestServer,
    bus: Arc<InMemoryStreamBus>,
}

async fn harness(metrics: PrometheusMetrics) -> Harness {
    let bus = Arc::new(InMemoryStreamBus::new());
    let health = HealthChecker::new(bus.clone(), HealthConfig::default());
    let projections = Arc::new(ProjectionManager::new(Arc::new(InMemoryProjectionMetadata::new())));
    projections
        .register(Arc::new(TaskProjection::new(
            Arc::new(InMemoryReadModelStore::new()),
            None,
        )))
        .await
        .unwrap();

    let state = AppState::new(Arc::new(health), Arc::new(metrics), projections);
    Harness {
        server: TestServer::new(router(state)).unwrap(),
        bus,
    }
}

#[tokio::test]
async fn test_healthy_pipeline_reports_every_component() {
    let h = harness(PrometheusMetrics::new()).await;

    let response = h.server.get("/health/cqrs").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["components"].as_array().unwrap().len(), 4);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_offline_bus_fails_health_and_readiness() {
    let h = harness(PrometheusMetrics::new()).await;
    h.bus.set_offline(true);

    let health = h.server.get("/health/cqrs").await;
    assert_eq!(health.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health.json::<Value>()["status"], "unhealthy");

    let ready = h.server.get("/health/cqrs/ready").await;
    assert_eq!(ready.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = ready.json();
    assert_eq!(body["status"], "not_ready");
    assert!(body["reason"].as_str().unwrap().starts_with("redis"));
}

#[tokio::test]
async fn test_liveness_ignores_dependencies() {
    let h = harness(PrometheusMetrics::new()).await;
    h.bus.set_offline(true);

    let response = h.server.get("/health/cqrs/live").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["status"], "alive");
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_readiness_when_healthy() {
    let h = harness(PrometheusMetrics::new()).await;

    let response = h.server.get("/health/cqrs/ready").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.json::<Value>()["status"], "ready");
}

#[tokio::test]
async fn test_metrics_without_recorder_is_unavailable() {
    let h = harness(PrometheusMetrics::new()).await;

    let response = h.server.get("/metrics").await;

    assert_eq!(response.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<Value>()["code"], "SERVICE_UNAVAILABLE");
}

#[tokio::test]
async fn test_metrics_renders_installed_recorder() {
    let mut metrics = PrometheusMetrics::new();
    metrics.install().unwrap();
    let h = harness(metrics).await;

    let response = h.server.get("/metrics").await;

    assert_eq!(response.status_code(), StatusCode::OK);
    let content_type = response.header("content-type");
    assert!(content_type.to_str().unwrap().starts_with("text/plain"));
}

#[tokio::test]
async fn test_projection_admin_lifecycle() {
    let h = harness(PrometheusMetrics::new()).await;

    let list: Value = h.server.get("/projections").await.json();
    assert_eq!(list[0]["name"], "task_projection");
    assert_eq!(list[0]["status"], "active");

    let paused = h.server.post("/projections/task_projection/pause").await;
    assert_eq!(paused.status_code(), StatusCode::OK);
    assert_eq!(paused.json::<Value>()["status"], "paused");

    let resumed = h.server.post("/projections/task_projection/resume").await;
    assert_eq!(resumed.json::<Value>()["status"], "active");

    let reset = h.server.post("/projections/task_projection/reset").await;
    assert_eq!(reset.status_code(), StatusCode::OK);
    assert_eq!(reset.json::<Value>()["last_processed_position"], Value::Null);
}

#[tokio::test]
async fn test_unknown_projection_is_not_found() {
    let h = harness(PrometheusMetrics::new()).await;

    let response = h.server.get("/projections/nope").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["code"], "NOT_FOUND");

    let pause = h.server.post("/projections/nope/pause").await;
    assert_eq!(pause.status_code(), StatusCode::NOT_FOUND);
}
