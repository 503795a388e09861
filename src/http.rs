use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::engine::{Engine, HealthSnapshot};
use crate::metrics::CrawlerMetrics;

#[derive(Serialize)]
struct HealthBody {
    #[serde(flatten)]
    snapshot: HealthSnapshot,
}

async fn health_handler(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let snapshot = engine.health_snapshot().await;
    let status = if snapshot.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(HealthBody { snapshot }))
}

async fn ready_handler(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let snapshot = engine.health_snapshot().await;
    if snapshot.healthy {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// `/health`, `/healthz`, `/ready` backed by the engine's health snapshot.
pub fn health_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

async fn metrics_handler(State(metrics): State<Arc<CrawlerMetrics>>) -> impl IntoResponse {
    match metrics.render() {
        Ok(response) => response,
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to render metrics: {e}"),
        )
            .into_response(),
    }
}

/// `/metrics`, serving Prometheus text exposition format.
pub fn metrics_router(metrics: Arc<CrawlerMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}
