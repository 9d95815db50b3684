//! Health check and metrics endpoints.

use axum::{extract::State, http::header, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use std::sync::Arc;

use crate::metrics;
use crate::state::AppState;

/// Health check endpoint
///
/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.dispatcher.snapshot();
    let connections = state.registry.len();

    match state.ollama().health_check().await {
        Ok(_) => {
            metrics::set_backend_healthy(true);
            (
                StatusCode::OK,
                Json(json!({
                    "status": "healthy",
                    "ollama": "connected",
                    "connections": connections,
                    "queue_length": snapshot.queue_length,
                    "processing": snapshot.processing,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
        Err(e) => {
            metrics::set_backend_healthy(false);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "ollama": "disconnected",
                    "error": e.to_string(),
                    "connections": connections,
                    "queue_length": snapshot.queue_length,
                    "processing": snapshot.processing,
                    "version": env!("CARGO_PKG_VERSION")
                })),
            )
        }
    }
}

/// Queue and connection statistics
///
/// GET /metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.dispatcher.snapshot();

    Json(json!({
        "connections": {
            "open": state.registry.len()
        },
        "queue": {
            "length": snapshot.queue_length,
            "max": snapshot.max_queue,
            "waiting": snapshot.waiting,
            "processing": snapshot.processing
        },
        "config": {
            "ollama_url": state.config.ollama_url,
            "heartbeat_secs": state.config.heartbeat_interval.as_secs(),
            "retry_delay_ms": state.config.retry_delay.as_millis() as u64,
            "upstream_idle_timeout_secs": state.config.upstream_idle_timeout.as_secs()
        },
        "uptime_secs": state.started_at.elapsed().as_secs()
    }))
}

/// Prometheus text exposition
///
/// GET /metrics/prometheus
pub async fn metrics_prometheus() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::encode_metrics(),
    )
}

/// Live check (for Kubernetes)
///
/// GET /live
pub async fn live() -> impl IntoResponse {
    StatusCode::OK
}
