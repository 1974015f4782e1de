//! HTTP handlers

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, instrument};

use super::dto::{HealthResponse, ReadyResponse};
use super::server::ApiState;

/// Liveness: the process is up
#[instrument]
pub async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness: every cache has completed its initial list
#[instrument(skip(state))]
pub async fn readyz(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadyResponse>) {
    let pending = state.readiness.pending();
    if pending.is_empty() {
        return (
            StatusCode::OK,
            Json(ReadyResponse {
                ready: true,
                pending,
            }),
        );
    }

    debug!(?pending, "not ready");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ReadyResponse {
            ready: false,
            pending,
        }),
    )
}

/// Prometheus text exposition
#[cfg(feature = "metrics")]
pub async fn metrics() -> (StatusCode, String) {
    use prometheus_client::encoding::text::encode;

    let mut buffer = String::new();
    match encode(&mut buffer, &crate::controller::metrics::REGISTRY) {
        Ok(()) => (StatusCode::OK, buffer),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        ),
    }
}
