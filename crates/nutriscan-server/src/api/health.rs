//! Health endpoints

use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

/// `GET /health`: cheap liveness.
pub async fn health() -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "service": "nutriscan-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}

/// `GET /health/detailed`: probe each dependency; 503 when any is down.
pub async fn health_detailed(State(state): State<AppState>) -> Response {
    let job_store = match state.store.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };
    let blob_store = match state.blobs.probe().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let healthy = job_store == "ok" && blob_store == "ok";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "ok" } else { "degraded" },
            "components": {
                "job_store": job_store,
                "blob_store": blob_store,
            },
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
        .into_response()
}
