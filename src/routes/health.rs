use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub batches: BatchCounts,
}

#[derive(Serialize)]
pub struct BatchCounts {
    pub total: usize,
    pub active: usize,
}

/// GET /health: liveness plus the number of tracked batch runs.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        batches: BatchCounts {
            total: state.batch_count(),
            active: state.active_batch_count(),
        },
    };

    (StatusCode::OK, Json(response))
}
