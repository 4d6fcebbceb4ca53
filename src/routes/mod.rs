pub mod batches;
pub mod health;
pub mod metrics;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;

use crate::app_state::AppState;
use crate::services::validation::MAX_SOURCE_BYTES;

/// Room for a handful of full-size photos plus multipart framing per request.
pub const MAX_REQUEST_BYTES: usize = 4 * MAX_SOURCE_BYTES;

/// Health check and batch API. The Prometheus endpoint and the tracing,
/// compression and CORS layers are added by the server binary.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/batches", post(batches::create_batch))
        .route(
            "/api/v1/batches/{batch_id}",
            get(batches::get_batch).delete(batches::delete_batch),
        )
        .route("/api/v1/batches/{batch_id}/items", post(batches::add_items))
        .route("/api/v1/batches/{batch_id}/pause", post(batches::pause_batch))
        .route(
            "/api/v1/batches/{batch_id}/resume",
            post(batches::resume_batch),
        )
        .route(
            "/api/v1/batches/{batch_id}/cancel",
            post(batches::cancel_batch),
        )
        .route(
            "/api/v1/batches/{batch_id}/items/{item_id}/reprocess",
            post(batches::reprocess_item),
        )
        .route(
            "/api/v1/batches/{batch_id}/items/{item_id}/retouch",
            post(batches::retouch_item),
        )
        .route(
            "/api/v1/batches/{batch_id}/items/{item_id}/hero",
            post(batches::hero_item),
        )
        .route(
            "/api/v1/batches/{batch_id}/items/{item_id}/result",
            get(batches::get_result),
        )
        .with_state(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
}
