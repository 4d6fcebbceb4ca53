use axum::routing::get;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use vehicle_studio_pipeline::{
    app_state::AppState,
    config::AppConfig,
    routes,
    services::{gemini::GeminiClient, scheduler::BatchScheduler},
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing vehicle studio pipeline server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    tracing::info!(
        model = %config.gemini_model,
        text_model = %config.gemini_text_model,
        "Initializing Gemini client"
    );
    let gemini = GeminiClient::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        config.gemini_text_model.clone(),
        Some(config.gemini_api_base.clone()),
    );

    let scheduler_config = config.scheduler_config();
    tracing::info!(
        concurrency = scheduler_config.concurrency,
        max_requests_per_minute = config.max_requests_per_minute,
        min_spacing_ms = config.min_spacing().as_millis() as u64,
        max_attempts = scheduler_config.retry.max_attempts,
        batch_retention_secs = config.batch_retention_secs,
        "Batch scheduler configured"
    );
    let scheduler = BatchScheduler::new(Arc::new(gemini), scheduler_config);

    // Create shared application state
    let state = AppState::new(scheduler, config.batch_retention());

    // Build API routes
    let app = routes::app_router(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    tracing::info!("Starting vehicle studio pipeline on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
