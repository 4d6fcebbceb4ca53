use axum::extract::State;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Prometheus metrics scrape endpoint.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the pipeline's metrics with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "studio_items_submitted_total",
        "Total photos submitted to batch runs"
    );
    metrics::describe_counter!(
        "studio_items_completed_total",
        "Total photos that finished with a result"
    );
    metrics::describe_counter!(
        "studio_items_failed_total",
        "Total photos that ended in the failed state"
    );
    metrics::describe_counter!(
        "studio_generation_requests_total",
        "Generation calls issued to the image service"
    );
    metrics::describe_counter!(
        "studio_generation_retries_total",
        "Generation attempts that were retried, by reason"
    );
    metrics::describe_histogram!(
        "studio_rate_gate_wait_seconds",
        "Time spent waiting for a request slot"
    );
    metrics::describe_histogram!(
        "studio_item_processing_seconds",
        "Time from first attempt to a terminal status"
    );
    metrics::describe_gauge!(
        "studio_items_in_flight",
        "Photos currently holding a processing slot"
    );
    metrics::describe_gauge!(
        "studio_batches_tracked",
        "Batch runs held in memory by the HTTP service"
    );
}
