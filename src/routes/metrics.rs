use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// GET /metrics — Prometheus text exposition.
pub async fn prometheus_metrics(State(handle): State<Arc<PrometheusHandle>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

/// Register descriptions for every metric the service emits.
pub fn describe() {
    metrics::describe_counter!(
        "cfdi_verification_attempts_total",
        "Portal form submissions, including retries"
    );
    metrics::describe_counter!(
        "cfdi_captcha_rejections_total",
        "Attempts the portal rejected for a wrong CAPTCHA answer"
    );
    metrics::describe_histogram!(
        "cfdi_verification_seconds",
        metrics::Unit::Seconds,
        "Time to verify one CFDI, across all attempts"
    );
    metrics::describe_counter!(
        "cfdi_items_total",
        "Verification items resolved, by terminal status"
    );
    metrics::describe_counter!("cfdi_batches_total", "Batches submitted");
    metrics::describe_counter!(
        "cfdi_batches_completed_total",
        "Batches whose items all resolved"
    );
    metrics::describe_counter!(
        "cfdi_notifications_failed_total",
        "Webhook deliveries that failed or were rejected"
    );
    metrics::describe_gauge!("cfdi_queue_depth", "Work units waiting to start");
}
