use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;
use crate::db::StoreError;
use crate::services::coordinator::CoordinatorError;
use crate::services::dispatch::DispatchError;

pub mod batch;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod stats;
pub mod verify;

/// Build the full HTTP router.
pub fn router(state: AppState, prometheus: Arc<PrometheusHandle>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/verify/folio", post(verify::verify_folio))
        .route("/api/v1/verify/folio/async", post(verify::verify_folio_async))
        .route("/api/v1/verify/xml", post(verify::verify_xml))
        .route("/api/v1/verify/xml/async", post(verify::verify_xml_async))
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route(
            "/api/v1/jobs/{job_id}",
            get(jobs::get_job).delete(jobs::delete_job),
        )
        .route(
            "/api/v1/batch",
            post(batch::submit_batch).get(batch::list_batches),
        )
        .route(
            "/api/v1/batch/{batch_id}",
            get(batch::get_batch).delete(batch::cancel_batch),
        )
        .route("/api/v1/stats", get(stats::stats))
        .route("/api/v1/queue/stats", get(stats::queue_stats))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(metrics::prometheus_metrics).with_state(prometheus),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(10 * 1024 * 1024)) // 10 MB, XML uploads
}

/// Error response: a status code and a JSON `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        Self::bad_request(report.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "State store error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error")
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        tracing::error!(error = %e, "Dispatch error");
        Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        match e {
            CoordinatorError::InvalidBatch(msg) => Self::bad_request(msg),
            CoordinatorError::NotFound(id) => Self::not_found(format!("batch {} not found", id)),
            CoordinatorError::Store(e) => e.into(),
            CoordinatorError::Dispatch(e) => e.into(),
        }
    }
}
