use axum::extract::{Path, Query, State};
use axum::Json;
use garde::Validate;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::batch::BatchStatusView;
use crate::models::cfdi::{ReferenceTriple, VerificationRequest};
use crate::models::verification::{BatchRequest, BatchResponse, BatchStatusQuery, ListQuery};
use crate::routes::ApiError;

/// POST /api/v1/batch — submit up to the configured limit of folio lookups.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(payload): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    payload.validate()?;

    let requests: Vec<VerificationRequest> = payload
        .items
        .iter()
        .map(|item| {
            VerificationRequest::ByReference(ReferenceTriple {
                uuid: item.id.trim().to_string(),
                issuer_rfc: item.re.trim().to_string(),
                receiver_rfc: item.rr.trim().to_string(),
            })
        })
        .collect();

    let batch = state.coordinator.submit(requests, payload.webhook_url).await?;

    Ok(Json(BatchResponse {
        batch_id: batch.batch_id,
        total_items: batch.total as usize,
        status: batch.status().to_string(),
        created_at: batch.created_at.to_rfc3339(),
        message: format!("Batch of {} verifications queued", batch.total),
    }))
}

/// GET /api/v1/batch/{batch_id} — counters, and results when complete or
/// when `include_results=true`.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
    Query(query): Query<BatchStatusQuery>,
) -> Result<Json<BatchStatusView>, ApiError> {
    Ok(Json(state.coordinator.status(batch_id, query.include_results).await?))
}

/// GET /api/v1/batch — recent batches.
pub async fn list_batches(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BatchStatusView>>, ApiError> {
    Ok(Json(state.coordinator.list(query.limit.unwrap_or(50)).await?))
}

/// DELETE /api/v1/batch/{batch_id} — cancel unresolved items.
pub async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchStatusView>, ApiError> {
    Ok(Json(state.coordinator.cancel(batch_id).await?))
}
