use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{ItemFilter, ItemState};
use crate::models::verification::JobStatusResponse;
use crate::routes::ApiError;

/// GET /api/v1/jobs/{job_id} — status and result of one verification.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let item = state
        .store
        .get_item(job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {} not found", job_id)))?;

    Ok(Json(JobStatusResponse::from(&item)))
}

/// GET /api/v1/jobs — verification history, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(filter): Query<ItemFilter>,
) -> Result<Json<Vec<ItemState>>, ApiError> {
    Ok(Json(state.store.list_items(&filter).await?))
}

/// DELETE /api/v1/jobs/{job_id} — stop a standalone job if it is still
/// running, then remove it.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let item = state
        .store
        .get_item(job_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("job {} not found", job_id)))?;

    if let Some(batch_id) = item.batch_id {
        return Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("job {} belongs to batch {}; cancel the batch instead", job_id, batch_id),
        ));
    }

    if !item.status.is_terminal() {
        state.dispatcher.revoke(&[job_id]).await?;
    }
    state.store.delete_item(job_id).await?;
    tracing::info!(job_id = %job_id, "Job deleted");

    Ok(StatusCode::NO_CONTENT)
}
