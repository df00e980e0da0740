use axum::extract::State;
use axum::Json;

use crate::app_state::AppState;
use crate::db::Stats;
use crate::routes::ApiError;
use crate::services::dispatch::DispatchStats;

/// GET /api/v1/stats — item counts by status and validity.
pub async fn stats(State(state): State<AppState>) -> Result<Json<Stats>, ApiError> {
    Ok(Json(state.store.stats().await?))
}

/// GET /api/v1/queue/stats — pending and in-flight work units.
pub async fn queue_stats(State(state): State<AppState>) -> Result<Json<DispatchStats>, ApiError> {
    let stats = state.dispatcher.stats().await?;
    metrics::gauge!("cfdi_queue_depth").set(stats.queued as f64);
    Ok(Json(stats))
}
