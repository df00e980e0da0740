use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use base64::Engine;
use garde::Validate;

use crate::app_state::AppState;
use crate::models::cfdi::{VerificationRequest, VerificationResult};
use crate::models::job::{ItemKey, JobStatus, NewItem, Transition};
use crate::models::verification::{JobResponse, VerifyFolioRequest, VerifyXmlRequest};
use crate::routes::ApiError;
use crate::services::dispatch::WorkUnit;
use crate::services::executor::Execution;

/// Persist a standalone item for `request` and build its work unit.
async fn create_unit(
    state: &AppState,
    request: VerificationRequest,
    max_retries: u32,
    webhook_url: Option<String>,
) -> Result<WorkUnit, ApiError> {
    let item = NewItem::for_request(&request, webhook_url.clone());
    let job_id = item.job_id;
    state.store.create_item(item).await?;

    Ok(WorkUnit {
        unit_id: job_id,
        key: ItemKey::Job { job_id },
        request,
        max_retries,
        webhook_url,
    })
}

async fn run_inline(state: &AppState, unit: WorkUnit) -> Result<Json<VerificationResult>, ApiError> {
    match state.executor.execute(&unit).await? {
        Execution::Finished(Ok(result)) => Ok(Json(result)),
        Execution::Finished(Err(failure)) => {
            Err(ApiError::new(StatusCode::BAD_GATEWAY, failure.to_string()))
        }
        Execution::Skipped { current } => Err(ApiError::new(
            StatusCode::CONFLICT,
            format!("job {} is already {}", unit.unit_id, current),
        )),
        Execution::Missing => Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("job {} vanished before it ran", unit.unit_id),
        )),
    }
}

async fn dispatch(state: &AppState, unit: WorkUnit) -> Result<Json<JobResponse>, ApiError> {
    let job_id = unit.unit_id;
    let key = unit.key;

    if let Err(e) = state.dispatcher.dispatch(unit).await {
        state
            .store
            .transition(key, Transition::failed(format!("dispatch failed: {}", e)))
            .await?;
        return Err(e.into());
    }

    Ok(Json(JobResponse {
        job_id,
        status: JobStatus::Pending,
        created_at: chrono::Utc::now().to_rfc3339(),
        message: "Verification queued".to_string(),
    }))
}

/// The XML document from either the raw or the base64 field.
fn document(request: &VerifyXmlRequest) -> Result<String, ApiError> {
    let xml = match (&request.xml_content, &request.xml_base64) {
        (Some(content), _) => content.clone(),
        (None, Some(encoded)) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|_| ApiError::bad_request("xml_base64 is not valid base64"))?;
            String::from_utf8(bytes)
                .map_err(|_| ApiError::bad_request("xml_base64 does not decode to UTF-8"))?
        }
        (None, None) => {
            return Err(ApiError::bad_request("xml_content or xml_base64 is required"));
        }
    };

    if xml.trim().is_empty() {
        return Err(ApiError::bad_request("XML document is empty"));
    }
    Ok(xml)
}

/// POST /api/v1/verify/folio — verify by folio fiscal and wait for the result.
pub async fn verify_folio(
    State(state): State<AppState>,
    Json(payload): Json<VerifyFolioRequest>,
) -> Result<Json<VerificationResult>, ApiError> {
    payload.validate()?;
    let request = VerificationRequest::ByReference(payload.reference());
    let unit = create_unit(&state, request, payload.max_retries, None).await?;
    run_inline(&state, unit).await
}

/// POST /api/v1/verify/folio/async — queue a folio verification.
pub async fn verify_folio_async(
    State(state): State<AppState>,
    Json(payload): Json<VerifyFolioRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    payload.validate()?;
    let request = VerificationRequest::ByReference(payload.reference());
    let unit = create_unit(&state, request, payload.max_retries, payload.webhook_url).await?;
    dispatch(&state, unit).await
}

/// POST /api/v1/verify/xml — verify an uploaded CFDI and wait for the result.
pub async fn verify_xml(
    State(state): State<AppState>,
    Json(payload): Json<VerifyXmlRequest>,
) -> Result<Json<VerificationResult>, ApiError> {
    payload.validate()?;
    let request = VerificationRequest::ByDocument { xml: document(&payload)? };
    let unit = create_unit(&state, request, payload.max_retries, None).await?;
    run_inline(&state, unit).await
}

/// POST /api/v1/verify/xml/async — queue an XML verification.
pub async fn verify_xml_async(
    State(state): State<AppState>,
    Json(payload): Json<VerifyXmlRequest>,
) -> Result<Json<JobResponse>, ApiError> {
    payload.validate()?;
    let xml = document(&payload)?;
    let request = VerificationRequest::ByDocument { xml };
    let unit = create_unit(&state, request, payload.max_retries, payload.webhook_url).await?;
    dispatch(&state, unit).await
}
