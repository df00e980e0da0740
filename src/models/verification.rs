use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::cfdi::{ReferenceTriple, VerificationResult};
use crate::models::job::{ItemState, JobStatus};

fn default_max_retries() -> u32 {
    3
}

/// Request to verify a CFDI by folio fiscal.
#[derive(Debug, Deserialize, Validate)]
pub struct VerifyFolioRequest {
    /// Folio fiscal (UUID)
    #[garde(length(chars, min = 36, max = 36))]
    pub id: String,

    /// RFC emisor
    #[garde(length(chars, min = 12, max = 13))]
    pub re: String,

    /// RFC receptor
    #[garde(length(chars, min = 12, max = 13))]
    pub rr: String,

    /// Total amount. The SAT form ignores it; accepted for compatibility.
    #[garde(skip)]
    pub tt: Option<String>,

    #[garde(length(chars, max = 500))]
    pub webhook_url: Option<String>,

    #[serde(default = "default_max_retries")]
    #[garde(range(min = 1, max = 10))]
    pub max_retries: u32,
}

impl VerifyFolioRequest {
    pub fn reference(&self) -> ReferenceTriple {
        ReferenceTriple {
            uuid: self.id.trim().to_string(),
            issuer_rfc: self.re.trim().to_string(),
            receiver_rfc: self.rr.trim().to_string(),
        }
    }
}

/// Request to verify a CFDI by uploading its XML.
#[derive(Debug, Deserialize, Validate)]
pub struct VerifyXmlRequest {
    #[garde(skip)]
    pub xml_content: Option<String>,

    #[garde(skip)]
    pub xml_base64: Option<String>,

    #[garde(length(chars, max = 500))]
    pub webhook_url: Option<String>,

    #[serde(default = "default_max_retries")]
    #[garde(range(min = 1, max = 10))]
    pub max_retries: u32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BatchItem {
    #[garde(length(chars, min = 36, max = 36))]
    pub id: String,

    #[garde(length(chars, min = 12, max = 13))]
    pub re: String,

    #[garde(length(chars, min = 12, max = 13))]
    pub rr: String,
}

/// Request to verify many CFDIs as one batch.
#[derive(Debug, Deserialize, Validate)]
pub struct BatchRequest {
    #[garde(dive)]
    pub items: Vec<BatchItem>,

    #[garde(length(chars, max = 500))]
    pub webhook_url: Option<String>,
}

/// Response after queueing a single verification.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: String,
    pub message: String,
}

/// Response for querying job status. Also the per-item webhook payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub result: Option<VerificationResult>,
    pub error: Option<String>,
}

impl From<&ItemState> for JobStatusResponse {
    fn from(item: &ItemState) -> Self {
        Self {
            job_id: item.job_id,
            status: item.status,
            created_at: item.created_at.to_rfc3339(),
            completed_at: item.completed_at.map(|t| t.to_rfc3339()),
            result: item.result.clone(),
            error: item.error.clone(),
        }
    }
}

/// Response after submitting a batch.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub batch_id: Uuid,
    pub total_items: usize,
    pub status: String,
    pub created_at: String,
    pub message: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct BatchStatusQuery {
    #[serde(default)]
    pub include_results: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folio_request_defaults_retries() {
        let req: VerifyFolioRequest = serde_json::from_value(serde_json::json!({
            "id": "9FD4B473-1EE0-42E2-9D29-5DAEC8057A18",
            "re": "DORA990310A30",
            "rr": "REGL960120LPA"
        }))
        .unwrap();
        assert_eq!(req.max_retries, 3);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_folio_request_rejects_bad_rfc() {
        let req: VerifyFolioRequest = serde_json::from_value(serde_json::json!({
            "id": "9FD4B473-1EE0-42E2-9D29-5DAEC8057A18",
            "re": "DORA",
            "rr": "REGL960120LPA",
            "max_retries": 3
        }))
        .unwrap();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_rfc_length_counts_characters() {
        // "Ñ" is two bytes but one character
        let req: VerifyFolioRequest = serde_json::from_value(serde_json::json!({
            "id": "9FD4B473-1EE0-42E2-9D29-5DAEC8057A18",
            "re": "PEÑA900101AB1",
            "rr": "MUÑO85021HQ7"
        }))
        .unwrap();
        assert!(req.validate().is_ok());

        let batch: BatchRequest = serde_json::from_value(serde_json::json!({
            "items": [{
                "id": "9FD4B473-1EE0-42E2-9D29-5DAEC8057A18",
                "re": "NUÑE7708153T9",
                "rr": "REGL960120LPA"
            }]
        }))
        .unwrap();
        assert!(batch.validate().is_ok());

        let too_long: VerifyFolioRequest = serde_json::from_value(serde_json::json!({
            "id": "9FD4B473-1EE0-42E2-9D29-5DAEC8057A18",
            "re": "PEÑA900101AB12",
            "rr": "REGL960120LPA"
        }))
        .unwrap();
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_batch_request_validates_items() {
        let req: BatchRequest = serde_json::from_value(serde_json::json!({
            "items": [{"id": "too-short", "re": "DORA990310A30", "rr": "REGL960120LPA"}]
        }))
        .unwrap();
        assert!(req.validate().is_err());
    }
}
