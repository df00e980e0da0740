use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::Display;
use uuid::Uuid;

use crate::models::cfdi::VerificationResult;
use crate::models::job::{ItemState, JobStatus};

/// Aggregate status of a batch, derived from its counters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Cancelled,
}

/// Counters for a fixed-size batch of verification items.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchState {
    pub batch_id: Uuid,
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
    pub webhook_url: Option<String>,
    pub webhook_sent: bool,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl BatchState {
    pub fn resolved(&self) -> i32 {
        self.completed + self.failed
    }

    pub fn pending(&self) -> i32 {
        self.total - self.resolved()
    }

    pub fn status(&self) -> BatchStatus {
        if self.resolved() >= self.total {
            BatchStatus::Completed
        } else if self.cancelled_at.is_some() {
            BatchStatus::Cancelled
        } else if self.resolved() > 0 {
            BatchStatus::Processing
        } else {
            BatchStatus::Pending
        }
    }
}

/// Polled view of a batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchStatusView {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
    pub pending: i32,
    /// Ordered by item index; unresolved or failed items are `null`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Option<VerificationResult>>>,
}

/// Aggregate webhook payload sent once per batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCompletedEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub batch_id: Uuid,
    pub total: i32,
    pub completed: i32,
    pub failed: i32,
    pub results: Vec<Option<VerificationResult>>,
}

/// Webhook payload sent as each batch item resolves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemCompletedEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub batch_id: Uuid,
    pub item_index: i32,
    pub job_id: Uuid,
    pub folio_fiscal: Option<String>,
    pub status: JobStatus,
    pub result: Option<VerificationResult>,
    pub error: Option<String>,
}

impl ItemCompletedEvent {
    /// `None` for standalone jobs.
    pub fn for_item(item: &ItemState) -> Option<Self> {
        Some(Self {
            kind: "item_completed".to_string(),
            batch_id: item.batch_id?,
            item_index: item.batch_index?,
            job_id: item.job_id,
            folio_fiscal: item.reference.as_ref().map(|r| r.uuid.clone()),
            status: item.status,
            result: item.result.clone(),
            error: item.error.clone(),
        })
    }
}
