use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::models::cfdi::{
    ReferenceTriple, VerificationMethod, VerificationRequest, VerificationResult,
};

/// Lifecycle status of a single verification item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Statuses an item may be in for a move to `self` to be accepted.
    ///
    /// Moves only go forward; terminal statuses have no successors.
    pub fn allowed_predecessors(self) -> &'static [JobStatus] {
        match self {
            Self::Pending => &[],
            Self::Processing => &[Self::Pending],
            Self::Completed | Self::Failed => &[Self::Pending, Self::Processing],
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        next.allowed_predecessors().contains(&self)
    }
}

/// Identifies an item either as a standalone job or by its batch position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKey {
    Job { job_id: Uuid },
    BatchItem { batch_id: Uuid, index: i32 },
}

impl std::fmt::Display for ItemKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job { job_id } => write!(f, "job:{}", job_id),
            Self::BatchItem { batch_id, index } => write!(f, "batch:{}#{}", batch_id, index),
        }
    }
}

/// Durable record of one verification item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemState {
    pub job_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub batch_index: Option<i32>,
    pub method: VerificationMethod,
    pub reference: Option<ReferenceTriple>,
    pub xml_hash: Option<String>,
    pub status: JobStatus,
    pub valid: Option<bool>,
    pub result: Option<VerificationResult>,
    pub error: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_sent: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ItemState {
    pub fn key(&self) -> ItemKey {
        match (self.batch_id, self.batch_index) {
            (Some(batch_id), Some(index)) => ItemKey::BatchItem { batch_id, index },
            _ => ItemKey::Job { job_id: self.job_id },
        }
    }
}

/// Fields needed to insert a new item.
#[derive(Debug, Clone)]
pub struct NewItem {
    pub job_id: Uuid,
    pub method: VerificationMethod,
    pub reference: Option<ReferenceTriple>,
    pub xml_hash: Option<String>,
    pub webhook_url: Option<String>,
}

impl NewItem {
    pub fn for_request(request: &VerificationRequest, webhook_url: Option<String>) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            method: request.method(),
            reference: request.reference().cloned(),
            xml_hash: request.document_hash(),
            webhook_url,
        }
    }
}

/// A requested status change, with its payload.
#[derive(Debug, Clone)]
pub struct Transition {
    pub to: JobStatus,
    pub result: Option<VerificationResult>,
    pub error: Option<String>,
}

impl Transition {
    pub fn processing() -> Self {
        Self { to: JobStatus::Processing, result: None, error: None }
    }

    pub fn completed(result: VerificationResult) -> Self {
        Self { to: JobStatus::Completed, result: Some(result), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { to: JobStatus::Failed, result: None, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        batch_id: Option<Uuid>,
        /// True for exactly one caller per batch: the one whose transition
        /// resolved the last outstanding item.
        batch_just_completed: bool,
    },
    Rejected { current: JobStatus },
    NotFound,
}

/// Filters for the verification history listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemFilter {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub status: Option<JobStatus>,
    pub valid: Option<bool>,
    pub folio_fiscal: Option<String>,
    pub rfc_emisor: Option<String>,
    pub rfc_receptor: Option<String>,
    pub xml_hash: Option<String>,
}

impl ItemFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 500;

    /// Clamped `(limit, offset)`.
    pub fn page(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT);
        (limit, self.offset.unwrap_or(0).max(0))
    }

    pub fn matches(&self, item: &ItemState) -> bool {
        let reference = item.reference.as_ref();
        self.status.map_or(true, |s| item.status == s)
            && self.valid.map_or(true, |v| item.valid == Some(v))
            && self
                .folio_fiscal
                .as_deref()
                .map_or(true, |f| reference.is_some_and(|r| r.uuid == f))
            && self
                .rfc_emisor
                .as_deref()
                .map_or(true, |f| reference.is_some_and(|r| r.issuer_rfc == f))
            && self
                .rfc_receptor
                .as_deref()
                .map_or(true, |f| reference.is_some_and(|r| r.receiver_rfc == f))
            && self
                .xml_hash
                .as_deref()
                .map_or(true, |h| item.xml_hash.as_deref() == Some(h))
    }
}
