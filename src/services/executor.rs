use metrics::counter;
use std::sync::Arc;

use crate::db::StoreError;
use crate::models::cfdi::VerificationResult;
use crate::models::job::{ItemKey, JobStatus, Transition, TransitionOutcome};
use crate::models::verification::JobStatusResponse;
use crate::services::attempt::{VerificationFailure, Verifier};
use crate::services::coordinator::{complete_batch, notify_batch_item};
use crate::services::dispatch::WorkUnit;
use crate::services::notify::NotificationSink;
use crate::services::tracker::ItemStateTracker;

/// What happened to a unit handed to [`Executor::execute`].
#[derive(Debug)]
pub enum Execution {
    /// The verifier ran; its outcome has been recorded.
    Finished(Result<VerificationResult, VerificationFailure>),
    /// The item was already resolved; nothing ran.
    Skipped { current: JobStatus },
    /// No item exists for the unit's key.
    Missing,
}

/// Runs one work unit end to end: processing, verify, terminal state,
/// notifications.
pub struct Executor {
    tracker: ItemStateTracker,
    verifier: Arc<Verifier>,
    notifier: Arc<dyn NotificationSink>,
}

impl Executor {
    pub fn new(
        tracker: ItemStateTracker,
        verifier: Arc<Verifier>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self { tracker, verifier, notifier }
    }

    pub async fn execute(&self, unit: &WorkUnit) -> Result<Execution, StoreError> {
        match self.tracker.transition(unit.key, Transition::processing()).await? {
            TransitionOutcome::Applied { .. } => {}
            // Redelivered after a worker died mid-run
            TransitionOutcome::Rejected { current: JobStatus::Processing } => {
                tracing::info!(unit_id = %unit.unit_id, "Resuming unit already marked processing");
            }
            TransitionOutcome::Rejected { current } => {
                return Ok(Execution::Skipped { current });
            }
            TransitionOutcome::NotFound => return Ok(Execution::Missing),
        }

        let outcome = self.verifier.verify(&unit.request, unit.max_retries).await;

        let transition = match &outcome {
            Ok(result) => Transition::completed(result.clone()),
            Err(failure) => {
                tracing::warn!(unit_id = %unit.unit_id, error = %failure, "Verification failed");
                Transition::failed(failure.to_string())
            }
        };
        counter!("cfdi_items_total", "status" => transition.to.to_string()).increment(1);

        if let TransitionOutcome::Applied { batch_id, batch_just_completed } =
            self.tracker.transition(unit.key, transition).await?
        {
            if let Some(url) = unit.webhook_url.as_deref() {
                let sent = match unit.key {
                    ItemKey::Job { job_id } => self.notify_item(job_id, url).await,
                    ItemKey::BatchItem { .. } => {
                        notify_batch_item(
                            self.tracker.store().as_ref(),
                            self.notifier.as_ref(),
                            unit.unit_id,
                            url,
                        )
                        .await
                    }
                };
                if let Err(e) = sent {
                    tracing::warn!(unit_id = %unit.unit_id, error = %e, "Item notification skipped");
                }
            }
            if let (Some(batch_id), true) = (batch_id, batch_just_completed) {
                complete_batch(self.tracker.store().as_ref(), self.notifier.as_ref(), batch_id)
                    .await?;
            }
        }

        Ok(Execution::Finished(outcome))
    }

    async fn notify_item(&self, job_id: uuid::Uuid, url: &str) -> Result<(), StoreError> {
        let Some(item) = self.tracker.store().get_item(job_id).await? else {
            return Ok(());
        };

        let payload = serde_json::to_value(JobStatusResponse::from(&item))
            .unwrap_or(serde_json::Value::Null);
        self.notifier.deliver(url, payload).await;
        self.tracker.store().mark_item_notified(job_id).await
    }
}
