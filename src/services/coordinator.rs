//! Batch submission and aggregate completion.
//!
//! A batch is a fixed list of items created in one step. Each item runs as
//! its own work unit; the coordinator never waits on them. Completion is
//! detected by whichever unit resolves the last item (see
//! [`TransitionOutcome::Applied`]), which then calls [`complete_batch`].

use metrics::counter;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{StateStore, StoreError};
use crate::models::batch::{
    BatchCompletedEvent, BatchState, BatchStatus, BatchStatusView, ItemCompletedEvent,
};
use crate::models::cfdi::{VerificationRequest, VerificationResult};
use crate::models::job::{ItemKey, ItemState, JobStatus, NewItem, Transition, TransitionOutcome};
use crate::services::dispatch::{DispatchError, Dispatcher, WorkUnit};
use crate::services::notify::NotificationSink;
use crate::services::tracker::ItemStateTracker;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Batch not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub struct BatchCoordinator {
    tracker: ItemStateTracker,
    dispatcher: Arc<dyn Dispatcher>,
    notifier: Arc<dyn NotificationSink>,
    max_batch_size: usize,
    max_retries: u32,
}

impl BatchCoordinator {
    pub fn new(
        tracker: ItemStateTracker,
        dispatcher: Arc<dyn Dispatcher>,
        notifier: Arc<dyn NotificationSink>,
        max_batch_size: usize,
        max_retries: u32,
    ) -> Self {
        Self { tracker, dispatcher, notifier, max_batch_size, max_retries }
    }

    fn store(&self) -> &dyn StateStore {
        self.tracker.store().as_ref()
    }

    /// Persist a batch and dispatch one unit per item.
    ///
    /// Nothing is written when the batch is rejected. Items whose dispatch
    /// fails are marked failed so the batch still converges.
    pub async fn submit(
        &self,
        requests: Vec<VerificationRequest>,
        webhook_url: Option<String>,
    ) -> Result<BatchState, CoordinatorError> {
        if requests.is_empty() {
            return Err(CoordinatorError::InvalidBatch("batch has no items".to_string()));
        }
        if requests.len() > self.max_batch_size {
            return Err(CoordinatorError::InvalidBatch(format!(
                "batch has {} items, the limit is {}",
                requests.len(),
                self.max_batch_size
            )));
        }

        let batch_id = Uuid::new_v4();
        let items: Vec<NewItem> = requests
            .iter()
            .map(|request| NewItem::for_request(request, None))
            .collect();

        let batch = self
            .store()
            .create_batch(batch_id, &items, webhook_url.as_deref())
            .await?;
        counter!("cfdi_batches_total").increment(1);
        tracing::info!(batch_id = %batch_id, total = batch.total, "Batch created");

        for (index, (item, request)) in items.iter().zip(requests).enumerate() {
            let key = ItemKey::BatchItem { batch_id, index: index as i32 };
            let unit = WorkUnit {
                unit_id: item.job_id,
                key,
                request,
                max_retries: self.max_retries,
                webhook_url: webhook_url.clone(),
            };

            if let Err(e) = self.dispatcher.dispatch(unit).await {
                tracing::error!(batch_id = %batch_id, index, error = %e, "Failed to dispatch batch item");
                let outcome = self
                    .tracker
                    .transition(key, Transition::failed(format!("dispatch failed: {}", e)))
                    .await?;
                if let TransitionOutcome::Applied { batch_just_completed, .. } = outcome {
                    if let Some(url) = webhook_url.as_deref() {
                        notify_batch_item(self.store(), self.notifier.as_ref(), item.job_id, url)
                            .await?;
                    }
                    if batch_just_completed {
                        complete_batch(self.store(), self.notifier.as_ref(), batch_id).await?;
                    }
                }
            }
        }

        Ok(batch)
    }

    /// Current counters, plus results when the batch is complete or when
    /// asked for.
    pub async fn status(
        &self,
        batch_id: Uuid,
        include_results: bool,
    ) -> Result<BatchStatusView, CoordinatorError> {
        let batch = self
            .store()
            .get_batch(batch_id)
            .await?
            .ok_or(CoordinatorError::NotFound(batch_id))?;
        self.view(batch, include_results).await
    }

    async fn view(
        &self,
        batch: BatchState,
        include_results: bool,
    ) -> Result<BatchStatusView, CoordinatorError> {
        let status = batch.status();
        let results = if include_results || status == BatchStatus::Completed {
            let items = self.store().batch_items(batch.batch_id).await?;
            Some(collect_results(&items))
        } else {
            None
        };

        Ok(BatchStatusView {
            batch_id: batch.batch_id,
            status,
            total: batch.total,
            completed: batch.completed,
            failed: batch.failed,
            pending: batch.pending(),
            results,
        })
    }

    /// Revoke every unresolved item. Resolved items keep their results and
    /// unresolved ones keep their current status.
    pub async fn cancel(&self, batch_id: Uuid) -> Result<BatchStatusView, CoordinatorError> {
        let batch = self
            .store()
            .cancel_batch(batch_id)
            .await?
            .ok_or(CoordinatorError::NotFound(batch_id))?;

        let unresolved: Vec<Uuid> = self
            .store()
            .batch_items(batch_id)
            .await?
            .iter()
            .filter(|item| !item.status.is_terminal())
            .map(|item| item.job_id)
            .collect();

        self.dispatcher.revoke(&unresolved).await?;
        tracing::info!(batch_id = %batch_id, revoked = unresolved.len(), "Batch cancelled");

        self.view(batch, false).await
    }

    /// Recent batches without results.
    pub async fn list(&self, limit: i64) -> Result<Vec<BatchStatusView>, CoordinatorError> {
        let batches = self.store().list_batches(limit.clamp(1, 500)).await?;
        Ok(batches
            .into_iter()
            .map(|batch| BatchStatusView {
                batch_id: batch.batch_id,
                status: batch.status(),
                total: batch.total,
                completed: batch.completed,
                failed: batch.failed,
                pending: batch.pending(),
                results: None,
            })
            .collect())
    }
}

/// Item results in index order. Failed and unresolved items are `None`.
pub fn collect_results(items: &[ItemState]) -> Vec<Option<VerificationResult>> {
    items
        .iter()
        .map(|item| match item.status {
            JobStatus::Completed => item.result.clone(),
            _ => None,
        })
        .collect()
}

/// Send the `item_completed` event for a batch item that just resolved.
pub async fn notify_batch_item(
    store: &dyn StateStore,
    notifier: &dyn NotificationSink,
    job_id: Uuid,
    url: &str,
) -> Result<(), StoreError> {
    let event = store
        .get_item(job_id)
        .await?
        .as_ref()
        .and_then(ItemCompletedEvent::for_item);
    let Some(event) = event else {
        return Ok(());
    };

    let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
    notifier.deliver(url, payload).await;
    store.mark_item_notified(job_id).await
}

/// Send the aggregate event for a batch whose last item just resolved.
///
/// Guarded by the batch's `webhook_sent` flag, so a second call for the same
/// batch does nothing.
pub async fn complete_batch(
    store: &dyn StateStore,
    notifier: &dyn NotificationSink,
    batch_id: Uuid,
) -> Result<(), StoreError> {
    let batch = store
        .get_batch(batch_id)
        .await?
        .ok_or(StoreError::BatchNotFound(batch_id))?;

    if !store.mark_batch_notified(batch_id).await? {
        tracing::debug!(batch_id = %batch_id, "Batch completion already handled");
        return Ok(());
    }

    let items = store.batch_items(batch_id).await?;
    counter!("cfdi_batches_completed_total").increment(1);
    tracing::info!(
        batch_id = %batch_id,
        total = batch.total,
        completed = batch.completed,
        failed = batch.failed,
        "Batch completed"
    );

    if let Some(url) = batch.webhook_url.as_deref() {
        let event = BatchCompletedEvent {
            kind: "batch_completed".to_string(),
            batch_id,
            total: batch.total,
            completed: batch.completed,
            failed: batch.failed,
            results: collect_results(&items),
        };
        let payload = serde_json::to_value(&event).unwrap_or(serde_json::Value::Null);
        notifier.deliver(url, payload).await;
    }

    Ok(())
}
