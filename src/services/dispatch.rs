//! Execution substrate for work units.
//!
//! The API and the batch coordinator only ever hand units to a
//! [`Dispatcher`]; whether they run in this process ([`LocalPool`]) or on a
//! separate worker fleet through Redis ([`JobQueue`](crate::services::queue::JobQueue))
//! is a deployment choice.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::cfdi::VerificationRequest;
use crate::models::job::ItemKey;
use crate::services::executor::Executor;
use crate::services::queue::QueueError;

/// One verification to run. `unit_id` is the item's `job_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkUnit {
    pub unit_id: Uuid,
    pub key: ItemKey,
    pub request: VerificationRequest,
    pub max_retries: u32,
    pub webhook_url: Option<String>,
}

/// Queue depth and in-flight count.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct DispatchStats {
    pub queued: u64,
    pub in_flight: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Worker pool is shut down")]
    Closed,
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, unit: WorkUnit) -> Result<(), DispatchError>;

    /// Stop the given units. Units not yet started are skipped; running ones
    /// are interrupted and their browser session torn down.
    async fn revoke(&self, unit_ids: &[Uuid]) -> Result<(), DispatchError>;

    async fn stats(&self) -> Result<DispatchStats, DispatchError>;

    async fn health_check(&self) -> Result<(), DispatchError>;
}

/// Deliveries of one unit before the pool gives up on it.
const MAX_DELIVERIES: u32 = 3;
const REDELIVERY_DELAY: Duration = Duration::from_millis(250);

/// Execute a unit, delivering it again when its outcome could not be
/// recorded. A redelivered unit finds its item still `processing` and
/// resumes it.
async fn run_with_redelivery(executor: &Executor, unit: &WorkUnit) {
    for delivery in 1..=MAX_DELIVERIES {
        match executor.execute(unit).await {
            Ok(_) => return,
            Err(e) if delivery < MAX_DELIVERIES => {
                tracing::warn!(unit_id = %unit.unit_id, delivery, error = %e, "Unit execution failed, redelivering");
                tokio::time::sleep(REDELIVERY_DELAY * delivery).await;
            }
            Err(e) => {
                tracing::error!(unit_id = %unit.unit_id, error = %e, "Unit execution failed, giving up");
            }
        }
    }
}

/// In-process pool: one task per unit, at most `concurrency` running.
pub struct LocalPool {
    executor: Arc<Executor>,
    permits: Arc<Semaphore>,
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
    queued: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
}

impl LocalPool {
    pub fn new(executor: Arc<Executor>, concurrency: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tokens: Arc::new(DashMap::new()),
            queued: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stop accepting units. Running units finish.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[async_trait]
impl Dispatcher for LocalPool {
    async fn dispatch(&self, unit: WorkUnit) -> Result<(), DispatchError> {
        if self.permits.is_closed() {
            return Err(DispatchError::Closed);
        }

        let token = CancellationToken::new();
        self.tokens.insert(unit.unit_id, token.clone());
        self.queued.fetch_add(1, Ordering::Relaxed);

        let executor = self.executor.clone();
        let permits = self.permits.clone();
        let tokens = self.tokens.clone();
        let queued = self.queued.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let unit_id = unit.unit_id;

            let permit = tokio::select! {
                _ = token.cancelled() => None,
                permit = permits.acquire_owned() => permit.ok(),
            };
            queued.fetch_sub(1, Ordering::Relaxed);

            let Some(_permit) = permit else {
                tracing::info!(unit_id = %unit_id, "Unit dropped before start");
                tokens.remove(&unit_id);
                return;
            };

            in_flight.fetch_add(1, Ordering::Relaxed);
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(unit_id = %unit_id, "Unit revoked mid-flight");
                }
                _ = run_with_redelivery(&executor, &unit) => {}
            }
            in_flight.fetch_sub(1, Ordering::Relaxed);
            tokens.remove(&unit_id);
        });

        Ok(())
    }

    async fn revoke(&self, unit_ids: &[Uuid]) -> Result<(), DispatchError> {
        for unit_id in unit_ids {
            if let Some((_, token)) = self.tokens.remove(unit_id) {
                token.cancel();
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<DispatchStats, DispatchError> {
        Ok(DispatchStats {
            queued: self.queued.load(Ordering::Relaxed) as u64,
            in_flight: self.in_flight.load(Ordering::Relaxed) as u64,
        })
    }

    async fn health_check(&self) -> Result<(), DispatchError> {
        if self.permits.is_closed() {
            return Err(DispatchError::Closed);
        }
        Ok(())
    }
}
