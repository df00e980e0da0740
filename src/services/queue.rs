use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use std::time::Duration;
use uuid::Uuid;

use crate::services::dispatch::{DispatchError, DispatchStats, Dispatcher, WorkUnit};
use crate::services::encryption::{EncryptionError, EncryptionService};

const UNITS_KEY: &str = "cfdi_verify:units";
const PROCESSING_KEY: &str = "cfdi_verify:processing";
const REVOKED_KEY: &str = "cfdi_verify:revoked";
/// Sorted set of processing entries scored by their last heartbeat.
const LEASES_KEY: &str = "cfdi_verify:leases";

/// A unit taken off the queue. Holds the exact sealed entry so it can be
/// removed from the processing list once handled.
#[derive(Debug)]
pub struct Delivery {
    pub unit: WorkUnit,
    payload: String,
}

/// Redis-backed work queue consumed by the `worker` binary.
///
/// Units move from a pending list to a processing list on dequeue and are
/// removed when complete. Every processing entry holds a lease that its
/// worker renews while running; [`JobQueue::requeue_stale`] returns entries
/// whose lease lapsed to the pending list. Revocation is a set of unit ids
/// the worker checks before and during execution.
pub struct JobQueue {
    client: redis::Client,
    sealer: EncryptionService,
}

impl JobQueue {
    pub fn new(redis_url: &str, sealer: EncryptionService) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, sealer })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Enqueue a work unit.
    pub async fn enqueue(&self, unit: &WorkUnit) -> Result<(), QueueError> {
        let payload = self.sealer.seal(unit)?;
        let mut conn = self.connection().await?;
        conn.lpush::<_, _, ()>(UNITS_KEY, &payload).await?;
        tracing::debug!(unit_id = %unit.unit_id, "Unit enqueued");
        Ok(())
    }

    /// Take the oldest unit, moving it to the processing list.
    ///
    /// An entry that cannot be opened is dropped from the processing list
    /// and reported as [`QueueError::Payload`].
    pub async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = conn.rpoplpush(UNITS_KEY, PROCESSING_KEY).await?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match self.sealer.open::<WorkUnit>(&payload) {
            Ok(unit) => {
                conn.zadd::<_, _, _, ()>(LEASES_KEY, &payload, Utc::now().timestamp())
                    .await?;
                Ok(Some(Delivery { unit, payload }))
            }
            Err(e) => {
                conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload).await?;
                Err(e.into())
            }
        }
    }

    /// Extend the lease on a delivery that is still running.
    pub async fn renew(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.zadd::<_, _, _, ()>(LEASES_KEY, &delivery.payload, Utc::now().timestamp())
            .await?;
        Ok(())
    }

    /// Mark a delivery as handled.
    pub async fn complete(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &delivery.payload).await?;
        conn.zrem::<_, _, ()>(LEASES_KEY, &delivery.payload).await?;
        conn.srem::<_, _, ()>(REVOKED_KEY, delivery.unit.unit_id.to_string())
            .await?;
        Ok(())
    }

    /// Move processing entries whose lease is older than `lease` back to
    /// the pending list, where they are taken next. Returns how many moved.
    ///
    /// An entry without a lease (its worker died between taking it and
    /// leasing it) gets one now and is reclaimed once that lapses. Removal
    /// from the processing list decides which of several concurrent callers
    /// requeues an entry.
    pub async fn requeue_stale(&self, lease: Duration) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let now = Utc::now().timestamp();
        let cutoff = (now - lease.as_secs() as i64) as f64;
        let entries: Vec<String> = conn.lrange(PROCESSING_KEY, 0, -1).await?;

        let mut requeued = 0;
        for payload in entries {
            let leased_at: Option<f64> = conn.zscore(LEASES_KEY, &payload).await?;
            match leased_at {
                None => {
                    redis::cmd("ZADD")
                        .arg(LEASES_KEY)
                        .arg("NX")
                        .arg(now)
                        .arg(&payload)
                        .query_async::<()>(&mut conn)
                        .await?;
                }
                Some(at) if at <= cutoff => {
                    let removed: i64 = conn.lrem(PROCESSING_KEY, 1, &payload).await?;
                    conn.zrem::<_, _, ()>(LEASES_KEY, &payload).await?;
                    if removed > 0 {
                        conn.rpush::<_, _, ()>(UNITS_KEY, &payload).await?;
                        requeued += 1;
                    }
                }
                Some(_) => {}
            }
        }

        if requeued > 0 {
            tracing::warn!(count = requeued, "Requeued units with lapsed leases");
        }
        Ok(requeued)
    }

    pub async fn is_revoked(&self, unit_id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.sismember(REVOKED_KEY, unit_id.to_string()).await?)
    }

    /// Pending units.
    pub async fn queue_depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(UNITS_KEY).await?)
    }

    /// Units taken by a worker and not yet completed.
    pub async fn in_flight(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        Ok(conn.llen(PROCESSING_KEY).await?)
    }

    /// Check Redis connectivity (for health checks).
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Dispatcher for JobQueue {
    async fn dispatch(&self, unit: WorkUnit) -> Result<(), DispatchError> {
        Ok(self.enqueue(&unit).await?)
    }

    async fn revoke(&self, unit_ids: &[Uuid]) -> Result<(), DispatchError> {
        if unit_ids.is_empty() {
            return Ok(());
        }
        let members: Vec<String> = unit_ids.iter().map(Uuid::to_string).collect();
        let mut conn = self.connection().await?;
        conn.sadd::<_, _, ()>(REVOKED_KEY, members)
            .await
            .map_err(QueueError::from)?;
        tracing::info!(count = unit_ids.len(), "Units revoked");
        Ok(())
    }

    async fn stats(&self) -> Result<DispatchStats, DispatchError> {
        Ok(DispatchStats {
            queued: self.queue_depth().await?,
            in_flight: self.in_flight().await?,
        })
    }

    async fn health_check(&self) -> Result<(), DispatchError> {
        Ok(self.ping().await?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Unreadable queue entry: {0}")]
    Payload(#[from] EncryptionError),
}
