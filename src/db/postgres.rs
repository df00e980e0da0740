use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::{queries, StateStore, Stats, StoreError};
use crate::models::batch::BatchState;
use crate::models::job::{
    ItemFilter, ItemKey, ItemState, JobStatus, NewItem, Transition, TransitionOutcome,
};

/// PostgreSQL-backed state store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StateStore for PgStore {
    async fn create_item(&self, item: NewItem) -> Result<ItemState, StoreError> {
        let mut conn = self.pool.acquire().await?;
        queries::insert_item(&mut conn, &item, None).await
    }

    async fn create_batch(
        &self,
        batch_id: Uuid,
        items: &[NewItem],
        webhook_url: Option<&str>,
    ) -> Result<BatchState, StoreError> {
        let mut tx = self.pool.begin().await?;

        let batch = queries::insert_batch(&mut tx, batch_id, items.len() as i32, webhook_url).await?;
        for (index, item) in items.iter().enumerate() {
            queries::insert_item(&mut tx, item, Some((batch_id, index as i32))).await?;
        }

        tx.commit().await?;
        tracing::debug!(batch_id = %batch_id, total = batch.total, "Batch persisted");
        Ok(batch)
    }

    async fn transition(
        &self,
        key: ItemKey,
        transition: Transition,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let Some((_, batch_id)) = queries::update_item_status(&mut tx, key, &transition).await?
        else {
            let current = queries::item_status(&mut tx, key).await?;
            tx.rollback().await?;
            return Ok(match current {
                Some(current) => TransitionOutcome::Rejected { current },
                None => TransitionOutcome::NotFound,
            });
        };

        let mut batch_just_completed = false;
        if let (Some(batch_id), true) = (batch_id, transition.to.is_terminal()) {
            let succeeded = (transition.to == JobStatus::Completed) as i32;
            let (completed, failed, total) =
                queries::increment_batch_counts(&mut tx, batch_id, succeeded, 1 - succeeded).await?;
            batch_just_completed = completed + failed == total;
        }

        tx.commit().await?;
        Ok(TransitionOutcome::Applied { batch_id, batch_just_completed })
    }

    async fn get_item(&self, job_id: Uuid) -> Result<Option<ItemState>, StoreError> {
        queries::get_item(&self.pool, job_id).await
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ItemState>, StoreError> {
        queries::list_items(&self.pool, filter).await
    }

    async fn delete_item(&self, job_id: Uuid) -> Result<bool, StoreError> {
        queries::delete_item(&self.pool, job_id).await
    }

    async fn mark_item_notified(&self, job_id: Uuid) -> Result<(), StoreError> {
        queries::mark_item_notified(&self.pool, job_id).await
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchState>, StoreError> {
        queries::get_batch(&self.pool, batch_id).await
    }

    async fn batch_items(&self, batch_id: Uuid) -> Result<Vec<ItemState>, StoreError> {
        queries::batch_items(&self.pool, batch_id).await
    }

    async fn list_batches(&self, limit: i64) -> Result<Vec<BatchState>, StoreError> {
        queries::list_batches(&self.pool, limit).await
    }

    async fn mark_batch_notified(&self, batch_id: Uuid) -> Result<bool, StoreError> {
        queries::mark_batch_notified(&self.pool, batch_id).await
    }

    async fn cancel_batch(&self, batch_id: Uuid) -> Result<Option<BatchState>, StoreError> {
        queries::cancel_batch(&self.pool, batch_id).await
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        queries::stats(&self.pool).await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        queries::ping(&self.pool).await
    }
}
