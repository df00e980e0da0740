use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

use crate::db::{StateStore, Stats, StoreError};
use crate::models::batch::BatchState;
use crate::models::job::{
    ItemFilter, ItemKey, ItemState, JobStatus, NewItem, Transition, TransitionOutcome,
};

#[derive(Default)]
struct Tables {
    items: HashMap<Uuid, ItemState>,
    batches: HashMap<Uuid, BatchState>,
    positions: HashMap<(Uuid, i32), Uuid>,
}

impl Tables {
    fn resolve(&self, key: ItemKey) -> Option<Uuid> {
        match key {
            ItemKey::Job { job_id } => self.items.contains_key(&job_id).then_some(job_id),
            ItemKey::BatchItem { batch_id, index } => self.positions.get(&(batch_id, index)).copied(),
        }
    }
}

fn new_state(item: &NewItem, position: Option<(Uuid, i32)>) -> ItemState {
    ItemState {
        job_id: item.job_id,
        batch_id: position.map(|(batch_id, _)| batch_id),
        batch_index: position.map(|(_, index)| index),
        method: item.method,
        reference: item.reference.clone(),
        xml_hash: item.xml_hash.clone(),
        status: JobStatus::Pending,
        valid: None,
        result: None,
        error: None,
        webhook_url: item.webhook_url.clone(),
        webhook_sent: false,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

/// Single-process state store. Every operation runs under one lock, which
/// gives `transition` the same all-or-nothing behavior as a transaction.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn create_item(&self, item: NewItem) -> Result<ItemState, StoreError> {
        let state = new_state(&item, None);
        self.tables.lock().items.insert(item.job_id, state.clone());
        Ok(state)
    }

    async fn create_batch(
        &self,
        batch_id: Uuid,
        items: &[NewItem],
        webhook_url: Option<&str>,
    ) -> Result<BatchState, StoreError> {
        let batch = BatchState {
            batch_id,
            total: items.len() as i32,
            completed: 0,
            failed: 0,
            webhook_url: webhook_url.map(str::to_string),
            webhook_sent: false,
            created_at: Utc::now(),
            completed_at: None,
            cancelled_at: None,
        };

        let mut tables = self.tables.lock();
        tables.batches.insert(batch_id, batch.clone());
        for (index, item) in items.iter().enumerate() {
            let index = index as i32;
            tables.positions.insert((batch_id, index), item.job_id);
            tables.items.insert(item.job_id, new_state(item, Some((batch_id, index))));
        }
        Ok(batch)
    }

    async fn transition(
        &self,
        key: ItemKey,
        transition: Transition,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut tables = self.tables.lock();

        let Some(job_id) = tables.resolve(key) else {
            return Ok(TransitionOutcome::NotFound);
        };
        let Some(item) = tables.items.get_mut(&job_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if !item.status.can_transition_to(transition.to) {
            return Ok(TransitionOutcome::Rejected { current: item.status });
        }

        let now = Utc::now();
        item.status = transition.to;
        match transition.to {
            JobStatus::Processing => item.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed => item.completed_at = Some(now),
            JobStatus::Pending => {}
        }
        if let Some(result) = transition.result {
            item.valid = Some(result.valid);
            item.result = Some(result);
        }
        if transition.error.is_some() {
            item.error = transition.error;
        }
        let batch_id = item.batch_id;

        let mut batch_just_completed = false;
        if let (Some(batch_id), true) = (batch_id, transition.to.is_terminal()) {
            let batch = tables
                .batches
                .get_mut(&batch_id)
                .ok_or(StoreError::BatchNotFound(batch_id))?;
            if transition.to == JobStatus::Completed {
                batch.completed += 1;
            } else {
                batch.failed += 1;
            }
            if batch.resolved() == batch.total {
                batch.completed_at = Some(now);
                batch_just_completed = true;
            }
        }

        Ok(TransitionOutcome::Applied { batch_id, batch_just_completed })
    }

    async fn get_item(&self, job_id: Uuid) -> Result<Option<ItemState>, StoreError> {
        Ok(self.tables.lock().items.get(&job_id).cloned())
    }

    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ItemState>, StoreError> {
        let (limit, offset) = filter.page();
        let tables = self.tables.lock();
        let mut items: Vec<ItemState> = tables
            .items
            .values()
            .filter(|item| filter.matches(item))
            .cloned()
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(items
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn delete_item(&self, job_id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        let standalone = tables
            .items
            .get(&job_id)
            .is_some_and(|item| item.batch_id.is_none());
        if standalone {
            tables.items.remove(&job_id);
        }
        Ok(standalone)
    }

    async fn mark_item_notified(&self, job_id: Uuid) -> Result<(), StoreError> {
        if let Some(item) = self.tables.lock().items.get_mut(&job_id) {
            item.webhook_sent = true;
        }
        Ok(())
    }

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchState>, StoreError> {
        Ok(self.tables.lock().batches.get(&batch_id).cloned())
    }

    async fn batch_items(&self, batch_id: Uuid) -> Result<Vec<ItemState>, StoreError> {
        let tables = self.tables.lock();
        let mut items: Vec<ItemState> = tables
            .items
            .values()
            .filter(|item| item.batch_id == Some(batch_id))
            .cloned()
            .collect();
        items.sort_by_key(|item| item.batch_index);
        Ok(items)
    }

    async fn list_batches(&self, limit: i64) -> Result<Vec<BatchState>, StoreError> {
        let tables = self.tables.lock();
        let mut batches: Vec<BatchState> = tables.batches.values().cloned().collect();
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        batches.truncate(limit.max(0) as usize);
        Ok(batches)
    }

    async fn mark_batch_notified(&self, batch_id: Uuid) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock();
        match tables.batches.get_mut(&batch_id) {
            Some(batch) if !batch.webhook_sent => {
                batch.webhook_sent = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_batch(&self, batch_id: Uuid) -> Result<Option<BatchState>, StoreError> {
        let mut tables = self.tables.lock();
        Ok(tables.batches.get_mut(&batch_id).map(|batch| {
            batch.cancelled_at.get_or_insert_with(Utc::now);
            batch.clone()
        }))
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        let tables = self.tables.lock();
        let mut stats = Stats {
            batches: tables.batches.len() as i64,
            ..Default::default()
        };
        for item in tables.items.values() {
            stats.total += 1;
            match item.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            match item.valid {
                Some(true) => stats.valid += 1,
                Some(false) => stats.invalid += 1,
                None => {}
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
