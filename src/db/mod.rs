use async_trait::async_trait;
use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::batch::BatchState;
use crate::models::job::{ItemFilter, ItemKey, ItemState, NewItem, Transition, TransitionOutcome};

pub mod memory;
pub mod postgres;
pub mod queries;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unreadable {column} value: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("Batch not found: {0}")]
    BatchNotFound(Uuid),
}

/// Item and batch counts for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub valid: i64,
    pub invalid: i64,
    pub batches: i64,
}

/// Durable item and batch state.
///
/// One implementation is chosen per deployment and is the only place this
/// state lives. `transition` must be atomic with respect to the owning
/// batch's counters: of all the calls that resolve a batch's items, exactly
/// one observes `batch_just_completed`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn create_item(&self, item: NewItem) -> Result<ItemState, StoreError>;

    /// Insert a batch and all of its items in one step. Items are indexed by
    /// their position in `items`.
    async fn create_batch(
        &self,
        batch_id: Uuid,
        items: &[NewItem],
        webhook_url: Option<&str>,
    ) -> Result<BatchState, StoreError>;

    async fn transition(
        &self,
        key: ItemKey,
        transition: Transition,
    ) -> Result<TransitionOutcome, StoreError>;

    async fn get_item(&self, job_id: Uuid) -> Result<Option<ItemState>, StoreError>;

    /// Newest first.
    async fn list_items(&self, filter: &ItemFilter) -> Result<Vec<ItemState>, StoreError>;

    /// Delete a standalone item. Batch items are never deleted individually.
    async fn delete_item(&self, job_id: Uuid) -> Result<bool, StoreError>;

    async fn mark_item_notified(&self, job_id: Uuid) -> Result<(), StoreError>;

    async fn get_batch(&self, batch_id: Uuid) -> Result<Option<BatchState>, StoreError>;

    /// Items of a batch in index order.
    async fn batch_items(&self, batch_id: Uuid) -> Result<Vec<ItemState>, StoreError>;

    /// Newest first.
    async fn list_batches(&self, limit: i64) -> Result<Vec<BatchState>, StoreError>;

    /// Flip `webhook_sent`. Returns false if it was already set.
    async fn mark_batch_notified(&self, batch_id: Uuid) -> Result<bool, StoreError>;

    /// Stamp `cancelled_at` once. Returns the batch, or `None` if unknown.
    async fn cancel_batch(&self, batch_id: Uuid) -> Result<Option<BatchState>, StoreError>;

    async fn stats(&self) -> Result<Stats, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
