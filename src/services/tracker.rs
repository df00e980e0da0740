use std::sync::Arc;

use crate::db::{StateStore, StoreError};
use crate::models::job::{ItemKey, Transition, TransitionOutcome};

/// Applies item lifecycle transitions through the state store.
///
/// Rejected moves (backward, or a second terminal status) are no-ops and are
/// only logged; callers decide whether a rejection matters to them.
#[derive(Clone)]
pub struct ItemStateTracker {
    store: Arc<dyn StateStore>,
}

impl ItemStateTracker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub async fn transition(
        &self,
        key: ItemKey,
        transition: Transition,
    ) -> Result<TransitionOutcome, StoreError> {
        let to = transition.to;
        let outcome = self.store.transition(key, transition).await?;

        match outcome {
            TransitionOutcome::Applied { batch_just_completed, .. } => {
                tracing::debug!(item = %key, status = %to, batch_just_completed, "Item transitioned");
            }
            TransitionOutcome::Rejected { current } => {
                tracing::info!(item = %key, from = %current, to = %to, "Ignoring out-of-order transition");
            }
            TransitionOutcome::NotFound => {
                tracing::warn!(item = %key, to = %to, "Transition for unknown item");
            }
        }

        Ok(outcome)
    }
}
