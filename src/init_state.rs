use crate::storage::{KeyValueStore, PersistError, StoreItems};
use crate::types::InitializationState;
use chrono::Utc;
use std::rc::Rc;

pub const INIT_STATE_KEY: &str = "initializationState";

/// Durable flag and checkpoint for the one-time history bootstrap.
///
/// Every mutation is a read-modify-write of the stored state, so fields a
/// mutation does not touch survive it. Stored state that fails to parse is
/// treated as absent.
pub struct InitializationStateTracker {
    store: Rc<dyn KeyValueStore>,
}

impl InitializationStateTracker {
    pub fn new(store: Rc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Current state; unreadable or malformed state reads as a fresh install
    pub async fn state(&self) -> InitializationState {
        let items = match self.store.get(&[INIT_STATE_KEY]).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read initialization state");
                return InitializationState::default();
            }
        };

        let Some(raw) = items.get(INIT_STATE_KEY) else {
            return InitializationState::default();
        };

        // isInitialized is the one field that must be present
        if !raw.get("isInitialized").map_or(false, |v| v.is_boolean()) {
            tracing::warn!("initialization state is missing isInitialized, resetting");
            return InitializationState::default();
        }

        serde_json::from_value(raw.clone()).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "initialization state is malformed, resetting");
            InitializationState::default()
        })
    }

    pub async fn is_initialization_needed(&self) -> bool {
        let state = self.state().await;
        !state.is_initialized && !state.permission_denied.unwrap_or(false)
    }

    pub async fn mark_complete(&self, items_processed: Option<u64>) -> Result<(), PersistError> {
        self.update(|state| {
            state.is_initialized = true;
            state.initialization_date = Some(Utc::now());
            state.partial_completion = None;
            if items_processed.is_some() {
                state.items_processed = items_processed;
            }
        })
        .await
    }

    pub async fn mark_permission_denied(&self) -> Result<(), PersistError> {
        self.update(|state| state.permission_denied = Some(true)).await
    }

    pub async fn mark_partial_completion(
        &self,
        items_processed: u64,
        last_timestamp: Option<i64>,
    ) -> Result<(), PersistError> {
        self.update(|state| {
            state.partial_completion = Some(true);
            state.items_processed = Some(items_processed);
            if last_timestamp.is_some() {
                state.last_processed_timestamp = last_timestamp;
            }
        })
        .await
    }

    /// Forget all bootstrap progress
    pub async fn reset(&self) -> Result<(), PersistError> {
        self.store.remove(&[INIT_STATE_KEY]).await
    }

    async fn update(&self, mutate: impl FnOnce(&mut InitializationState)) -> Result<(), PersistError> {
        let mut state = self.state().await;
        mutate(&mut state);

        let mut items = StoreItems::new();
        items.insert(INIT_STATE_KEY.to_string(), serde_json::to_value(&state)?);
        self.store.set(items).await
    }
}
