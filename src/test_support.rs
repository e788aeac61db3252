//! Fakes shared by the unit tests.

use crate::persistence::VISIT_DATA_KEY;
use crate::storage::{KeyValueStore, PersistError, StoreItems};
use crate::types::{VisitData, VisitRecord};
use async_trait::async_trait;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;

/// In-memory store whose `set` can be scripted to fail
#[derive(Default)]
pub struct ScriptedStore {
    pub items: RefCell<StoreItems>,
    /// Errors returned by the next `set` calls, in order
    pub set_failures: RefCell<VecDeque<PersistError>>,
    /// Reject visit payloads with more entries than this as over quota
    pub max_visit_entries: Option<usize>,
    /// Every `set` fails with a backend error
    pub always_fail: bool,
    pub set_calls: Cell<usize>,
}

impl ScriptedStore {
    pub fn failing() -> Self {
        Self {
            always_fail: true,
            ..Default::default()
        }
    }

    pub fn with_failures(failures: Vec<PersistError>) -> Self {
        Self {
            set_failures: RefCell::new(failures.into()),
            ..Default::default()
        }
    }

    pub fn with_entry_limit(max: usize) -> Self {
        Self {
            max_visit_entries: Some(max),
            ..Default::default()
        }
    }

    pub fn stored_visits(&self) -> Option<usize> {
        self.items
            .borrow()
            .get(VISIT_DATA_KEY)
            .and_then(|v| v.as_object())
            .map(|m| m.len())
    }
}

#[async_trait(?Send)]
impl KeyValueStore for ScriptedStore {
    async fn get(&self, keys: &[&str]) -> Result<StoreItems, PersistError> {
        let items = self.items.borrow();
        Ok(keys
            .iter()
            .filter_map(|k| items.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, items: StoreItems) -> Result<(), PersistError> {
        self.set_calls.set(self.set_calls.get() + 1);

        if self.always_fail {
            return Err(PersistError::Backend("scripted failure".to_string()));
        }
        if let Some(err) = self.set_failures.borrow_mut().pop_front() {
            return Err(err);
        }
        if let Some(max) = self.max_visit_entries {
            let entries = items
                .get(VISIT_DATA_KEY)
                .and_then(|v| v.as_object())
                .map(|m| m.len())
                .unwrap_or(0);
            if entries > max {
                return Err(PersistError::QuotaExceeded(format!("{} entries", entries)));
            }
        }

        self.items.borrow_mut().extend(items);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), PersistError> {
        let mut items = self.items.borrow_mut();
        for key in keys {
            items.remove(*key);
        }
        Ok(())
    }

    async fn bytes_in_use(&self) -> Result<usize, PersistError> {
        Ok(serde_json::to_string(&*self.items.borrow())?.len())
    }
}

/// `n` records keyed `site{i}.test/` with `last_visited` increasing with `i`
pub fn ascending_visits(n: usize) -> VisitData {
    (0..n)
        .map(|i| {
            (
                format!("site{}.test/", i),
                VisitRecord {
                    count: 1,
                    last_visited: 1_000 + i as i64,
                    title: None,
                    custom_title: None,
                },
            )
        })
        .collect()
}
