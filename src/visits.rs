use crate::normalize::normalize_url_key;
use crate::persistence::{EvictionPolicy, QuotaAwarePersistence, SaveReport};
use crate::storage::PersistError;
use crate::types::{non_blank, now_millis, VisitData, VisitRecord};
use std::cell::RefCell;
use std::rc::Rc;

/// How writes triggered by live events reach storage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistMode {
    /// Spawn the save on the current `LocalSet` and return immediately
    Background,
    /// Await the save before returning
    Await,
}

/// In-memory table of normalized key -> visit record.
///
/// One instance is built by the process entry point and shared by `Rc` with
/// the tracker and the importer. Borrows of the table never span an `.await`.
pub struct VisitStore {
    visits: RefCell<VisitData>,
    persistence: Rc<QuotaAwarePersistence>,
    mode: PersistMode,
}

impl VisitStore {
    pub fn new(persistence: Rc<QuotaAwarePersistence>, mode: PersistMode) -> Self {
        Self {
            visits: RefCell::new(VisitData::new()),
            persistence,
            mode,
        }
    }

    /// Build a store seeded from whatever persistence can load
    pub async fn load(persistence: Rc<QuotaAwarePersistence>, mode: PersistMode) -> Self {
        let visits = persistence.load().await;
        tracing::debug!(entries = visits.len(), "loaded visit data");
        Self {
            visits: RefCell::new(visits),
            persistence,
            mode,
        }
    }

    // -------------------------------------------------------------------------
    // Mutation
    // -------------------------------------------------------------------------

    /// Merge `delta` under the normalized form of `key`.
    ///
    /// Returns false, leaving the table untouched, when the key normalizes to
    /// nothing.
    pub fn merge(&self, key: &str, delta: VisitRecord) -> bool {
        let key = normalize_url_key(key);
        if key.is_empty() {
            return false;
        }

        let mut visits = self.visits.borrow_mut();
        match visits.get_mut(&key) {
            Some(existing) => existing.merge_from(delta),
            None => {
                visits.insert(key, delta);
            }
        }
        true
    }

    /// Count one visit to `url` now and persist
    pub async fn record_visit(&self, url: &str, title: Option<&str>) -> bool {
        self.record_visit_at(url, title, now_millis()).await
    }

    pub async fn record_visit_at(&self, url: &str, title: Option<&str>, at: i64) -> bool {
        if !self.merge(url, VisitRecord::visit(at, title)) {
            return false;
        }
        self.schedule_persist().await;
        true
    }

    /// Count an open of a bookmark, keeping its title as the custom title
    pub async fn record_bookmark_open(&self, url: &str, title: &str) -> bool {
        let mut delta = VisitRecord::visit(now_millis(), None);
        delta.custom_title = Some(title.to_string());
        if !self.merge(url, delta) {
            return false;
        }
        self.schedule_persist().await;
        true
    }

    /// Attach a bookmark title without counting a visit
    pub fn seed_bookmark(&self, url: &str, title: &str, last_used: i64) -> bool {
        self.merge(
            url,
            VisitRecord {
                count: 0,
                last_visited: last_used,
                title: None,
                custom_title: Some(title.to_string()),
            },
        )
    }

    /// Fold each dataset through `merge`, in order, then save
    pub async fn aggregate_and_persist(&self, datasets: &[VisitData]) -> Result<SaveReport, PersistError> {
        for dataset in datasets {
            for (key, record) in dataset {
                self.merge(key, record.clone());
            }
        }
        self.persist(EvictionPolicy::SteadyState).await
    }

    /// Overlay history-derived records onto the table and return a snapshot.
    ///
    /// Counts and timestamps from history replace existing ones; an existing
    /// non-blank title and any custom title survive when history has none.
    pub fn integrate_history(&self, scratch: VisitData) -> VisitData {
        let mut visits = self.visits.borrow_mut();
        for (key, mut incoming) in scratch {
            if let Some(existing) = visits.get(&key) {
                if non_blank(incoming.title.as_deref()).is_none() {
                    incoming.title = existing.title.clone();
                }
                if non_blank(incoming.custom_title.as_deref()).is_none() {
                    incoming.custom_title = existing.custom_title.clone();
                }
            }
            visits.insert(key, incoming);
        }
        visits.clone()
    }

    pub async fn persist(&self, policy: EvictionPolicy) -> Result<SaveReport, PersistError> {
        let snapshot = self.get_all_visit_data();
        self.persistence.save(&snapshot, policy).await
    }

    /// Drop every record, in memory and in storage
    pub async fn clear(&self) -> Result<(), PersistError> {
        self.visits.borrow_mut().clear();
        self.persistence.clear().await
    }

    /// # Panics
    ///
    /// In [`PersistMode::Background`] this must run inside a `tokio::task::LocalSet`.
    async fn schedule_persist(&self) {
        if !self.persistence.is_available() {
            return;
        }

        let snapshot = self.get_all_visit_data();
        match self.mode {
            PersistMode::Await => {
                if let Err(e) = self.persistence.save(&snapshot, EvictionPolicy::SteadyState).await {
                    tracing::warn!(error = %e, "failed to persist visit");
                }
            }
            PersistMode::Background => {
                let persistence = Rc::clone(&self.persistence);
                tokio::task::spawn_local(async move {
                    if let Err(e) = persistence.save(&snapshot, EvictionPolicy::SteadyState).await {
                        tracing::warn!(error = %e, "failed to persist visit");
                    }
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Visit count for a URL or key; 0 when unknown
    pub fn get_count(&self, url: &str) -> u64 {
        self.get(url).map_or(0, |r| r.count)
    }

    pub fn get(&self, url: &str) -> Option<VisitRecord> {
        self.visits.borrow().get(&normalize_url_key(url)).cloned()
    }

    /// Copy of the whole table
    pub fn get_all_visit_data(&self) -> VisitData {
        self.visits.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.visits.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.borrow().is_empty()
    }
}
