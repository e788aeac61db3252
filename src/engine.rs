use crate::config::{resolve_data_dir, EngineSettings, FrecentConfig, DATA_DIR_NAME};
use crate::history::{flatten_bookmarks, BookmarkSource, HistorySource, TabLookup};
use crate::importer::{HistoryBatchImporter, ImportResult, ProgressSink};
use crate::init_state::InitializationStateTracker;
use crate::normalize::is_trackable_url;
use crate::persistence::{EvictionPolicy, QuotaAwarePersistence, SaveReport};
use crate::ranking::{Candidate, RankingEngine, ScoredEntry};
use crate::storage::{KeyValueStore, SqliteKvStore, StoreLimits};
use crate::tracker::TabTracker;
use crate::types::{now_millis, VisitRecord, VisitStats};
use crate::visits::{PersistMode, VisitStore};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Number of entries reported as most visited in stats
const MOST_VISITED_LIMIT: usize = 10;

/// The main visit-tracking interface
pub struct Frecent {
    data_dir: PathBuf,
    settings: EngineSettings,
    persistence: Rc<QuotaAwarePersistence>,
    init_state: Rc<InitializationStateTracker>,
    store: Rc<VisitStore>,
    ranking: RankingEngine,
}

impl Frecent {
    /// Open the data directory found by searching upward, else the global default
    pub async fn open(persist_mode: PersistMode) -> Result<Self, String> {
        let data_dir =
            resolve_data_dir().map_err(|e| format!("Failed to create data directory: {}", e))?;
        Self::open_at(data_dir, persist_mode).await
    }

    /// Open a data directory, reading its `_config.yaml`.
    ///
    /// With [`PersistMode::Background`], recording must happen inside a
    /// `tokio::task::LocalSet`.
    pub async fn open_at(data_dir: PathBuf, persist_mode: PersistMode) -> Result<Self, String> {
        let settings = EngineSettings {
            persist_mode,
            ..FrecentConfig::new(data_dir.clone()).settings()
        };
        Self::open_with_settings(data_dir, settings).await
    }

    pub async fn open_with_settings(data_dir: PathBuf, settings: EngineSettings) -> Result<Self, String> {
        if !data_dir.exists() {
            return Err(format!("Path does not exist: {}", data_dir.display()));
        }

        let synced: Rc<dyn KeyValueStore> = Rc::new(
            SqliteKvStore::open(&data_dir.join("sync.db"), settings.sync_limits)
                .map_err(|e| format!("Failed to open synced store: {}", e))?,
        );
        let local: Rc<dyn KeyValueStore> = Rc::new(
            SqliteKvStore::open(&data_dir.join("local.db"), StoreLimits::unlimited())
                .map_err(|e| format!("Failed to open local store: {}", e))?,
        );

        let persistence = Rc::new(QuotaAwarePersistence::new(
            synced,
            Rc::clone(&local),
            settings.persistence,
        ));
        let init_state = Rc::new(InitializationStateTracker::new(local));
        let store = Rc::new(VisitStore::load(Rc::clone(&persistence), settings.persist_mode).await);
        let ranking = RankingEngine::new(settings.ranking);

        Ok(Self {
            data_dir,
            settings,
            persistence,
            init_state,
            store,
            ranking,
        })
    }

    /// Create `.frecent` under `path` and open it
    pub async fn init(path: &Path, persist_mode: PersistMode) -> Result<Self, String> {
        let data_dir = path.join(DATA_DIR_NAME);
        fs::create_dir_all(&data_dir)
            .map_err(|e| format!("Failed to create {} directory: {}", DATA_DIR_NAME, e))?;

        Self::open_at(data_dir, persist_mode).await
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Rc<VisitStore> {
        &self.store
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Record one page visit; false for anything but an http(s) page
    pub async fn record_visit(&self, url: &str, title: Option<&str>) -> bool {
        is_trackable_url(url) && self.store.record_visit(url, title).await
    }

    pub async fn record_bookmark_open(&self, url: &str, title: &str) -> bool {
        is_trackable_url(url) && self.store.record_bookmark_open(url, title).await
    }

    /// Attach every bookmark title as a custom title, then save once.
    ///
    /// Returns how many bookmarks were seeded.
    pub async fn import_bookmarks<B: BookmarkSource>(&self, source: &B) -> Result<usize, String> {
        let tree = source
            .tree()
            .await
            .map_err(|e| format!("Failed to read bookmarks: {}", e))?;

        let now = now_millis();
        let mut seeded = 0;
        for bookmark in flatten_bookmarks(&tree) {
            let last_used = bookmark.date_last_used.unwrap_or(now);
            if self.store.seed_bookmark(&bookmark.url, &bookmark.title, last_used) {
                seeded += 1;
            }
        }

        if seeded > 0 {
            self.save(EvictionPolicy::SteadyState).await?;
        }
        tracing::info!(seeded, "imported bookmarks");
        Ok(seeded)
    }

    pub async fn is_import_needed(&self) -> bool {
        self.init_state.is_initialization_needed().await
    }

    /// Bootstrap visit data from browsing history, once per data directory
    pub async fn import_history<H: HistorySource>(&self, history: H, progress: &ProgressSink) -> ImportResult {
        let importer = HistoryBatchImporter::new(
            history,
            Rc::clone(&self.store),
            Rc::clone(&self.persistence),
            Rc::clone(&self.init_state),
            self.settings.import,
        );
        importer.initialize(progress).await
    }

    /// A tracker feeding live tab events into this store
    pub fn tab_tracker<L: TabLookup>(&self, lookup: L) -> TabTracker<L> {
        TabTracker::new(Rc::clone(&self.store), lookup, self.settings.debounce)
    }

    pub async fn save(&self, policy: EvictionPolicy) -> Result<SaveReport, String> {
        self.store
            .persist(policy)
            .await
            .map_err(|e| format!("Failed to save visit data: {}", e))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Re-rank candidates by fuzzy score and visit frequency
    pub fn rank<T>(&self, candidates: Vec<Candidate<T>>) -> Vec<ScoredEntry<T>> {
        self.ranking.rank(candidates, &self.store.get_all_visit_data())
    }

    /// Entries ordered by count, then recency, then key
    pub fn top(&self, limit: usize) -> Vec<(String, VisitRecord)> {
        let mut entries: Vec<(String, VisitRecord)> = self.store.get_all_visit_data().into_iter().collect();
        entries.sort_by(|(ka, a), (kb, b)| {
            b.count
                .cmp(&a.count)
                .then(b.last_visited.cmp(&a.last_visited))
                .then_with(|| ka.cmp(kb))
        });
        entries.truncate(limit);
        entries
    }

    pub async fn stats(&self) -> VisitStats {
        let visits = self.store.get_all_visit_data();
        let synced_bytes = match self.persistence.primary().bytes_in_use().await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::debug!(error = %e, "could not measure synced store");
                None
            }
        };

        VisitStats {
            total_urls: visits.len(),
            total_visits: visits.values().fold(0u64, |sum, r| sum.saturating_add(r.count)),
            most_visited: self.top(MOST_VISITED_LIMIT),
            initialization: self.init_state.state().await,
            storage_available: self.persistence.is_available(),
            synced_bytes,
        }
    }

    /// Forget the import checkpoint so the next import runs again.
    ///
    /// With `all`, visit data is dropped as well.
    pub async fn reset(&self, all: bool) -> Result<(), String> {
        self.init_state
            .reset()
            .await
            .map_err(|e| format!("Failed to reset initialization state: {}", e))?;

        if all {
            self.store
                .clear()
                .await
                .map_err(|e| format!("Failed to clear visit data: {}", e))?;
        }
        Ok(())
    }
}
