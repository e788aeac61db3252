//! One-time bootstrap of visit data from the host's browsing history.
//!
//! Phases run `Checking -> ReadingHistory -> Processing -> Saving -> Complete`;
//! any failure lands in `Error` and leaves a partial-completion checkpoint
//! behind. The checkpoint is diagnostic: a retry re-reads the whole bounded
//! history window.

use crate::history::{HistoryError, HistorySource};
use crate::init_state::InitializationStateTracker;
use crate::normalize::normalize_url_key;
use crate::persistence::{EvictionPolicy, QuotaAwarePersistence, SaveReport};
use crate::storage::PersistError;
use crate::types::{now_millis, HistoryItem, VisitData, VisitRecord};
use crate::visits::VisitStore;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use url::Url;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPhase {
    Checking,
    ReadingHistory,
    Processing,
    Saving,
    Complete,
    Error,
}

impl ImportPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ImportPhase::Checking => "checking",
            ImportPhase::ReadingHistory => "reading_history",
            ImportPhase::Processing => "processing",
            ImportPhase::Saving => "saving",
            ImportPhase::Complete => "complete",
            ImportPhase::Error => "error",
        }
    }
}

/// One progress report; counts are cumulative for the run
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub phase: ImportPhase,
    /// History items examined so far
    pub processed: usize,
    pub total: usize,
    pub unique_urls: usize,
    pub skipped: usize,
    pub errors: usize,
    pub estimated_remaining: Option<Duration>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSettings {
    pub max_age_days: u32,
    pub max_items: usize,
    pub batch_size: usize,
    pub yield_every_batches: usize,
    pub error_report_threshold: usize,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            max_age_days: 365,
            max_items: 10_000,
            batch_size: 1_000,
            yield_every_batches: 3,
            error_report_threshold: 100,
        }
    }
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("history unavailable: {0}")]
    HistoryApiUnavailable(String),

    #[error("permission to read history was denied")]
    PermissionDenied,

    #[error("failed to persist imported visits: {0}")]
    Persist(#[from] PersistError),
}

impl From<HistoryError> for ImportError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::PermissionDenied => ImportError::PermissionDenied,
            other => ImportError::HistoryApiUnavailable(other.to_string()),
        }
    }
}

#[derive(Debug)]
pub struct ImportResult {
    pub success: bool,
    /// History items merged into visit data
    pub items_processed: usize,
    pub unique_urls: usize,
    pub skipped: usize,
    /// Aggregated high-error-rate reports emitted during processing
    pub error_reports: usize,
    pub error: Option<ImportError>,
}

/// Why a history item was left out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingUrl,
    UnsupportedScheme,
    TooOld,
    InvalidKey,
    InvalidTimestamp,
}

impl SkipReason {
    /// Malformed input, as opposed to items filtered out by policy
    pub fn is_error(self) -> bool {
        matches!(self, SkipReason::InvalidKey | SkipReason::InvalidTimestamp)
    }
}

/// Where progress updates go; a run without a receiver reports nowhere
#[derive(Default)]
pub struct ProgressSink {
    tx: Option<UnboundedSender<ProgressUpdate>>,
    closed: Cell<bool>,
}

impl ProgressSink {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn channel() -> (Self, UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Some(tx),
                closed: Cell::new(false),
            },
            rx,
        )
    }

    fn emit(&self, update: ProgressUpdate) {
        let Some(tx) = &self.tx else { return };
        if self.closed.get() {
            return;
        }
        if tx.send(update).is_err() {
            tracing::warn!("progress receiver dropped, import continues without progress reports");
            self.closed.set(true);
        }
    }
}

/// Counters for one import run
#[derive(Debug, Default)]
struct ImportRun {
    phase: Option<ImportPhase>,
    total: usize,
    examined: usize,
    imported: usize,
    unique_urls: usize,
    skipped: usize,
    errors: usize,
    errors_since_report: usize,
    error_reports: usize,
    last_timestamp: Option<i64>,
}

impl ImportRun {
    fn update(&self, phase: ImportPhase, started: Instant) -> ProgressUpdate {
        let estimated_remaining = if phase == ImportPhase::Processing && self.examined > 0 {
            let per_item = started.elapsed().as_secs_f64() / self.examined as f64;
            let remaining = self.total.saturating_sub(self.examined) as f64;
            Some(Duration::from_secs_f64(per_item * remaining))
        } else {
            None
        };

        ProgressUpdate {
            phase,
            processed: self.examined,
            total: self.total,
            unique_urls: self.unique_urls,
            skipped: self.skipped,
            errors: self.errors,
            estimated_remaining,
            message: None,
        }
    }
}

pub struct HistoryBatchImporter<H: HistorySource> {
    history: H,
    store: Rc<VisitStore>,
    persistence: Rc<QuotaAwarePersistence>,
    init_state: Rc<InitializationStateTracker>,
    settings: ImportSettings,
}

impl<H: HistorySource> HistoryBatchImporter<H> {
    pub fn new(
        history: H,
        store: Rc<VisitStore>,
        persistence: Rc<QuotaAwarePersistence>,
        init_state: Rc<InitializationStateTracker>,
        settings: ImportSettings,
    ) -> Self {
        Self {
            history,
            store,
            persistence,
            init_state,
            settings,
        }
    }

    /// Run the bootstrap if it is still needed.
    ///
    /// Never returns an error directly: failures are reported in
    /// [`ImportResult::error`] after the checkpoint is written.
    pub async fn initialize(&self, progress: &ProgressSink) -> ImportResult {
        let started = Instant::now();
        let mut run = ImportRun::default();

        let error = match self.run(&mut run, progress, started).await {
            Ok(()) => None,
            Err(err) => {
                self.fail(&mut run, &err, progress, started).await;
                Some(err)
            }
        };

        ImportResult {
            success: error.is_none(),
            items_processed: run.imported,
            unique_urls: run.unique_urls,
            skipped: run.skipped,
            error_reports: run.error_reports,
            error,
        }
    }

    async fn run(
        &self,
        run: &mut ImportRun,
        progress: &ProgressSink,
        started: Instant,
    ) -> Result<(), ImportError> {
        self.enter(run, ImportPhase::Checking, progress, started);
        if !self.init_state.is_initialization_needed().await {
            tracing::debug!("history import not needed");
            self.enter(run, ImportPhase::Complete, progress, started);
            return Ok(());
        }

        self.enter(run, ImportPhase::ReadingHistory, progress, started);
        let now = now_millis();
        let cutoff = now - i64::from(self.settings.max_age_days) * DAY_MS;
        let items = self.history.search(cutoff, self.settings.max_items).await?;
        run.total = items.len();
        tracing::info!(items = items.len(), "read browsing history");

        if !items.is_empty() {
            self.enter(run, ImportPhase::Processing, progress, started);
            let scratch = self.process(&items, cutoff, now, run, progress, started).await;
            run.unique_urls = scratch.len();

            self.enter(run, ImportPhase::Saving, progress, started);
            let report = self.save(scratch).await?;
            tracing::info!(tier = ?report.tier, stored = report.stored, evicted = report.evicted, "saved imported visits");
        }

        self.init_state.mark_complete(Some(run.imported as u64)).await?;
        self.enter(run, ImportPhase::Complete, progress, started);
        tracing::info!(
            imported = run.imported,
            unique_urls = run.unique_urls,
            skipped = run.skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "history import complete"
        );
        Ok(())
    }

    async fn process(
        &self,
        items: &[HistoryItem],
        cutoff: i64,
        now: i64,
        run: &mut ImportRun,
        progress: &ProgressSink,
        started: Instant,
    ) -> VisitData {
        let mut scratch = VisitData::new();
        let batch_size = self.settings.batch_size.max(1);
        let yield_every = self.settings.yield_every_batches.max(1);

        for (batch_index, batch) in items.chunks(batch_size).enumerate() {
            for item in batch {
                run.examined += 1;
                match prepare_item(item, cutoff, now) {
                    Ok((key, record)) => {
                        run.imported += 1;
                        run.last_timestamp = run.last_timestamp.max(Some(record.last_visited));
                        match scratch.get_mut(&key) {
                            Some(existing) => existing.merge_from(record),
                            None => {
                                scratch.insert(key, record);
                            }
                        }
                    }
                    Err(reason) => self.skip(run, reason),
                }
            }

            run.unique_urls = scratch.len();
            progress.emit(run.update(ImportPhase::Processing, started));

            if (batch_index + 1) % yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }

        scratch
    }

    fn skip(&self, run: &mut ImportRun, reason: SkipReason) {
        run.skipped += 1;
        if !reason.is_error() {
            return;
        }

        run.errors += 1;
        run.errors_since_report += 1;
        if run.errors_since_report > self.settings.error_report_threshold {
            run.error_reports += 1;
            tracing::warn!(
                errors = run.errors_since_report,
                total_errors = run.errors,
                examined = run.examined,
                "high error rate while importing history"
            );
            run.errors_since_report = 0;
        }
    }

    async fn save(&self, scratch: VisitData) -> Result<SaveReport, ImportError> {
        let snapshot = self.store.integrate_history(scratch);
        Ok(self.persistence.save(&snapshot, EvictionPolicy::Aggressive).await?)
    }

    async fn fail(&self, run: &mut ImportRun, err: &ImportError, progress: &ProgressSink, started: Instant) {
        tracing::error!(phase = ?run.phase, error = %err, imported = run.imported, "history import failed");

        let checkpoint = match err {
            ImportError::PermissionDenied => self.init_state.mark_permission_denied().await,
            _ => {
                self.init_state
                    .mark_partial_completion(run.imported as u64, run.last_timestamp)
                    .await
            }
        };
        if let Err(e) = checkpoint {
            tracing::warn!(error = %e, "failed to record import checkpoint");
        }

        run.phase = Some(ImportPhase::Error);
        let mut update = run.update(ImportPhase::Error, started);
        update.message = Some(err.to_string());
        progress.emit(update);
    }

    fn enter(&self, run: &mut ImportRun, phase: ImportPhase, progress: &ProgressSink, started: Instant) {
        run.phase = Some(phase);
        tracing::debug!(?phase, "import phase");
        progress.emit(run.update(phase, started));
    }
}

fn prepare_item(item: &HistoryItem, cutoff: i64, now: i64) -> Result<(String, VisitRecord), SkipReason> {
    let url = item
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or(SkipReason::MissingUrl)?;

    let parsed = Url::parse(url).map_err(|_| SkipReason::InvalidKey)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SkipReason::UnsupportedScheme);
    }

    let last_visited = match item.last_visit_time {
        None => now,
        Some(t) if !t.is_finite() || t <= 0.0 => return Err(SkipReason::InvalidTimestamp),
        Some(t) if (t as i64) < cutoff => return Err(SkipReason::TooOld),
        Some(t) => t as i64,
    };

    let key = normalize_url_key(url);
    if key.is_empty() {
        return Err(SkipReason::InvalidKey);
    }

    let count = item.visit_count.unwrap_or(1).max(1) as u64;
    Ok((
        key,
        VisitRecord {
            count,
            last_visited,
            title: item.title.clone(),
            custom_title: None,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistory;
    use crate::persistence::PersistenceSettings;
    use crate::test_support::ScriptedStore;
    use crate::visits::PersistMode;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Harness {
        primary: Rc<ScriptedStore>,
        store: Rc<VisitStore>,
        persistence: Rc<QuotaAwarePersistence>,
        init_state: Rc<InitializationStateTracker>,
    }

    impl Harness {
        fn new(primary: ScriptedStore, fallback: ScriptedStore) -> Self {
            let primary = Rc::new(primary);
            let persistence = Rc::new(QuotaAwarePersistence::new(
                primary.clone(),
                Rc::new(fallback),
                PersistenceSettings {
                    max_retries: 1,
                    retry_base: Duration::from_millis(1),
                },
            ));
            let store = Rc::new(VisitStore::new(persistence.clone(), PersistMode::Await));
            let init_state = Rc::new(InitializationStateTracker::new(Rc::new(ScriptedStore::default())));
            Self {
                primary,
                store,
                persistence,
                init_state,
            }
        }

        fn healthy() -> Self {
            Self::new(ScriptedStore::default(), ScriptedStore::default())
        }

        fn importer<H: HistorySource>(&self, history: H, settings: ImportSettings) -> HistoryBatchImporter<H> {
            HistoryBatchImporter::new(
                history,
                self.store.clone(),
                self.persistence.clone(),
                self.init_state.clone(),
                settings,
            )
        }
    }

    struct BrokenHistory(HistoryError);

    #[async_trait(?Send)]
    impl HistorySource for BrokenHistory {
        async fn search(&self, _start: i64, _max: usize) -> Result<Vec<HistoryItem>, HistoryError> {
            Err(match &self.0 {
                HistoryError::PermissionDenied => HistoryError::PermissionDenied,
                other => HistoryError::Unavailable(other.to_string()),
            })
        }
    }

    fn item(url: &str, last_visit_time: f64, visit_count: i64, title: Option<&str>) -> HistoryItem {
        HistoryItem {
            url: Some(url.to_string()),
            title: title.map(str::to_string),
            last_visit_time: Some(last_visit_time),
            visit_count: Some(visit_count),
        }
    }

    fn drain(mut rx: UnboundedReceiver<ProgressUpdate>) -> Vec<ProgressUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn test_variants_collapse_into_one_key() {
        let h = Harness::healthy();
        let t = now_millis() as f64;
        let history = InMemoryHistory::new(vec![
            item("https://www.Example.Com/Path/", t - 2000.0, 1, None),
            item("http://Example.Com/Path", t - 1000.0, 1, None),
        ]);

        let result = h.importer(history, ImportSettings::default()).initialize(&ProgressSink::none()).await;
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.items_processed, 2);
        assert_eq!(result.unique_urls, 1);

        let data = h.store.get_all_visit_data();
        assert_eq!(data.len(), 1);
        let record = &data["example.com/path"];
        assert_eq!(record.count, 2);
        assert_eq!(record.last_visited, (t - 1000.0) as i64);
        assert_eq!(h.primary.stored_visits(), Some(1));
    }

    #[tokio::test]
    async fn test_marks_complete_and_skips_second_run() {
        let h = Harness::healthy();
        let t = now_millis() as f64;
        let history = InMemoryHistory::new(vec![item("https://a.test/", t, 3, Some("A"))]);
        let importer = h.importer(history, ImportSettings::default());

        let first = importer.initialize(&ProgressSink::none()).await;
        assert!(first.success);
        let state = h.init_state.state().await;
        assert!(state.is_initialized);
        assert_eq!(state.items_processed, Some(1));

        let (sink, rx) = ProgressSink::channel();
        let second = importer.initialize(&sink).await;
        assert!(second.success);
        assert_eq!(second.items_processed, 0);

        let phases: Vec<_> = drain(rx).into_iter().map(|u| u.phase).collect();
        assert_eq!(phases, vec![ImportPhase::Checking, ImportPhase::Complete]);
    }

    #[tokio::test]
    async fn test_progress_stream_and_skips() {
        let h = Harness::healthy();
        let t = now_millis() as f64;
        let history = InMemoryHistory::new(vec![
            item("https://a.test/", t - 10.0, 0, Some("A")),
            item("https://b.test/", t - 20.0, 5, None),
            item("chrome://settings", t - 30.0, 1, None),
            HistoryItem::default(),
            item("https://c.test/", f64::NAN, 1, None),
            item("https://a.test/", t - 5.0, 2, Some("A2")),
            item("https://d.test/", t - 40.0, 1, None),
        ]);

        let settings = ImportSettings {
            batch_size: 3,
            yield_every_batches: 1,
            ..Default::default()
        };
        let (sink, rx) = ProgressSink::channel();
        let result = h
            .importer(history, settings)
            .initialize(&sink)
            .await;

        assert!(result.success);
        assert_eq!(result.items_processed, 4);
        assert_eq!(result.unique_urls, 3);
        assert_eq!(result.skipped, 3);

        let updates = drain(rx);
        let phases: Vec<_> = updates.iter().map(|u| u.phase).collect();
        assert_eq!(
            phases,
            vec![
                ImportPhase::Checking,
                ImportPhase::ReadingHistory,
                ImportPhase::Processing,
                ImportPhase::Processing,
                ImportPhase::Processing,
                ImportPhase::Processing,
                ImportPhase::Saving,
                ImportPhase::Complete,
            ]
        );

        let batches: Vec<_> = updates
            .iter()
            .filter(|u| u.phase == ImportPhase::Processing && u.processed > 0)
            .map(|u| u.processed)
            .collect();
        assert_eq!(batches, vec![3, 6, 7]);
        assert!(updates.iter().any(|u| u.estimated_remaining.is_some()));

        let a = h.store.get("https://a.test/").unwrap();
        assert_eq!(a.count, 3);
        assert_eq!(a.title.as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_error_reports_are_aggregated() {
        let h = Harness::healthy();
        let items: Vec<_> = (0..250)
            .map(|i| item(&format!("https://bad{}.test/", i), f64::NAN, 1, None))
            .collect();

        let result = h
            .importer(InMemoryHistory::new(items), ImportSettings::default())
            .initialize(&ProgressSink::none())
            .await;

        assert!(result.success);
        assert_eq!(result.skipped, 250);
        assert_eq!(result.error_reports, 2);
    }

    #[tokio::test]
    async fn test_history_failure_records_partial_completion() {
        let h = Harness::healthy();
        let (sink, rx) = ProgressSink::channel();
        let result = h
            .importer(BrokenHistory(HistoryError::Unavailable("down".into())), ImportSettings::default())
            .initialize(&sink)
            .await;

        assert!(!result.success);
        assert!(matches!(result.error, Some(ImportError::HistoryApiUnavailable(_))));

        let state = h.init_state.state().await;
        assert_eq!(state.partial_completion, Some(true));
        assert_eq!(state.items_processed, Some(0));
        assert!(h.init_state.is_initialization_needed().await);

        let last = drain(rx).pop().unwrap();
        assert_eq!(last.phase, ImportPhase::Error);
        assert!(last.message.unwrap().contains("down"));
    }

    #[tokio::test]
    async fn test_permission_denied_is_remembered() {
        let h = Harness::healthy();
        let result = h
            .importer(BrokenHistory(HistoryError::PermissionDenied), ImportSettings::default())
            .initialize(&ProgressSink::none())
            .await;

        assert!(matches!(result.error, Some(ImportError::PermissionDenied)));
        assert!(!h.init_state.is_initialization_needed().await);
    }

    #[tokio::test]
    async fn test_persistence_failure_propagates() {
        let h = Harness::new(ScriptedStore::failing(), ScriptedStore::failing());
        let t = now_millis() as f64;
        let history = InMemoryHistory::new(vec![
            item("https://a.test/", t - 100.0, 1, None),
            item("https://b.test/", t - 50.0, 1, None),
        ]);

        let result = h
            .importer(history, ImportSettings::default())
            .initialize(&ProgressSink::none())
            .await;

        assert!(!result.success);
        assert!(matches!(result.error, Some(ImportError::Persist(_))));

        let state = h.init_state.state().await;
        assert!(!state.is_initialized);
        assert_eq!(state.partial_completion, Some(true));
        assert_eq!(state.items_processed, Some(2));
        assert_eq!(state.last_processed_timestamp, Some((t - 50.0) as i64));
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_abort() {
        let h = Harness::healthy();
        let t = now_millis() as f64;
        let history = InMemoryHistory::new(vec![item("https://a.test/", t, 1, None)]);

        let (sink, rx) = ProgressSink::channel();
        drop(rx);
        let result = h.importer(history, ImportSettings::default()).initialize(&sink).await;
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_empty_history_completes() {
        let h = Harness::healthy();
        let result = h
            .importer(InMemoryHistory::default(), ImportSettings::default())
            .initialize(&ProgressSink::none())
            .await;

        assert!(result.success);
        assert_eq!(result.items_processed, 0);
        assert!(!h.init_state.is_initialization_needed().await);
    }

    #[tokio::test]
    async fn test_history_overrides_existing_counts_but_keeps_titles() {
        let h = Harness::healthy();
        h.store.merge(
            "https://a.test/",
            VisitRecord {
                count: 99,
                last_visited: 1,
                title: Some("Kept".to_string()),
                custom_title: None,
            },
        );
        let t = now_millis() as f64;
        let history = InMemoryHistory::new(vec![item("https://a.test/", t, 4, None)]);

        let result = h
            .importer(history, ImportSettings::default())
            .initialize(&ProgressSink::none())
            .await;
        assert!(result.success);

        let a = h.store.get("https://a.test/").unwrap();
        assert_eq!(a.count, 4);
        assert_eq!(a.title.as_deref(), Some("Kept"));
    }

    #[test]
    fn test_prepare_item_reasons() {
        let now = 10 * DAY_MS;
        let cutoff = now - DAY_MS;

        let missing = HistoryItem::default();
        assert_eq!(prepare_item(&missing, cutoff, now).unwrap_err(), SkipReason::MissingUrl);

        let ftp = item("ftp://files.test/a", now as f64, 1, None);
        assert_eq!(prepare_item(&ftp, cutoff, now).unwrap_err(), SkipReason::UnsupportedScheme);

        let old = item("https://a.test/", (cutoff - 1) as f64, 1, None);
        assert_eq!(prepare_item(&old, cutoff, now).unwrap_err(), SkipReason::TooOld);

        let garbage = item("::not a url::", now as f64, 1, None);
        assert_eq!(prepare_item(&garbage, cutoff, now).unwrap_err(), SkipReason::InvalidKey);

        let no_time = HistoryItem {
            url: Some("https://a.test/x".to_string()),
            visit_count: Some(-3),
            ..Default::default()
        };
        let (key, record) = prepare_item(&no_time, cutoff, now).unwrap();
        assert_eq!(key, "a.test/x");
        assert_eq!(record.count, 1);
        assert_eq!(record.last_visited, now);
    }
}
