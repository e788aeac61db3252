pub mod config;
pub mod engine;
pub mod history;
pub mod importer;
pub mod init_state;
pub mod logging;
pub mod normalize;
pub mod persistence;
pub mod ranking;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod visits;

#[cfg(test)]
mod test_support;

pub use engine::Frecent;
pub use importer::{HistoryBatchImporter, ImportPhase, ImportResult, ProgressSink, ProgressUpdate};
pub use normalize::normalize_url_key;
pub use persistence::{EvictionPolicy, QuotaAwarePersistence};
pub use ranking::{Candidate, RankingEngine, ScoredEntry};
pub use storage::{KeyValueStore, PersistError, SqliteKvStore};
pub use types::{InitializationState, VisitData, VisitRecord};
pub use visits::{PersistMode, VisitStore};
