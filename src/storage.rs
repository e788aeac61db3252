//! Key-value storage tiers.
//!
//! The host exposes two stores with the same API: a small "synced" tier that
//! enforces a byte quota and write-rate limits, and a larger "local" tier. Both
//! are modelled by [`SqliteKvStore`]; host failures are classified into
//! [`PersistError`] here, once, so nothing downstream matches on message text.

use async_trait::async_trait;
use regex::Regex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Key -> JSON value, the unit of every get/set
pub type StoreItems = Map<String, Value>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    /// Too many writes over the last minute
    Sustained,
    /// Too many writes in a short burst
    Burst,
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("storage write rate limited ({0:?})")]
    RateLimited(RateLimitKind),

    #[error("storage unavailable")]
    StorageUnavailable,

    #[error("stored schema version {found} is newer than supported version {supported}")]
    SchemaIncompatible { found: u64, supported: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(String),
}

struct HostErrorPatterns {
    burst: Regex,
    sustained: Regex,
    quota: Regex,
    unavailable: Regex,
}

fn host_error_patterns() -> &'static HostErrorPatterns {
    static PATTERNS: OnceLock<HostErrorPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| HostErrorPatterns {
        burst: Regex::new(r"MAX_WRITE_OPERATIONS_PER_MINUTE").expect("valid regex"),
        sustained: Regex::new(
            r"(?i)MAX_WRITE_OPERATIONS_PER_HOUR|MAX_SUSTAINED_WRITE_OPERATIONS|rate.?limit",
        )
        .expect("valid regex"),
        quota: Regex::new(r"(?i)QUOTA_BYTES|quota exceeded|database or disk is full")
            .expect("valid regex"),
        unavailable: Regex::new(
            r"(?i)storage (is )?(not available|unavailable|undefined)|unable to open database",
        )
        .expect("valid regex"),
    })
}

impl PersistError {
    /// Classify a raw host error message.
    ///
    /// Write-rate messages are checked before quota ones since the host
    /// phrases both as "... quota exceeded".
    pub fn from_host_message(message: &str) -> Self {
        let patterns = host_error_patterns();
        if patterns.burst.is_match(message) {
            PersistError::RateLimited(RateLimitKind::Burst)
        } else if patterns.sustained.is_match(message) {
            PersistError::RateLimited(RateLimitKind::Sustained)
        } else if patterns.quota.is_match(message) {
            PersistError::QuotaExceeded(message.to_string())
        } else if patterns.unavailable.is_match(message) {
            PersistError::StorageUnavailable
        } else {
            PersistError::Backend(message.to_string())
        }
    }
}

impl From<rusqlite::Error> for PersistError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DiskFull) => PersistError::QuotaExceeded(err.to_string()),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                PersistError::RateLimited(RateLimitKind::Burst)
            }
            Some(ErrorCode::CannotOpen) => PersistError::StorageUnavailable,
            _ => PersistError::from_host_message(&err.to_string()),
        }
    }
}

/// The host's persistent key-value API.
///
/// Everything runs on one thread, so implementations need not be `Send`.
#[async_trait(?Send)]
pub trait KeyValueStore {
    /// Fetch the given keys; absent keys are simply missing from the result
    async fn get(&self, keys: &[&str]) -> Result<StoreItems, PersistError>;

    /// Write every entry of `items` atomically
    async fn set(&self, items: StoreItems) -> Result<(), PersistError>;

    async fn remove(&self, keys: &[&str]) -> Result<(), PersistError>;

    /// Bytes currently stored, as counted against the quota
    async fn bytes_in_use(&self) -> Result<usize, PersistError>;
}

/// Quota and write-rate limits enforced on every `set`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreLimits {
    pub quota_bytes: Option<usize>,
    pub writes_per_minute: Option<usize>,
    pub burst_per_second: Option<usize>,
}

impl StoreLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// Limits modelled on the browser's synced storage area
    pub fn synced() -> Self {
        Self {
            quota_bytes: Some(102_400),
            writes_per_minute: Some(120),
            burst_per_second: Some(2),
        }
    }
}

/// Key-value store backed by SQLite
pub struct SqliteKvStore {
    conn: Connection,
    limits: StoreLimits,
    writes: RefCell<VecDeque<Instant>>,
}

impl SqliteKvStore {
    /// Open or create the store at `db_path`
    pub fn open(db_path: &Path, limits: StoreLimits) -> Result<Self, PersistError> {
        let conn = Connection::open(db_path)?;
        Self::with_connection(conn, limits)
    }

    /// Open an in-memory store (for testing)
    pub fn in_memory(limits: StoreLimits) -> Result<Self, PersistError> {
        let conn = Connection::open_in_memory()?;
        Self::with_connection(conn, limits)
    }

    fn with_connection(conn: Connection, limits: StoreLimits) -> Result<Self, PersistError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            limits,
            writes: RefCell::new(VecDeque::new()),
        })
    }

    // -------------------------------------------------------------------------
    // Limit enforcement
    // -------------------------------------------------------------------------

    fn check_rate(&self, now: Instant) -> Result<(), PersistError> {
        let mut writes = self.writes.borrow_mut();
        while let Some(oldest) = writes.front() {
            if now.duration_since(*oldest) >= Duration::from_secs(60) {
                writes.pop_front();
            } else {
                break;
            }
        }

        if let Some(limit) = self.limits.writes_per_minute {
            if writes.len() >= limit {
                return Err(PersistError::RateLimited(RateLimitKind::Sustained));
            }
        }

        if let Some(limit) = self.limits.burst_per_second {
            let recent = writes
                .iter()
                .filter(|at| now.duration_since(**at) < Duration::from_secs(1))
                .count();
            if recent >= limit {
                return Err(PersistError::RateLimited(RateLimitKind::Burst));
            }
        }

        Ok(())
    }

    fn check_quota(&self, encoded: &[(String, String)]) -> Result<(), PersistError> {
        let Some(quota) = self.limits.quota_bytes else {
            return Ok(());
        };

        let mut total = self.total_bytes()?;
        for (key, value) in encoded {
            total = total.saturating_sub(self.entry_bytes(key)?);
            total += key.len() + value.len();
        }

        if total > quota {
            return Err(PersistError::QuotaExceeded(format!(
                "{} bytes needed, {} allowed",
                total, quota
            )));
        }

        Ok(())
    }

    fn total_bytes(&self) -> Result<usize, PersistError> {
        let total: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as usize)
    }

    fn entry_bytes(&self, key: &str) -> Result<usize, PersistError> {
        let size: Option<i64> = self
            .conn
            .query_row(
                "SELECT LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB)) FROM kv WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(size.unwrap_or(0).max(0) as usize)
    }
}

#[async_trait(?Send)]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, keys: &[&str]) -> Result<StoreItems, PersistError> {
        let mut stmt = self.conn.prepare("SELECT value FROM kv WHERE key = ?1")?;
        let mut items = StoreItems::new();

        for key in keys {
            let raw: Option<String> = stmt.query_row(params![key], |row| row.get(0)).optional()?;
            let Some(raw) = raw else { continue };

            // Each key is independently corruptible; a bad one reads as absent
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    items.insert(key.to_string(), value);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "discarding unreadable stored value");
                }
            }
        }

        Ok(items)
    }

    async fn set(&self, items: StoreItems) -> Result<(), PersistError> {
        let now = Instant::now();
        self.check_rate(now)?;

        let mut encoded = Vec::with_capacity(items.len());
        for (key, value) in &items {
            encoded.push((key.clone(), serde_json::to_string(value)?));
        }
        self.check_quota(&encoded)?;

        let updated_at = chrono::Utc::now().to_rfc3339();
        let tx = self.conn.unchecked_transaction()?;
        for (key, value) in &encoded {
            tx.execute(
                "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, updated_at],
            )?;
        }
        tx.commit()?;

        self.writes.borrow_mut().push_back(now);
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), PersistError> {
        for key in keys {
            self.conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        }
        Ok(())
    }

    async fn bytes_in_use(&self) -> Result<usize, PersistError> {
        self.total_bytes()
    }
}
