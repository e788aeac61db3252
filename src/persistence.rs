//! Quota-aware persistence of visit data.
//!
//! `save` repairs what it can before reporting failure: quota errors evict the
//! oldest entries and retry once, rate limits back off and retry, anything else
//! falls through to the unbounded local tier. When that tier fails too the
//! layer goes degraded for the rest of the process and data stays in memory.
//!
//! Each blob is stamped with its save time, and `load` serves whichever tier
//! was written last.

use crate::storage::{KeyValueStore, PersistError, StoreItems};
use crate::types::{now_millis, VisitData, VisitRecord};
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

pub const VISIT_DATA_KEY: &str = "visitData";
pub const SCHEMA_VERSION_KEY: &str = "visitDataVersion";
pub const SAVED_AT_KEY: &str = "visitDataSavedAt";

/// Version written next to every visit blob
pub const SCHEMA_VERSION: u64 = 2;

/// How much to evict when the primary tier reports it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// History import: 30% of entries, at least one
    Aggressive,
    /// Live clicks: 20% of entries
    SteadyState,
}

impl EvictionPolicy {
    pub fn evict_count(self, len: usize) -> usize {
        match self {
            EvictionPolicy::Aggressive if len > 0 => (len * 3 / 10).max(1),
            EvictionPolicy::Aggressive => 0,
            EvictionPolicy::SteadyState => len * 2 / 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageTier {
    Primary,
    Fallback,
}

/// Outcome of a successful save
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveReport {
    pub tier: StorageTier,
    pub stored: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceSettings {
    pub max_retries: u32,
    pub retry_base: Duration,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_millis(1000),
        }
    }
}

pub struct QuotaAwarePersistence {
    primary: Rc<dyn KeyValueStore>,
    fallback: Rc<dyn KeyValueStore>,
    settings: PersistenceSettings,
    available: Cell<bool>,
    /// Latest stamp written or seen; stamps only grow within a process
    last_stamp: Cell<i64>,
}

impl QuotaAwarePersistence {
    pub fn new(
        primary: Rc<dyn KeyValueStore>,
        fallback: Rc<dyn KeyValueStore>,
        settings: PersistenceSettings,
    ) -> Self {
        Self {
            primary,
            fallback,
            settings,
            available: Cell::new(true),
            last_stamp: Cell::new(0),
        }
    }

    /// False once both tiers have failed; stays false until restart
    pub fn is_available(&self) -> bool {
        self.available.get()
    }

    pub fn primary(&self) -> &Rc<dyn KeyValueStore> {
        &self.primary
    }

    pub async fn save(
        &self,
        data: &VisitData,
        policy: EvictionPolicy,
    ) -> Result<SaveReport, PersistError> {
        if !self.is_available() {
            return Err(PersistError::StorageUnavailable);
        }

        let stamp = self.next_stamp();
        let mut payload = data.clone();
        let mut evicted = 0;
        let mut attempt = 0u32;

        loop {
            match write_visits(&*self.primary, &payload, stamp).await {
                Ok(()) => {
                    return Ok(SaveReport {
                        tier: StorageTier::Primary,
                        stored: payload.len(),
                        evicted,
                    });
                }
                Err(PersistError::QuotaExceeded(detail)) if evicted == 0 => {
                    let count = policy.evict_count(payload.len());
                    if count == 0 {
                        tracing::warn!(%detail, "quota exceeded with nothing to evict");
                        break;
                    }
                    evict_oldest(&mut payload, count);
                    evicted = count;
                    tracing::warn!(%detail, evicted, remaining = payload.len(), "quota exceeded, evicted oldest visits");
                }
                Err(PersistError::RateLimited(kind)) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    let delay = self.settings.retry_base * attempt;
                    tracing::warn!(?kind, attempt, delay_ms = delay.as_millis() as u64, "storage rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "primary storage tier failed, using fallback tier");
                    break;
                }
            }
        }

        match write_visits(&*self.fallback, data, stamp).await {
            Ok(()) => Ok(SaveReport {
                tier: StorageTier::Fallback,
                stored: data.len(),
                evicted: 0,
            }),
            Err(err) => {
                self.available.set(false);
                tracing::error!(error = %err, "fallback storage tier failed, keeping visits in memory only");
                Err(err)
            }
        }
    }

    /// Load the most recently saved visit data, dropping invalid entries.
    ///
    /// Never fails. On equal stamps the primary tier wins.
    pub async fn load(&self) -> VisitData {
        if !self.is_available() {
            return VisitData::new();
        }

        let mut newest: Option<(i64, VisitData)> = None;
        for (tier, store) in [
            (StorageTier::Primary, &self.primary),
            (StorageTier::Fallback, &self.fallback),
        ] {
            match read_visits(&**store).await {
                Ok(Some((saved_at, data))) => {
                    tracing::debug!(?tier, saved_at, entries = data.len(), "found stored visit data");
                    if newest.as_ref().map_or(true, |(best, _)| saved_at > *best) {
                        newest = Some((saved_at, data));
                    }
                }
                Ok(None) => {}
                Err(err @ PersistError::SchemaIncompatible { .. }) => {
                    tracing::warn!(?tier, error = %err, "discarding visit data from a newer version");
                    if let Err(e) = self.clear().await {
                        tracing::warn!(error = %e, "failed to remove incompatible visit data");
                    }
                    return VisitData::new();
                }
                Err(err) => {
                    tracing::warn!(?tier, error = %err, "failed to read visit data");
                }
            }
        }

        match newest {
            Some((saved_at, data)) => {
                self.last_stamp.set(self.last_stamp.get().max(saved_at));
                data
            }
            None => VisitData::new(),
        }
    }

    /// Remove stored visit data from both tiers
    pub async fn clear(&self) -> Result<(), PersistError> {
        let keys = [VISIT_DATA_KEY, SCHEMA_VERSION_KEY, SAVED_AT_KEY];
        self.primary.remove(&keys).await?;
        self.fallback.remove(&keys).await
    }

    fn next_stamp(&self) -> i64 {
        let stamp = now_millis().max(self.last_stamp.get() + 1);
        self.last_stamp.set(stamp);
        stamp
    }
}

async fn write_visits(store: &dyn KeyValueStore, data: &VisitData, stamp: i64) -> Result<(), PersistError> {
    let mut items = StoreItems::new();
    items.insert(VISIT_DATA_KEY.to_string(), serde_json::to_value(data)?);
    items.insert(SCHEMA_VERSION_KEY.to_string(), Value::from(SCHEMA_VERSION));
    items.insert(SAVED_AT_KEY.to_string(), Value::from(stamp));
    store.set(items).await
}

/// Stored visit data with its save stamp (0 when unstamped)
async fn read_visits(store: &dyn KeyValueStore) -> Result<Option<(i64, VisitData)>, PersistError> {
    let items = store.get(&[VISIT_DATA_KEY, SCHEMA_VERSION_KEY, SAVED_AT_KEY]).await?;

    let version = items.get(SCHEMA_VERSION_KEY).and_then(Value::as_u64).unwrap_or(1);
    if version > SCHEMA_VERSION {
        return Err(PersistError::SchemaIncompatible {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    let Some(raw) = items.get(VISIT_DATA_KEY) else {
        return Ok(None);
    };
    let Some(entries) = raw.as_object() else {
        tracing::warn!("stored visit data is not an object, ignoring it");
        return Ok(None);
    };

    let data: VisitData = entries
        .iter()
        .filter_map(|(key, value)| parse_record(key, value).map(|r| (key.clone(), r)))
        .collect();

    let dropped = entries.len() - data.len();
    if dropped > 0 {
        tracing::debug!(dropped, kept = data.len(), "dropped invalid visit entries on load");
    }

    let saved_at = items.get(SAVED_AT_KEY).and_then(Value::as_i64).unwrap_or(0);
    Ok(Some((saved_at, data)))
}

fn parse_record(key: &str, value: &Value) -> Option<VisitRecord> {
    if key.trim().is_empty() {
        return None;
    }

    let obj = value.as_object()?;
    let count = obj.get("count")?.as_f64().filter(|c| c.is_finite() && *c >= 0.0)?;
    let last_visited = obj
        .get("lastVisited")?
        .as_f64()
        .filter(|t| t.is_finite() && *t > 0.0)?;
    let text = |field: &str| obj.get(field).and_then(Value::as_str).map(str::to_string);

    Some(VisitRecord {
        count: count as u64,
        last_visited: last_visited as i64,
        title: text("title"),
        custom_title: text("customTitle"),
    })
}

/// Drop the `count` entries with the oldest `last_visited` (ties by key)
pub fn evict_oldest(data: &mut VisitData, count: usize) {
    let mut by_age: Vec<(i64, String)> = data
        .iter()
        .map(|(key, record)| (record.last_visited, key.clone()))
        .collect();
    by_age.sort();

    for (_, key) in by_age.into_iter().take(count) {
        data.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{RateLimitKind, SqliteKvStore, StoreLimits};
    use crate::test_support::{ascending_visits, ScriptedStore};
    use serde_json::json;

    fn quick() -> PersistenceSettings {
        PersistenceSettings {
            max_retries: 3,
            retry_base: Duration::from_millis(1),
        }
    }

    fn layer(primary: Rc<dyn KeyValueStore>, fallback: Rc<dyn KeyValueStore>) -> QuotaAwarePersistence {
        QuotaAwarePersistence::new(primary, fallback, quick())
    }

    #[test]
    fn test_evict_count() {
        assert_eq!(EvictionPolicy::Aggressive.evict_count(100), 30);
        assert_eq!(EvictionPolicy::Aggressive.evict_count(2), 1);
        assert_eq!(EvictionPolicy::Aggressive.evict_count(0), 0);
        assert_eq!(EvictionPolicy::SteadyState.evict_count(100), 20);
        assert_eq!(EvictionPolicy::SteadyState.evict_count(4), 0);
    }

    #[test]
    fn test_evict_oldest_removes_exactly_the_oldest() {
        let mut data = ascending_visits(100);
        evict_oldest(&mut data, EvictionPolicy::Aggressive.evict_count(100));

        assert_eq!(data.len(), 70);
        for i in 0..30 {
            assert!(!data.contains_key(&format!("site{}.test/", i)));
        }
        for i in 30..100 {
            assert!(data.contains_key(&format!("site{}.test/", i)));
        }
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let primary = Rc::new(SqliteKvStore::in_memory(StoreLimits::unlimited()).unwrap());
        let fallback = Rc::new(SqliteKvStore::in_memory(StoreLimits::unlimited()).unwrap());
        let persistence = layer(primary, fallback);

        let data = ascending_visits(5);
        let report = persistence.save(&data, EvictionPolicy::SteadyState).await.unwrap();
        assert_eq!(report, SaveReport { tier: StorageTier::Primary, stored: 5, evicted: 0 });
        assert_eq!(persistence.load().await, data);
    }

    #[tokio::test]
    async fn test_quota_evicts_then_retries_once() {
        let primary = Rc::new(ScriptedStore::with_entry_limit(70));
        let fallback = Rc::new(ScriptedStore::default());
        let persistence = layer(primary.clone(), fallback.clone());

        let report = persistence
            .save(&ascending_visits(100), EvictionPolicy::Aggressive)
            .await
            .unwrap();

        assert_eq!(report.tier, StorageTier::Primary);
        assert_eq!(report.evicted, 30);
        assert_eq!(primary.stored_visits(), Some(70));
        assert_eq!(primary.set_calls.get(), 2);
        assert_eq!(fallback.set_calls.get(), 0);
    }

    #[tokio::test]
    async fn test_quota_after_eviction_goes_to_fallback() {
        let primary = Rc::new(ScriptedStore::with_entry_limit(10));
        let fallback = Rc::new(ScriptedStore::default());
        let persistence = layer(primary.clone(), fallback.clone());

        let report = persistence
            .save(&ascending_visits(100), EvictionPolicy::SteadyState)
            .await
            .unwrap();

        assert_eq!(report.tier, StorageTier::Fallback);
        assert_eq!(fallback.stored_visits(), Some(100));
        assert_eq!(primary.set_calls.get(), 2);
    }

    #[tokio::test]
    async fn test_rate_limit_backs_off_and_retries() {
        let primary = Rc::new(ScriptedStore::with_failures(vec![
            PersistError::RateLimited(RateLimitKind::Burst),
            PersistError::RateLimited(RateLimitKind::Sustained),
        ]));
        let fallback = Rc::new(ScriptedStore::default());
        let persistence = layer(primary.clone(), fallback.clone());

        let report = persistence
            .save(&ascending_visits(3), EvictionPolicy::SteadyState)
            .await
            .unwrap();

        assert_eq!(report.tier, StorageTier::Primary);
        assert_eq!(primary.set_calls.get(), 3);
        assert_eq!(primary.stored_visits(), Some(3));
    }

    #[tokio::test]
    async fn test_rate_limit_exhausted_uses_fallback() {
        let failures = (0..4)
            .map(|_| PersistError::RateLimited(RateLimitKind::Sustained))
            .collect();
        let primary = Rc::new(ScriptedStore::with_failures(failures));
        let fallback = Rc::new(ScriptedStore::default());
        let persistence = layer(primary.clone(), fallback.clone());

        let report = persistence
            .save(&ascending_visits(3), EvictionPolicy::SteadyState)
            .await
            .unwrap();

        assert_eq!(report.tier, StorageTier::Fallback);
        assert_eq!(primary.set_calls.get(), 4);
    }

    #[tokio::test]
    async fn test_both_tiers_failing_degrades_for_good() {
        let primary = Rc::new(ScriptedStore::failing());
        let fallback = Rc::new(ScriptedStore::failing());
        let persistence = layer(primary.clone(), fallback.clone());

        let err = persistence
            .save(&ascending_visits(3), EvictionPolicy::SteadyState)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Backend(_)));
        assert!(!persistence.is_available());

        let err = persistence
            .save(&ascending_visits(3), EvictionPolicy::SteadyState)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::StorageUnavailable));
        assert_eq!(primary.set_calls.get(), 1);
        assert_eq!(fallback.set_calls.get(), 1);
    }

    #[tokio::test]
    async fn test_load_drops_invalid_entries() {
        let primary = Rc::new(ScriptedStore::default());
        primary.items.borrow_mut().insert(
            VISIT_DATA_KEY.to_string(),
            json!({
                "good.test/": {"count": 3, "lastVisited": 100, "title": "Good"},
                "negative.test/": {"count": -1, "lastVisited": 100},
                "zero-time.test/": {"count": 1, "lastVisited": 0},
                "no-count.test/": {"lastVisited": 100},
                "": {"count": 1, "lastVisited": 100},
                "not-object.test/": 7
            }),
        );
        let persistence = layer(primary, Rc::new(ScriptedStore::default()));

        let data = persistence.load().await;
        assert_eq!(data.len(), 1);
        assert_eq!(data["good.test/"].count, 3);
        assert_eq!(data["good.test/"].title.as_deref(), Some("Good"));
    }

    #[tokio::test]
    async fn test_load_discards_newer_schema() {
        let primary = Rc::new(ScriptedStore::default());
        primary.items.borrow_mut().extend([
            (VISIT_DATA_KEY.to_string(), json!({"a.test/": {"count": 1, "lastVisited": 5}})),
            (SCHEMA_VERSION_KEY.to_string(), json!(SCHEMA_VERSION + 1)),
        ]);
        let persistence = layer(primary.clone(), Rc::new(ScriptedStore::default()));

        assert!(persistence.load().await.is_empty());
        assert!(primary.items.borrow().get(VISIT_DATA_KEY).is_none());
    }

    #[tokio::test]
    async fn test_load_prefers_most_recent_tier() {
        let primary = Rc::new(ScriptedStore::with_entry_limit(5));
        let fallback = Rc::new(ScriptedStore::default());
        let persistence = layer(primary.clone(), fallback.clone());

        let small = ascending_visits(3);
        let large = ascending_visits(100);
        assert_eq!(persistence.save(&small, EvictionPolicy::SteadyState).await.unwrap().tier, StorageTier::Primary);
        assert_eq!(persistence.save(&large, EvictionPolicy::SteadyState).await.unwrap().tier, StorageTier::Fallback);
        assert_eq!(primary.stored_visits(), Some(3));

        let reopened = layer(primary.clone(), fallback.clone());
        assert_eq!(reopened.load().await, large);

        // a later primary write takes over again
        let smaller = ascending_visits(4);
        assert_eq!(reopened.save(&smaller, EvictionPolicy::SteadyState).await.unwrap().tier, StorageTier::Primary);
        assert_eq!(layer(primary, fallback).load().await, smaller);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_local_tier() {
        let primary = Rc::new(ScriptedStore::default());
        let fallback = Rc::new(ScriptedStore::default());
        fallback.items.borrow_mut().insert(
            VISIT_DATA_KEY.to_string(),
            json!({"a.test/": {"count": 2, "lastVisited": 5}}),
        );
        let persistence = layer(primary, fallback);

        let data = persistence.load().await;
        assert_eq!(data["a.test/"].count, 2);
    }
}
