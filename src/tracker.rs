use crate::history::TabLookup;
use crate::normalize::{is_trackable_url, normalize_url_key};
use crate::types::now_millis;
use crate::visits::VisitStore;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

/// Tab lifecycle notifications from the host
#[derive(Debug, Clone, PartialEq)]
pub enum TabEvent {
    NavigationCompleted {
        tab_id: i64,
        url: String,
        title: Option<String>,
    },
    Activated {
        tab_id: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    Recorded,
    /// Same tab and URL seen within the debounce window
    Debounced,
    /// Not a trackable page, or the tab is gone
    Ignored,
}

/// Turns tab events into recorded visits, at most one per tab+URL per window
pub struct TabTracker<L: TabLookup> {
    store: Rc<VisitStore>,
    lookup: L,
    debounce: Duration,
    recent: RefCell<HashMap<(i64, String), i64>>,
}

impl<L: TabLookup> TabTracker<L> {
    pub fn new(store: Rc<VisitStore>, lookup: L, debounce: Duration) -> Self {
        Self {
            store,
            lookup,
            debounce,
            recent: RefCell::new(HashMap::new()),
        }
    }

    pub async fn handle_event(&self, event: TabEvent) -> TrackOutcome {
        self.handle_event_at(event, now_millis()).await
    }

    pub async fn handle_event_at(&self, event: TabEvent, now: i64) -> TrackOutcome {
        let (tab_id, url, title) = match event {
            TabEvent::NavigationCompleted { tab_id, url, title } => (tab_id, url, title),
            TabEvent::Activated { tab_id } => match self.lookup.tab_url(tab_id).await {
                Some(url) => (tab_id, url, None),
                None => return TrackOutcome::Ignored,
            },
        };

        if !is_trackable_url(&url) {
            return TrackOutcome::Ignored;
        }

        if self.is_debounced(tab_id, normalize_url_key(&url), now) {
            tracing::trace!(tab_id, %url, "debounced visit");
            return TrackOutcome::Debounced;
        }

        if self.store.record_visit_at(&url, title.as_deref(), now).await {
            TrackOutcome::Recorded
        } else {
            TrackOutcome::Ignored
        }
    }

    fn is_debounced(&self, tab_id: i64, key: String, now: i64) -> bool {
        let window = self.debounce.as_millis() as i64;
        let mut recent = self.recent.borrow_mut();
        recent.retain(|_, seen| now - *seen < window);

        let entry = (tab_id, key);
        if recent.contains_key(&entry) {
            return true;
        }
        recent.insert(entry, now);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryTabs;
    use crate::persistence::{PersistenceSettings, QuotaAwarePersistence};
    use crate::test_support::ScriptedStore;
    use crate::visits::PersistMode;

    fn tracker(tabs: InMemoryTabs) -> (Rc<VisitStore>, TabTracker<InMemoryTabs>) {
        let persistence = QuotaAwarePersistence::new(
            Rc::new(ScriptedStore::default()),
            Rc::new(ScriptedStore::default()),
            PersistenceSettings::default(),
        );
        let store = Rc::new(VisitStore::new(Rc::new(persistence), PersistMode::Await));
        let tracker = TabTracker::new(store.clone(), tabs, Duration::from_secs(5));
        (store, tracker)
    }

    fn completed(tab_id: i64, url: &str) -> TabEvent {
        TabEvent::NavigationCompleted {
            tab_id,
            url: url.to_string(),
            title: Some("Title".to_string()),
        }
    }

    #[tokio::test]
    async fn test_debounces_same_tab_and_url() {
        let (store, tracker) = tracker(InMemoryTabs::default());

        assert_eq!(tracker.handle_event_at(completed(1, "https://a.test/"), 1_000).await, TrackOutcome::Recorded);
        assert_eq!(tracker.handle_event_at(completed(1, "https://a.test/#x"), 3_000).await, TrackOutcome::Debounced);
        assert_eq!(tracker.handle_event_at(completed(2, "https://a.test/"), 3_000).await, TrackOutcome::Recorded);
        assert_eq!(tracker.handle_event_at(completed(1, "https://a.test/"), 6_500).await, TrackOutcome::Recorded);

        assert_eq!(store.get_count("https://a.test/"), 3);
    }

    #[tokio::test]
    async fn test_activation_looks_up_url() {
        let mut tabs = InMemoryTabs::default();
        tabs.set(7, "https://b.test/page");
        let (store, tracker) = tracker(tabs);

        assert_eq!(tracker.handle_event_at(TabEvent::Activated { tab_id: 7 }, 10).await, TrackOutcome::Recorded);
        assert_eq!(tracker.handle_event_at(TabEvent::Activated { tab_id: 8 }, 10).await, TrackOutcome::Ignored);
        assert_eq!(store.get_count("https://b.test/page"), 1);
    }

    #[tokio::test]
    async fn test_ignores_untrackable_pages() {
        let (store, tracker) = tracker(InMemoryTabs::default());
        assert_eq!(tracker.handle_event_at(completed(1, "chrome://newtab/"), 10).await, TrackOutcome::Ignored);
        assert_eq!(tracker.handle_event_at(completed(1, "about:blank"), 10).await, TrackOutcome::Ignored);
        assert!(store.is_empty());
    }
}
