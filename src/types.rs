use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Normalized key -> aggregated visit record
pub type VisitData = HashMap<String, VisitRecord>;

/// Milliseconds since the Unix epoch, the unit every host timestamp uses
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Aggregated frequency, recency and title data for one normalized key.
///
/// The same shape doubles as the delta passed to [`VisitRecord::merge_from`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitRecord {
    pub count: u64,
    pub last_visited: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_title: Option<String>,
}

impl VisitRecord {
    /// A single visit at `at`
    pub fn visit(at: i64, title: Option<&str>) -> Self {
        Self {
            count: 1,
            last_visited: at,
            title: title.map(str::to_string),
            custom_title: None,
        }
    }

    /// Fold `other` into this record.
    ///
    /// Counts add, `last_visited` takes the max, the title of the more recent
    /// side wins unless it is blank, and a bookmark-supplied `custom_title`
    /// survives merges that carry none.
    pub fn merge_from(&mut self, other: VisitRecord) {
        self.count = self.count.saturating_add(other.count);

        let other_is_newer = other.last_visited >= self.last_visited;
        self.last_visited = self.last_visited.max(other.last_visited);

        if let Some(title) = non_blank(other.title.as_deref()) {
            if other_is_newer || non_blank(self.title.as_deref()).is_none() {
                self.title = Some(title.to_string());
            }
        }

        if let Some(custom) = non_blank(other.custom_title.as_deref()) {
            self.custom_title = Some(custom.to_string());
        }
    }

    /// Title to show: bookmark title first, then page title
    pub fn display_title(&self) -> Option<&str> {
        non_blank(self.custom_title.as_deref()).or_else(|| non_blank(self.title.as_deref()))
    }
}

/// Durable record of the one-time history bootstrap
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializationState {
    pub is_initialized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialization_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_denied: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_completion: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_timestamp: Option<i64>,
}

/// One row of the host's browsing history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub last_visit_time: Option<f64>,
    #[serde(default)]
    pub visit_count: Option<i64>,
}

/// A node of the host's bookmark tree (folders carry `children`, leaves a `url`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkNode {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub children: Option<Vec<BookmarkNode>>,
    #[serde(default)]
    pub date_last_used: Option<f64>,
}

/// Statistics about the visit store
#[derive(Debug, Clone, Default)]
pub struct VisitStats {
    pub total_urls: usize,
    pub total_visits: u64,
    pub most_visited: Vec<(String, VisitRecord)>,
    pub initialization: InitializationState,
    pub storage_available: bool,
    pub synced_bytes: Option<usize>,
}
