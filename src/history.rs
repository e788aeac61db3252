//! Host-side data sources: browsing history, bookmarks and tab lookup.
//!
//! The traits are the seam to whatever embeds the engine; the in-memory
//! implementations load the host's JSON exports for the CLI and tests.

use crate::types::{BookmarkNode, HistoryItem};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history API unavailable: {0}")]
    Unavailable(String),

    #[error("permission to read history was denied")]
    PermissionDenied,

    #[error("malformed history data: {0}")]
    Malformed(String),
}

#[async_trait(?Send)]
pub trait HistorySource {
    /// Items visited at or after `start_time` (ms), most recent first, at most `max_results`
    async fn search(&self, start_time: i64, max_results: usize) -> Result<Vec<HistoryItem>, HistoryError>;
}

#[async_trait(?Send)]
pub trait BookmarkSource {
    async fn tree(&self) -> Result<Vec<BookmarkNode>, HistoryError>;
}

#[async_trait(?Send)]
pub trait TabLookup {
    /// Current URL of a tab, if it still exists
    async fn tab_url(&self, tab_id: i64) -> Option<String>;
}

// =============================================================================
// In-memory sources
// =============================================================================

/// History held in memory, filtered the way the host filters its own queries
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistory {
    items: Vec<HistoryItem>,
}

impl InMemoryHistory {
    pub fn new(items: Vec<HistoryItem>) -> Self {
        Self { items }
    }

    /// Load a JSON array of history items
    pub fn from_json_file(path: &Path) -> Result<Self, HistoryError> {
        let content = fs::read_to_string(path)
            .map_err(|e| HistoryError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let items = serde_json::from_str(&content)
            .map_err(|e| HistoryError::Malformed(format!("{}: {}", path.display(), e)))?;
        Ok(Self { items })
    }
}

#[async_trait(?Send)]
impl HistorySource for InMemoryHistory {
    async fn search(&self, start_time: i64, max_results: usize) -> Result<Vec<HistoryItem>, HistoryError> {
        let mut items: Vec<HistoryItem> = self
            .items
            .iter()
            .filter(|item| match item.last_visit_time {
                Some(t) if t.is_finite() => t >= start_time as f64,
                _ => true,
            })
            .cloned()
            .collect();

        items.sort_by(|a, b| {
            let a = a.last_visit_time.unwrap_or(f64::NEG_INFINITY);
            let b = b.last_visit_time.unwrap_or(f64::NEG_INFINITY);
            b.total_cmp(&a)
        });
        items.truncate(max_results);

        Ok(items)
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryBookmarks {
    roots: Vec<BookmarkNode>,
}

impl InMemoryBookmarks {
    pub fn new(roots: Vec<BookmarkNode>) -> Self {
        Self { roots }
    }

    /// Load a JSON bookmark tree (an array of root nodes, or a single root)
    pub fn from_json_file(path: &Path) -> Result<Self, HistoryError> {
        let content = fs::read_to_string(path)
            .map_err(|e| HistoryError::Unavailable(format!("{}: {}", path.display(), e)))?;
        let roots = serde_json::from_str::<Vec<BookmarkNode>>(&content)
            .or_else(|_| serde_json::from_str::<BookmarkNode>(&content).map(|root| vec![root]))
            .map_err(|e| HistoryError::Malformed(format!("{}: {}", path.display(), e)))?;
        Ok(Self { roots })
    }
}

#[async_trait(?Send)]
impl BookmarkSource for InMemoryBookmarks {
    async fn tree(&self) -> Result<Vec<BookmarkNode>, HistoryError> {
        Ok(self.roots.clone())
    }
}

/// Tab id -> current URL
#[derive(Debug, Clone, Default)]
pub struct InMemoryTabs {
    urls: HashMap<i64, String>,
}

impl InMemoryTabs {
    pub fn set(&mut self, tab_id: i64, url: &str) {
        self.urls.insert(tab_id, url.to_string());
    }
}

#[async_trait(?Send)]
impl TabLookup for InMemoryTabs {
    async fn tab_url(&self, tab_id: i64) -> Option<String> {
        self.urls.get(&tab_id).cloned()
    }
}

// =============================================================================
// Bookmark tree flattening
// =============================================================================

/// A bookmark leaf pulled out of the tree
#[derive(Debug, Clone, PartialEq)]
pub struct BookmarkEntry {
    pub url: String,
    pub title: String,
    pub date_last_used: Option<i64>,
}

/// Collect every bookmark with a URL, depth first, in tree order
pub fn flatten_bookmarks(roots: &[BookmarkNode]) -> Vec<BookmarkEntry> {
    let mut entries = Vec::new();
    let mut stack: Vec<&BookmarkNode> = roots.iter().rev().collect();

    while let Some(node) = stack.pop() {
        if let Some(url) = node.url.as_deref().filter(|u| !u.trim().is_empty()) {
            entries.push(BookmarkEntry {
                url: url.to_string(),
                title: node.title.clone(),
                date_last_used: node
                    .date_last_used
                    .filter(|t| t.is_finite() && *t > 0.0)
                    .map(|t| t as i64),
            });
        }
        if let Some(children) = &node.children {
            stack.extend(children.iter().rev());
        }
    }

    entries
}
