use crate::normalize::normalize_url_key;
use crate::types::VisitData;
use serde::{Deserialize, Serialize};

/// Weights for blending fuzzy match quality with visit frequency
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankingConfig {
    pub fuzzy_weight: f64,
    pub freq_weight: f64,
    pub max_boost: f64,
    /// Applied after sorting
    pub result_cap: Option<usize>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            fuzzy_weight: 0.7,
            freq_weight: 0.3,
            max_boost: 2.0,
            result_cap: Some(50),
        }
    }
}

/// A search hit as produced by the fuzzy matcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate<T> {
    pub item: T,
    /// 0 is a perfect match, 1 the worst
    #[serde(default)]
    pub fuzzy_score: Option<f64>,
    #[serde(default)]
    pub url: Option<String>,
}

impl<T> Candidate<T> {
    pub fn new(item: T, fuzzy_score: f64, url: Option<&str>) -> Self {
        Self {
            item,
            fuzzy_score: Some(fuzzy_score),
            url: url.map(str::to_string),
        }
    }
}

/// A candidate with its combined score; lower sorts first
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredEntry<T> {
    pub item: T,
    pub fuzzy_score: f64,
    pub visit_count: u64,
    pub final_score: f64,
}

pub struct RankingEngine {
    config: RankingConfig,
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self::new(RankingConfig::default())
    }
}

impl RankingEngine {
    /// Non-finite weights fall back to their defaults
    pub fn new(config: RankingConfig) -> Self {
        let defaults = RankingConfig::default();
        let finite_or = |value: f64, default: f64| if value.is_finite() { value } else { default };

        Self {
            config: RankingConfig {
                fuzzy_weight: finite_or(config.fuzzy_weight, defaults.fuzzy_weight),
                freq_weight: finite_or(config.freq_weight, defaults.freq_weight),
                max_boost: finite_or(config.max_boost, defaults.max_boost),
                result_cap: config.result_cap,
            },
        }
    }

    pub fn config(&self) -> &RankingConfig {
        &self.config
    }

    /// Re-order fuzzy matches by blending in visit frequency.
    ///
    /// Never fails: a missing or non-finite fuzzy score counts as the worst
    /// match and a missing URL as zero visits. Ties keep candidate order.
    pub fn rank<T>(&self, candidates: Vec<Candidate<T>>, visits: &VisitData) -> Vec<ScoredEntry<T>> {
        let scored: Vec<(Candidate<T>, f64, u64)> = candidates
            .into_iter()
            .map(|c| {
                let fuzzy = sanitize_fuzzy(c.fuzzy_score);
                let count = c.url.as_deref().map_or(0, |url| lookup_count(visits, url));
                (c, fuzzy, count)
            })
            .collect();

        let max_visits = scored.iter().map(|(_, _, count)| *count).max().unwrap_or(0);

        let mut results: Vec<ScoredEntry<T>> = scored
            .into_iter()
            .map(|(candidate, fuzzy, count)| ScoredEntry {
                final_score: self.final_score(fuzzy, count, max_visits),
                item: candidate.item,
                fuzzy_score: fuzzy,
                visit_count: count,
            })
            .collect();

        results.sort_by(|a, b| a.final_score.total_cmp(&b.final_score));

        if let Some(cap) = self.config.result_cap {
            results.truncate(cap);
        }
        results
    }

    pub fn final_score(&self, fuzzy_score: f64, visit_count: u64, max_visits: u64) -> f64 {
        let normalized_freq = if visit_count > 0 && max_visits > 0 {
            (visit_count as f64 / max_visits as f64).min(1.0)
        } else {
            0.0
        };

        fuzzy_score * self.config.fuzzy_weight
            - normalized_freq * self.config.max_boost * self.config.freq_weight
    }
}

fn sanitize_fuzzy(score: Option<f64>) -> f64 {
    match score {
        Some(s) if s.is_finite() => s.clamp(0.0, 1.0),
        _ => 1.0,
    }
}

fn lookup_count(visits: &VisitData, url: &str) -> u64 {
    visits
        .get(&normalize_url_key(url))
        .or_else(|| visits.get(url))
        .map_or(0, |r| r.count)
}
