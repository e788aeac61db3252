use crate::importer::ImportSettings;
use crate::persistence::PersistenceSettings;
use crate::ranking::RankingConfig;
use crate::storage::StoreLimits;
use crate::visits::PersistMode;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Name of the per-project data directory
pub const DATA_DIR_NAME: &str = ".frecent";

/// A tunable setting
#[derive(Debug, Clone)]
pub struct ConfigKey {
    pub key: &'static str,
    pub default: &'static str,
    pub description: &'static str,
}

/// Every key the engine reads from `_config.yaml`
pub static CONFIG_KEYS: &[ConfigKey] = &[
    // Ranking
    ConfigKey {
        key: "ranking.fuzzy_weight",
        default: "0.7",
        description: "Weight of the fuzzy match score",
    },
    ConfigKey {
        key: "ranking.freq_weight",
        default: "0.3",
        description: "Weight of the visit frequency boost",
    },
    ConfigKey {
        key: "ranking.max_boost",
        default: "2.0",
        description: "Largest frequency boost a candidate can get",
    },
    ConfigKey {
        key: "ranking.result_cap",
        default: "50",
        description: "Results kept after ranking (0 = no cap)",
    },
    // History import
    ConfigKey {
        key: "import.max_age_days",
        default: "365",
        description: "Oldest history imported, in days",
    },
    ConfigKey {
        key: "import.max_items",
        default: "10000",
        description: "Most history items read",
    },
    ConfigKey {
        key: "import.batch_size",
        default: "1000",
        description: "History items per processing batch",
    },
    ConfigKey {
        key: "import.yield_every_batches",
        default: "3",
        description: "Batches between scheduler yields",
    },
    ConfigKey {
        key: "import.error_report_threshold",
        default: "100",
        description: "Bad items tolerated before an aggregated report",
    },
    // Persistence
    ConfigKey {
        key: "persistence.sync_quota_bytes",
        default: "102400",
        description: "Byte quota of the synced tier",
    },
    ConfigKey {
        key: "persistence.sync_writes_per_minute",
        default: "120",
        description: "Sustained write limit of the synced tier",
    },
    ConfigKey {
        key: "persistence.sync_burst_per_second",
        default: "2",
        description: "Burst write limit of the synced tier",
    },
    ConfigKey {
        key: "persistence.max_retries",
        default: "3",
        description: "Retries after a rate-limited write",
    },
    ConfigKey {
        key: "persistence.retry_base_ms",
        default: "1000",
        description: "Backoff step between retries",
    },
    // Live tracking
    ConfigKey {
        key: "tracking.debounce_secs",
        default: "5",
        description: "Window in which a repeat tab+URL visit is ignored",
    },
];

/// Settings for every component, resolved from config with defaults
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub ranking: RankingConfig,
    pub import: ImportSettings,
    pub persistence: PersistenceSettings,
    pub sync_limits: StoreLimits,
    pub debounce: Duration,
    /// How live recordings reach storage; not read from `_config.yaml`
    pub persist_mode: PersistMode,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            ranking: RankingConfig::default(),
            import: ImportSettings::default(),
            persistence: PersistenceSettings::default(),
            sync_limits: StoreLimits::synced(),
            debounce: Duration::from_secs(5),
            persist_mode: PersistMode::Background,
        }
    }
}

// -----------------------------------------------------------------------------
// Global config
// -----------------------------------------------------------------------------

/// `~/.config/frecent/config.yaml`, shared by every data directory
pub fn global_config_file() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("frecent")
        .join("config.yaml")
}

/// Read a global config file; missing or unreadable files read as empty
pub fn load_global_config(path: &Path) -> HashMap<String, String> {
    let Ok(content) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    serde_yaml::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable global config");
        HashMap::new()
    })
}

/// Data directory used when no `.frecent` is found: the global `data_dir`
/// setting, else `<platform data dir>/frecent`
pub fn default_data_dir(global: &HashMap<String, String>) -> PathBuf {
    if let Some(dir) = global.get("data_dir").filter(|d| !d.trim().is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("frecent")
}

// -----------------------------------------------------------------------------
// Per-data-dir config
// -----------------------------------------------------------------------------

/// Configuration manager for a data directory
pub struct FrecentConfig {
    data_dir: PathBuf,
    config_file: PathBuf,
    config: HashMap<String, serde_yaml::Value>,
}

impl FrecentConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        let config_file = data_dir.join("_config.yaml");
        let mut instance = Self {
            data_dir,
            config_file,
            config: HashMap::new(),
        };
        instance.load();
        instance
    }

    fn load(&mut self) {
        if self.config_file.exists() {
            if let Ok(content) = fs::read_to_string(&self.config_file) {
                match serde_yaml::from_str::<HashMap<String, serde_yaml::Value>>(&content) {
                    Ok(config) => self.config = config,
                    Err(e) => {
                        tracing::warn!(path = %self.config_file.display(), error = %e, "ignoring unreadable config file");
                    }
                }
            }
        }
    }

    fn save(&self) -> std::io::Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let content = serde_yaml::to_string(&self.config).unwrap_or_default();
        fs::write(&self.config_file, content)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.config.get(key).and_then(|v| match v {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }

    pub fn set(&mut self, key: &str, value: &str) -> std::io::Result<()> {
        self.config
            .insert(key.to_string(), serde_yaml::Value::String(value.to_string()));
        self.save()
    }

    /// Parsed value of `key`, or `default` when unset or invalid
    fn parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "invalid config value, using default");
                default
            }),
            None => default,
        }
    }

    pub fn settings(&self) -> EngineSettings {
        let d = EngineSettings::default();

        let result_cap = self.parsed("ranking.result_cap", d.ranking.result_cap.unwrap_or(0));
        let retry_base_ms = self.parsed("persistence.retry_base_ms", d.persistence.retry_base.as_millis() as u64);
        let quota = self.parsed("persistence.sync_quota_bytes", d.sync_limits.quota_bytes.unwrap_or(0));
        let per_minute = self.parsed("persistence.sync_writes_per_minute", d.sync_limits.writes_per_minute.unwrap_or(0));
        let burst = self.parsed("persistence.sync_burst_per_second", d.sync_limits.burst_per_second.unwrap_or(0));

        EngineSettings {
            ranking: RankingConfig {
                fuzzy_weight: self.parsed("ranking.fuzzy_weight", d.ranking.fuzzy_weight),
                freq_weight: self.parsed("ranking.freq_weight", d.ranking.freq_weight),
                max_boost: self.parsed("ranking.max_boost", d.ranking.max_boost),
                result_cap: (result_cap > 0).then_some(result_cap),
            },
            import: ImportSettings {
                max_age_days: self.parsed("import.max_age_days", d.import.max_age_days),
                max_items: self.parsed("import.max_items", d.import.max_items),
                batch_size: self.parsed("import.batch_size", d.import.batch_size).max(1),
                yield_every_batches: self.parsed("import.yield_every_batches", d.import.yield_every_batches).max(1),
                error_report_threshold: self.parsed("import.error_report_threshold", d.import.error_report_threshold),
            },
            persistence: PersistenceSettings {
                max_retries: self.parsed("persistence.max_retries", d.persistence.max_retries),
                retry_base: Duration::from_millis(retry_base_ms),
            },
            sync_limits: StoreLimits {
                quota_bytes: (quota > 0).then_some(quota),
                writes_per_minute: (per_minute > 0).then_some(per_minute),
                burst_per_second: (burst > 0).then_some(burst),
            },
            debounce: Duration::from_secs(self.parsed("tracking.debounce_secs", d.debounce.as_secs())),
            persist_mode: d.persist_mode,
        }
    }
}

/// Find the data directory, searching upward from current directory
pub fn find_data_dir() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let dir = current.join(DATA_DIR_NAME);
        if dir.is_dir() {
            return Some(dir);
        }

        if !current.pop() {
            break;
        }
    }

    // Check FRECENT_PATH environment variable
    if let Ok(path) = std::env::var("FRECENT_PATH") {
        let dir = PathBuf::from(path);
        if dir.is_dir() {
            return Some(dir);
        }
    }

    None
}

/// The discovered data directory, else the global default (created if missing)
pub fn resolve_data_dir() -> std::io::Result<PathBuf> {
    if let Some(dir) = find_data_dir() {
        return Ok(dir);
    }
    let dir = default_data_dir(&load_global_config(&global_config_file()));
    fs::create_dir_all(&dir)?;
    tracing::debug!(path = %dir.display(), "using default data directory");
    Ok(dir)
}
