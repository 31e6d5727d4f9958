//! virtflow.toml configuration parser.
//!
//! Every section has defaults so an empty file (or no file at a given path)
//! still yields a usable config, except for the node source: with neither
//! `source_url` nor `source_file` set, `validate` fails and the daemon must
//! not start.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variable overriding `inventory.source_url`.
pub const ENV_SOURCE_URL: &str = "VIRTFLOW_NODE_SOURCE_URL";
/// Environment variable overriding `inventory.source_file`.
pub const ENV_SOURCE_FILE: &str = "VIRTFLOW_NODE_SOURCE_FILE";
/// Environment variable overriding `retry.max_retries`.
pub const ENV_MAX_RETRIES: &str = "VIRTFLOW_MAX_RETRIES";
/// Environment variable overriding `worker.count`.
pub const ENV_WORKERS: &str = "VIRTFLOW_WORKERS";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VirtflowConfig {
    pub inventory: InventoryConfig,
    pub placement: PlacementConfig,
    pub retry: RetryConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InventoryConfig {
    /// HTTP endpoint serving the node list as a JSON array.
    pub source_url: Option<String>,
    /// Local JSON file holding the node list.
    pub source_file: Option<PathBuf>,
    pub refresh_interval_secs: u64,
    pub fetch_timeout_secs: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            source_url: None,
            source_file: None,
            refresh_interval_secs: 10,
            fetch_timeout_secs: 5,
        }
    }
}

impl InventoryConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// Which scoring strategy ranks eligible nodes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    CombinedSpare,
    CpuSpare,
    MemorySpare,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlacementConfig {
    pub strategy: StrategyKind,
    /// Only used by the `weighted` strategy.
    pub cpu_weight: f64,
    /// Only used by the `weighted` strategy.
    pub memory_weight: f64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::CombinedSpare,
            cpu_weight: 1.0,
            memory_weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed before a task is marked failed.
    pub max_retries: u32,
    /// Delay added per retry already spent.
    pub base_delay_ms: u64,
    /// Upper bound of the uniform random jitter.
    pub jitter_ceiling_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 3_000,
            jitter_ceiling_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers draining the queue.
    pub count: usize,
    pub queue_capacity: usize,
    pub publish_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            queue_capacity: 100,
            publish_timeout_ms: 5_000,
        }
    }
}

impl WorkerConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl VirtflowConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from an optional file, apply environment overrides, and validate.
    ///
    /// A path that does not exist falls back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(p)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (normally the process environment).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SOURCE_URL).filter(|v| !v.is_empty()) {
            self.inventory.source_url = Some(url);
        }
        if let Some(file) = lookup(ENV_SOURCE_FILE).filter(|v| !v.is_empty()) {
            self.inventory.source_file = Some(PathBuf::from(file));
        }
        if let Some(raw) = lookup(ENV_MAX_RETRIES) {
            self.retry.max_retries = parse_env(ENV_MAX_RETRIES, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WORKERS) {
            self.worker.count = parse_env(ENV_WORKERS, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inventory.source_url.is_none() && self.inventory.source_file.is_none() {
            return Err(ConfigError::MissingRequired {
                key: "inventory.source_url".to_string(),
                hint: format!("Set inventory.source_url, inventory.source_file, or {ENV_SOURCE_URL}."),
            });
        }
        if self.inventory.refresh_interval_secs == 0 {
            return Err(invalid("inventory.refresh_interval_secs", "must be greater than zero"));
        }
        if self.inventory.fetch_timeout_secs == 0 {
            return Err(invalid("inventory.fetch_timeout_secs", "must be greater than zero"));
        }
        if self.worker.count == 0 {
            return Err(invalid("worker.count", "must be greater than zero"));
        }
        if self.worker.queue_capacity == 0 {
            return Err(invalid("worker.queue_capacity", "must be greater than zero"));
        }
        for (key, weight) in [
            ("placement.cpu_weight", self.placement.cpu_weight),
            ("placement.memory_weight", self.placement.memory_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(invalid(key, "must be a non-negative number"));
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, &format!("cannot parse {raw:?}")))
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
