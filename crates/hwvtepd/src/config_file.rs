//! Configuration file support for hwvtepd
//!
//! Loads and validates hwvtepd configuration from TOML files.
//! Default location: /etc/hwvtep/hwvtepd.toml

use hwvtep_ha::{BridgeSelection, HaEngineConfig};
use hwvtep_store::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hwvtep/hwvtepd.toml";

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    /// Only I/O failures can go away on their own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Bridge reconciliation configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Bridges to reconcile; empty means every managed bridge
    #[serde(default)]
    pub bridge_inclusion: Vec<String>,

    /// Bridges never reconciled
    #[serde(default)]
    pub bridge_exclusion: Vec<String>,

    /// How long deferred termination points wait for their bridge
    #[serde(default = "default_tp_cache_timeout")]
    pub tp_cache_timeout_secs: u64,
}

/// Listener worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Subscription queue depth per listener
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Commit timeout in milliseconds, 0 waits forever
    #[serde(default = "default_commit_timeout")]
    pub commit_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level; RUST_LOG overrides it
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
}

/// Complete hwvtepd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HwvtepdConfig {
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_tp_cache_timeout() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    256
}

fn default_commit_timeout() -> u64 {
    0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            bridge_inclusion: Vec::new(),
            bridge_exclusion: Vec::new(),
            tp_cache_timeout_secs: default_tp_cache_timeout(),
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            commit_timeout_ms: default_commit_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl HwvtepdConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                eprintln!(
                    "hwvtepd: Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> ConfigResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get the deferred termination point timeout as Duration
    pub fn tp_cache_timeout(&self) -> Duration {
        Duration::from_secs(self.reconciliation.tp_cache_timeout_secs)
    }

    /// Get the commit timeout, `None` when disabled
    pub fn commit_timeout(&self) -> Option<Duration> {
        match self.workers.commit_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Validate configuration
    ///
    /// Setting both bridge lists is allowed; the engine warns and applies
    /// the exclusion list.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.workers.queue_capacity == 0 {
            return Err(ConfigError::invalid("workers.queue_capacity", "must be > 0"));
        }

        if self.reconciliation.tp_cache_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "reconciliation.tp_cache_timeout_secs",
                "must be > 0",
            ));
        }

        let level = self.logging.level.to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("'{}' is not one of {}", self.logging.level, LOG_LEVELS.join(", ")),
            ));
        }

        let names = self
            .reconciliation
            .bridge_inclusion
            .iter()
            .chain(&self.reconciliation.bridge_exclusion);
        for name in names {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid(
                    "reconciliation",
                    "bridge names must not be empty",
                ));
            }
        }

        Ok(())
    }

    /// Build the engine configuration
    pub fn engine_config(&self) -> HaEngineConfig {
        HaEngineConfig {
            selection: BridgeSelection::new(
                self.reconciliation.bridge_inclusion.clone(),
                self.reconciliation.bridge_exclusion.clone(),
            ),
            tp_cache_timeout: self.tp_cache_timeout(),
            worker: WorkerConfig {
                queue_capacity: self.workers.queue_capacity,
                commit_timeout: self.commit_timeout(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = HwvtepdConfig::default();
        assert!(config.reconciliation.bridge_inclusion.is_empty());
        assert!(config.reconciliation.bridge_exclusion.is_empty());
        assert_eq!(config.reconciliation.tp_cache_timeout_secs, 60);
        assert_eq!(config.workers.queue_capacity, 256);
        assert_eq!(config.workers.commit_timeout_ms, 0);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let config: HwvtepdConfig = toml::from_str(
            r#"
            [reconciliation]
            bridge_exclusion = ["br-int"]

            [logging]
            json = true
            "#,
        )
        .unwrap();

        assert_eq!(config.reconciliation.bridge_exclusion, vec!["br-int"]);
        assert_eq!(config.reconciliation.tp_cache_timeout_secs, 60);
        assert_eq!(config.workers, WorkersConfig::default());
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.json);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = HwvtepdConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, HwvtepdConfig::default());
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hwvtepd.toml");
        fs::write(&path, "[workers\nqueue_capacity = 1").unwrap();

        let err = HwvtepdConfig::load_or_default(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hwvtepd.toml");

        let mut config = HwvtepdConfig::default();
        config.reconciliation.bridge_inclusion = vec!["br0".to_string()];
        config.workers.commit_timeout_ms = 1500;
        config.save(&path).unwrap();

        let loaded = HwvtepdConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.commit_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HwvtepdConfig::default();
        config.workers.queue_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "workers.queue_capacity", .. })
        ));

        let mut config = HwvtepdConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = HwvtepdConfig::default();
        config.reconciliation.bridge_exclusion = vec![" ".to_string()];
        assert!(config.validate().is_err());

        let mut config = HwvtepdConfig::default();
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config() {
        let mut config = HwvtepdConfig::default();
        config.reconciliation.bridge_inclusion = vec!["br1".to_string()];
        config.reconciliation.bridge_exclusion = vec!["br2".to_string()];
        config.reconciliation.tp_cache_timeout_secs = 5;
        config.workers.queue_capacity = 32;

        // Contradictory lists are still a valid file
        assert!(config.validate().is_ok());

        let engine = config.engine_config();
        assert_eq!(engine.selection.inclusion, vec!["br1"]);
        assert_eq!(engine.selection.exclusion, vec!["br2"]);
        assert!(engine.selection.validate().is_err());
        assert_eq!(engine.tp_cache_timeout, Duration::from_secs(5));
        assert_eq!(engine.worker.queue_capacity, 32);
        assert_eq!(engine.worker.commit_timeout, None);
    }
}
