//! Configuration system for verso.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use strum::{Display, EnumString};

use crate::error::{VersoError, VersoResult};

/// Path value that opens a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Which physical row survives a major edit as the current row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArchiveStrategy {
    /// The current row keeps its physical key; the prior state is inserted
    /// as a new archived row.
    #[default]
    CopyOnArchive,
    /// The prior physical row is relabelled as archived in place and a new
    /// physical row becomes current.
    PromoteNewRow,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database, or `:memory:`.
    pub database_path: PathBuf,
    /// How long a writer waits for the database lock, in milliseconds.
    pub busy_timeout_ms: u64,
    /// Archival strategy used for major edits.
    pub archive_strategy: ArchiveStrategy,
    /// Turn on SQLite foreign key enforcement for the connection.
    pub enforce_foreign_keys: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let verso_dir = dirs::home_dir()
            .map(|h| h.join(".verso"))
            .unwrap_or_else(|| PathBuf::from(".verso"));

        Self {
            database_path: verso_dir.join("verso.db"),
            busy_timeout_ms: 5_000,
            archive_strategy: ArchiveStrategy::default(),
            enforce_foreign_keys: true,
        }
    }
}

impl StoreConfig {
    /// Configuration for a private in-memory database.
    pub fn in_memory() -> Self {
        Self {
            database_path: PathBuf::from(IN_MEMORY_PATH),
            ..Self::default()
        }
    }

    /// Whether this configuration opens an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.database_path.as_os_str() == IN_MEMORY_PATH
    }

    /// Load configuration from a file (TOML, JSON, or YAML).
    pub fn from_file(path: impl AsRef<Path>) -> VersoResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let ext = path.as_ref().extension().and_then(|e| e.to_str());

        match ext {
            Some("toml") => {
                toml::from_str(&content).map_err(|e| VersoError::Configuration(e.to_string()))
            }
            Some("json") => serde_json::from_str(&content)
                .map_err(|e| VersoError::Configuration(e.to_string())),
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| VersoError::Configuration(e.to_string())),
            _ => Err(VersoError::Configuration(
                "Unsupported config file format. Use .toml, .json, or .yaml".to_string(),
            )),
        }
    }

    /// Load configuration from `VERSO_*` environment variables.
    pub fn from_env() -> VersoResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("VERSO_DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }
        if let Ok(timeout) = std::env::var("VERSO_BUSY_TIMEOUT_MS") {
            config.busy_timeout_ms = timeout.parse().map_err(|_| {
                VersoError::Configuration(format!(
                    "VERSO_BUSY_TIMEOUT_MS must be an integer, got '{}'",
                    timeout
                ))
            })?;
        }
        if let Ok(strategy) = std::env::var("VERSO_ARCHIVE_STRATEGY") {
            config.archive_strategy = ArchiveStrategy::from_str(&strategy.to_lowercase())
                .map_err(|_| {
                    VersoError::Configuration(format!("Unknown archive strategy '{}'", strategy))
                })?;
        }
        if let Ok(flag) = std::env::var("VERSO_ENFORCE_FOREIGN_KEYS") {
            config.enforce_foreign_keys = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Build configuration using builder pattern.
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }
}

/// Builder for StoreConfig.
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the database path.
    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    /// Use a private in-memory database.
    pub fn in_memory(mut self) -> Self {
        self.config.database_path = PathBuf::from(IN_MEMORY_PATH);
        self
    }

    /// Set the lock wait timeout.
    pub fn busy_timeout_ms(mut self, millis: u64) -> Self {
        self.config.busy_timeout_ms = millis;
        self
    }

    /// Set the archival strategy.
    pub fn archive_strategy(mut self, strategy: ArchiveStrategy) -> Self {
        self.config.archive_strategy = strategy;
        self
    }

    /// Enable or disable foreign key enforcement.
    pub fn enforce_foreign_keys(mut self, enabled: bool) -> Self {
        self.config.enforce_foreign_keys = enabled;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> StoreConfig {
        self.config
    }
}
