//! Rebuild configuration
//!
//! Loaded from defaults, an optional TOML file and `SPRAID_*` environment
//! overrides, in that order.

use serde::{Deserialize, Serialize};
use spraid_core::{ControllerId, Lba, DEFAULT_CHUNK_SIZE_BLOCKS};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Rebuild subsystem configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildConfig {
    /// Blocks per rebuild chunk (unit of checkpoint advancement)
    pub chunk_size_blocks: Lba,

    /// Progress event cadence in percent
    pub progress_interval_percent: u8,

    /// Positions of one raid group rebuilding at once
    pub max_parallel_rebuilds: usize,

    /// Pending events kept per registration
    pub notification_queue_depth: usize,

    /// Default notification wait timeout in milliseconds
    pub notification_timeout_ms: u64,

    /// Owner of every raid group after a dual crash
    pub primary_controller: ControllerId,

    /// Sled directory for checkpoints; in-memory when unset
    pub persistence_path: Option<PathBuf>,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            chunk_size_blocks: DEFAULT_CHUNK_SIZE_BLOCKS,
            progress_interval_percent: 10,
            max_parallel_rebuilds: 2,
            notification_queue_depth: 1,
            notification_timeout_ms: 120_000,
            primary_controller: ControllerId::A,
            persistence_path: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(None),
    }
}

impl RebuildConfig {
    /// Load from a TOML file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Apply `SPRAID_*` environment overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_parse("SPRAID_CHUNK_SIZE_BLOCKS")? {
            self.chunk_size_blocks = v;
        }
        if let Some(v) = env_parse("SPRAID_PROGRESS_INTERVAL")? {
            self.progress_interval_percent = v;
        }
        if let Some(v) = env_parse("SPRAID_MAX_PARALLEL")? {
            self.max_parallel_rebuilds = v;
        }
        if let Some(v) = env_parse("SPRAID_QUEUE_DEPTH")? {
            self.notification_queue_depth = v;
        }
        if let Some(v) = env_parse("SPRAID_NOTIFY_TIMEOUT_MS")? {
            self.notification_timeout_ms = v;
        }
        if let Some(v) = env_parse::<ControllerId>("SPRAID_PRIMARY")? {
            self.primary_controller = v;
        }
        if let Ok(path) = std::env::var("SPRAID_PERSISTENCE_PATH") {
            if !path.is_empty() {
                self.persistence_path = Some(PathBuf::from(path));
            }
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size_blocks == 0 {
            return Err(ConfigError::InvalidValue(
                "chunk_size_blocks".into(),
                "must be non-zero".into(),
            ));
        }
        if self.progress_interval_percent == 0 || self.progress_interval_percent > 100 {
            return Err(ConfigError::InvalidValue(
                "progress_interval_percent".into(),
                format!("{} not in 1..=100", self.progress_interval_percent),
            ));
        }
        if self.max_parallel_rebuilds == 0 {
            return Err(ConfigError::InvalidValue(
                "max_parallel_rebuilds".into(),
                "must be at least 1".into(),
            ));
        }
        if self.notification_queue_depth == 0 {
            return Err(ConfigError::InvalidValue(
                "notification_queue_depth".into(),
                "must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Default notification wait timeout as Duration
    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }
}
