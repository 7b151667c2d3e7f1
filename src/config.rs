//! Runtime configuration.
//!
//! Values come from an optional TOML file overlaid with `SLOTS_*`
//! environment variables (e.g. `SLOTS_REAPER_INTERVAL_SECS=5`). Business
//! constants such as the reservation TTL are not configurable.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between two reaper cycles.
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
    /// Maximum reservations expired per cycle.
    #[serde(default = "default_reaper_batch_size")]
    pub reaper_batch_size: usize,
    /// Notifications buffered before new ones are dropped.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Where the ledger snapshot is loaded from and saved to.
    #[serde(default)]
    pub state_path: Option<PathBuf>,
}

fn default_reaper_interval() -> u64 {
    10
}

fn default_reaper_batch_size() -> usize {
    100
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_log_filter() -> String {
    "warn".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reaper_interval_secs: default_reaper_interval(),
            reaper_batch_size: default_reaper_batch_size(),
            outbox_capacity: default_outbox_capacity(),
            log_filter: default_log_filter(),
            state_path: None,
        }
    }
}

impl EngineConfig {
    /// Load the configuration from `path` (if any) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config: EngineConfig = builder
            .add_source(Environment::with_prefix("SLOTS").try_parsing(true))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "reaper_interval_secs must be positive".into(),
            ));
        }
        if self.reaper_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "reaper_batch_size must be positive".into(),
            ));
        }
        if self.outbox_capacity == 0 {
            return Err(ConfigError::Invalid("outbox_capacity must be positive".into()));
        }
        Ok(())
    }
}
