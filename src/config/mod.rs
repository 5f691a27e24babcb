//! Unified configuration for bugdex binaries.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (bugdex.toml)
//! ```toml
//! [store]
//! backend = "rocksdb"
//! data_dir = "/var/lib/bugdex"
//! cache_capacity = 250000
//!
//! [sweep]
//! interval_secs = 600
//! threads = 8
//!
//! [log]
//! filter = "bugdex_rs=debug,info"
//! ```
//!
//! Environment variables use the `BUGDEX_` prefix with `__` between sections,
//! e.g. `BUGDEX_SWEEP__INTERVAL_SECS=60`.

mod defaults;

pub use defaults::*;

use crate::error::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for bugdex components.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BugdexConfig {
    pub store: StoreConfig,
    pub sweep: SweepConfig,
    pub log: LogConfig,
}

impl BugdexConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(BugdexConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("BUGDEX_").split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        Ok(figment.extract()?)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Which store implementation backs the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Process-local tables, lost on exit
    Memory,
    /// RocksDB column families under `data_dir`
    #[default]
    Rocksdb,
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Data directory for the RocksDB backend
    pub data_dir: PathBuf,
    /// Universal records kept in the read cache
    pub cache_capacity: usize,
    /// Run RocksDB repair before opening
    pub repair: bool,
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            backend: StoreBackend::Memory,
            ..Self::default()
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            repair: false,
        }
    }
}

/// Garbage collection sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Worker threads in the sweep pool
    pub threads: usize,
    /// Sweep once immediately instead of waiting a full interval
    pub run_on_start: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            threads: default_sweep_threads(),
            run_on_start: true,
        }
    }
}

/// Logging configuration. `RUST_LOG` wins when set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sweep: Option<SweepOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<StoreBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<usize>,
}
