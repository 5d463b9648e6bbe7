//! Configuration System
//!
//! Layered configuration: compiled defaults, an optional config file, then
//! `MEDIAVAULT_*` environment variables, each layer overriding the last.

use crate::error::DatabaseError;
use crate::logging::LoggingConfig;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tunables for a database instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Shards per collection, fixed when a collection is created.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,

    /// Entries per sort index page.
    #[serde(default = "default_sort_page_capacity")]
    pub sort_page_capacity: usize,

    /// Persist the hash cache after this many processed files during bulk
    /// operations, bounding rework after an interrupted run.
    #[serde(default = "default_cache_save_interval")]
    pub cache_save_interval: usize,

    /// Hashing worker count; 0 means derive from available parallelism.
    #[serde(default)]
    pub hash_workers: usize,

    /// Directory for locally cached state when the database lives on remote
    /// storage. `None` keeps caches next to the metadata.
    #[serde(default)]
    pub local_cache_dir: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_shard_count() -> u32 {
    100
}

fn default_sort_page_capacity() -> usize {
    100
}

fn default_cache_save_interval() -> usize {
    100
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            sort_page_capacity: default_sort_page_capacity(),
            cache_save_interval: default_cache_save_interval(),
            hash_workers: 0,
            local_cache_dir: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Load configuration: defaults, then `config_file` if given, then
    /// `MEDIAVAULT_*` environment variables (`MEDIAVAULT_SHARD_COUNT`,
    /// `MEDIAVAULT_LOGGING__LEVEL`, ...).
    pub fn load(config_file: Option<&Path>) -> Result<DatabaseConfig, DatabaseError> {
        let mut builder = Config::builder()
            .set_default("shard_count", default_shard_count() as i64)?
            .set_default("sort_page_capacity", default_sort_page_capacity() as i64)?
            .set_default("cache_save_interval", default_cache_save_interval() as i64)?
            .set_default("hash_workers", 0i64)?;

        if let Some(path) = config_file {
            let path = path.to_str().ok_or_else(|| {
                DatabaseError::ConfigError(format!("non-UTF-8 config path: {:?}", path))
            })?;
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(Environment::with_prefix("MEDIAVAULT").separator("__"));

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Resolved hashing worker count.
    pub fn effective_hash_workers(&self) -> usize {
        if self.hash_workers > 0 {
            return self.hash_workers;
        }
        std::thread::available_parallelism()
            .map(|n| (n.get() / 2).max(1))
            .unwrap_or(1)
    }

    /// Validate invariant-bearing fields before use.
    pub fn validate(&self) -> Result<(), DatabaseError> {
        if self.shard_count == 0 {
            return Err(DatabaseError::ConfigError(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if self.sort_page_capacity < 2 {
            return Err(DatabaseError::ConfigError(
                "sort_page_capacity must be at least 2".to_string(),
            ));
        }
        if self.cache_save_interval == 0 {
            return Err(DatabaseError::ConfigError(
                "cache_save_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
