//! Handle and database configuration.
//!
//! Defaults come from `Default`; `from_env` overlays `JOBSDB_*` variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobsdb_core::TablePrefix;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("missing required setting {0}")]
    Missing(&'static str),
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    ReadOnly,
    #[default]
    ReadWrite,
}

impl Mode {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "read_only" => Ok(Mode::ReadOnly),
            "read_write" => Ok(Mode::ReadWrite),
            other => Err(ConfigError::invalid("JOBSDB_MODE", format!("unknown mode '{other}'"))),
        }
    }
}

/// Filters `get_unprocessed` may use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryFilters {
    pub custom_val: bool,
    /// Parameter keys allowed in parameter filters.
    pub parameters: Vec<String>,
}

impl Default for QueryFilters {
    fn default() -> Self {
        Self {
            custom_val: true,
            parameters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    pub mode: Mode,
    pub table_prefix: String,
    /// Job count at which the tail dataset is considered full.
    pub max_ds_size: u64,
    pub max_ds_retention_secs: Option<u64>,
    pub enable_writer_queue: bool,
    pub writer_workers: usize,
    pub writer_queue_capacity: usize,
    pub store_timeout_ms: u64,
    pub migration_enabled: bool,
    pub query_filters: QueryFilters,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            mode: Mode::ReadWrite,
            table_prefix: "jobs".to_string(),
            max_ds_size: 100_000,
            max_ds_retention_secs: None,
            enable_writer_queue: false,
            writer_workers: 4,
            writer_queue_capacity: 1024,
            store_timeout_ms: 30_000,
            migration_enabled: false,
            query_filters: QueryFilters::default(),
        }
    }
}

impl HandleConfig {
    /// Defaults overlaid with process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(raw) = lookup("JOBSDB_MODE") {
            config.mode = Mode::parse(&raw)?;
        }
        if let Some(raw) = lookup("JOBSDB_TABLE_PREFIX") {
            config.table_prefix = raw;
        }
        if let Some(raw) = lookup("JOBSDB_MAX_DS_SIZE") {
            config.max_ds_size = parse_number("JOBSDB_MAX_DS_SIZE", &raw)?;
        }
        if let Some(raw) = lookup("JOBSDB_MAX_DS_RETENTION_SECS") {
            config.max_ds_retention_secs = Some(parse_number("JOBSDB_MAX_DS_RETENTION_SECS", &raw)?);
        }
        if let Some(raw) = lookup("JOBSDB_ENABLE_WRITER_QUEUE") {
            config.enable_writer_queue = parse_flag("JOBSDB_ENABLE_WRITER_QUEUE", &raw)?;
        }
        if let Some(raw) = lookup("JOBSDB_WRITER_WORKERS") {
            config.writer_workers = parse_number("JOBSDB_WRITER_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("JOBSDB_WRITER_QUEUE_CAPACITY") {
            config.writer_queue_capacity = parse_number("JOBSDB_WRITER_QUEUE_CAPACITY", &raw)?;
        }
        if let Some(raw) = lookup("JOBSDB_STORE_TIMEOUT_MS") {
            config.store_timeout_ms = parse_number("JOBSDB_STORE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = lookup("JOBSDB_MIGRATION_ENABLED") {
            config.migration_enabled = parse_flag("JOBSDB_MIGRATION_ENABLED", &raw)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.prefix()?;
        if self.max_ds_size == 0 {
            return Err(ConfigError::invalid("max_ds_size", "must be greater than zero"));
        }
        if self.store_timeout_ms == 0 {
            return Err(ConfigError::invalid("store_timeout_ms", "must be greater than zero"));
        }
        if self.enable_writer_queue {
            if self.writer_workers == 0 {
                return Err(ConfigError::invalid("writer_workers", "must be greater than zero"));
            }
            if self.writer_queue_capacity == 0 {
                return Err(ConfigError::invalid("writer_queue_capacity", "must be greater than zero"));
            }
        }
        Ok(())
    }

    pub fn prefix(&self) -> Result<TablePrefix, ConfigError> {
        TablePrefix::parse(&self.table_prefix).map_err(|e| ConfigError::invalid("table_prefix", e.to_string()))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn retention(&self) -> Option<Duration> {
        self.max_ds_retention_secs.map(Duration::from_secs)
    }
}

/// Connection settings for [`crate::store::PostgresBackingStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout_ms: 5_000,
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let mut config = Self::new(url);
        if let Some(raw) = lookup("JOBSDB_DB_MAX_CONNECTIONS") {
            config.max_connections = parse_number("JOBSDB_DB_MAX_CONNECTIONS", &raw)?;
        }
        if let Some(raw) = lookup("JOBSDB_DB_ACQUIRE_TIMEOUT_MS") {
            config.acquire_timeout_ms = parse_number("JOBSDB_DB_ACQUIRE_TIMEOUT_MS", &raw)?;
        }
        if config.max_connections == 0 {
            return Err(ConfigError::invalid("JOBSDB_DB_MAX_CONNECTIONS", "must be greater than zero"));
        }
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| ConfigError::invalid(key, format!("'{raw}' is not a valid number")))
}

fn parse_flag(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" => Ok(true),
        "0" | "false" | "FALSE" | "no" => Ok(false),
        other => Err(ConfigError::invalid(key, format!("'{other}' is not a boolean"))),
    }
}
