//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::cache::CacheKind;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::LimitDefaults;

/// Environment variable prefix for [`FloodgateConfig::load`].
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Default policy for checks that leave options unset
    #[serde(default)]
    pub limits: LimitDefaults,

    /// Fast cache tier
    #[serde(default)]
    pub cache: CacheConfig,

    /// Durable store tier
    #[serde(default)]
    pub store: StoreConfig,

    /// Background sweep of expired records
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Path to policy rules file
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(rename = "type", default)]
    pub kind: CacheKind,

    /// Redis URL for the shared cache
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for shared cache keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Maximum keys held by the local cache
    #[serde(default = "default_local_capacity")]
    pub local_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: CacheKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            local_capacity: default_local_capacity(),
        }
    }
}

fn default_key_prefix() -> String {
    "floodgate".to_string()
}

fn default_local_capacity() -> usize {
    10000
}

/// Which store backend to run with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    Postgres,
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(rename = "type", default)]
    pub kind: StoreKind,

    /// PostgreSQL connection URL
    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Time to wait for a pooled connection in milliseconds
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            database_url: None,
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout(),
        }
    }
}

impl StoreConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout() -> u64 {
    2000
}

/// Cleanup configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Sweep interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_cleanup_interval(),
        }
    }
}

impl CleanupConfig {
    /// The sweep interval, at least one second.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

fn default_cleanup_interval() -> u64 {
    60
}

impl FloodgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FloodgateConfig = serde_yaml::from_str(&contents)
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        Ok(config.sanitized())
    }

    /// Load configuration from an optional file layered under environment
    /// variables such as `FLOODGATE__STORE__DATABASE_URL`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration");
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: FloodgateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| FloodgateError::Config(e.to_string()))?;
        Ok(config.sanitized())
    }

    fn sanitized(mut self) -> Self {
        self.limits = self.limits.sanitized();
        self
    }
}
