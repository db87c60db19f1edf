//! Fast cache tier.
//!
//! The cache shadows recently touched store records to save a store round
//! trip. It is never the system of record: every error is a miss, and
//! admission decisions stay correct with no cache at all.

mod local;
mod shared;

pub use local::LocalCache;
pub use shared::RedisCache;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::CacheConfig;
use crate::ratelimit::StoredRecord;

/// Errors raised by cache backends. Callers treat all of them as misses.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache unavailable: {0}")]
    Unavailable(String),
}

/// A possibly stale projection of a [`StoredRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub record: StoredRecord,
    pub cached_at: u64,
    pub expires_at: u64,
}

impl CachedRecord {
    pub fn new(record: StoredRecord, now_ms: u64) -> Self {
        let expires_at = record.expires_at;
        Self {
            record,
            cached_at: now_ms,
            expires_at,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at <= now_ms
    }
}

/// The fast cache contract.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CachedRecord>, CacheError>;

    async fn set(&self, key: &str, value: &CachedRecord, ttl_ms: u64) -> Result<(), CacheError>;

    /// Add to the cached count; `None` if the key is not cached.
    async fn increment(&self, key: &str, amount: u64) -> Result<Option<u64>, CacheError>;

    /// Remove a key; returns whether it was cached.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Whether operations are currently worth attempting.
    fn is_available(&self) -> bool;
}

/// Which cache tier to run with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Shared Redis accelerator
    Shared,
    /// In-process LRU
    Local,
    /// Shared when reachable, local otherwise
    #[default]
    Auto,
    /// No cache; every check goes to the store
    None,
}

/// Build the configured cache tier.
pub async fn build_cache(config: &CacheConfig) -> Result<Option<Arc<dyn Cache>>, CacheError> {
    match config.kind {
        CacheKind::None => {
            info!("Cache disabled");
            Ok(None)
        }
        CacheKind::Local => Ok(Some(Arc::new(LocalCache::new(config.local_capacity)))),
        CacheKind::Shared => {
            let url = config.redis_url.as_deref().ok_or_else(|| {
                CacheError::Unavailable("shared cache requires redis_url".to_string())
            })?;
            let cache = RedisCache::connect(url, &config.key_prefix).await?;
            if !cache.is_available() {
                warn!("Shared cache unreachable at startup, using the store until it recovers");
            }
            Ok(Some(Arc::new(cache)))
        }
        CacheKind::Auto => {
            if let Some(url) = config.redis_url.as_deref() {
                match RedisCache::connect(url, &config.key_prefix).await {
                    Ok(cache) if cache.is_available() => {
                        info!("Using shared cache");
                        return Ok(Some(Arc::new(cache)));
                    }
                    Ok(_) => warn!("Shared cache unreachable"),
                    Err(e) => warn!(error = %e, "Shared cache misconfigured"),
                }
                warn!("Falling back to local cache; cross-instance cache synchronization is lost");
            } else {
                info!("No redis_url configured, using local cache");
            }
            Ok(Some(Arc::new(LocalCache::new(config.local_capacity))))
        }
    }
}
