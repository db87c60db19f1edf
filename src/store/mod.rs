//! Durable store contract and backends.
//!
//! The store is the system of record for counting state. `increment` is the
//! only write path and must be atomic per key: the backend applies the
//! strategy's transition to the current record inside a per-key critical
//! section, so concurrent increments for one key never lose updates.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::{ResolvedLimit, Scope, Strategy, StoredRecord};

/// Errors surfaced by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt record for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// A request to consume units for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementRequest {
    pub strategy: Strategy,
    pub max_requests: u64,
    pub window_ms: u64,
    pub amount: u64,
    pub now_ms: u64,
    pub scope: Scope,
}

impl IncrementRequest {
    pub fn from_limit(limit: &ResolvedLimit, now_ms: u64) -> Self {
        Self {
            strategy: limit.strategy,
            max_requests: limit.max_requests,
            window_ms: limit.window_ms,
            amount: limit.amount,
            now_ms,
            scope: limit.scope.clone(),
        }
    }
}

/// The record after a write, and whether the requested units were admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreUpdate {
    pub record: StoredRecord,
    pub admitted: bool,
}

/// Authoritative storage for counting records.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Read the latest committed record for a key.
    async fn get(&self, key: &str) -> Result<Option<StoredRecord>, StoreError>;

    /// Atomically apply `request.strategy`'s transition to the key's record.
    async fn increment(
        &self,
        key: &str,
        request: &IncrementRequest,
    ) -> Result<StoreUpdate, StoreError>;

    /// Delete a record; returns whether one existed.
    async fn clear(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete records whose `expires_at` is at or before `now_ms`.
    ///
    /// Must not remove a record concurrently being written for a live window.
    async fn cleanup(&self, now_ms: u64) -> Result<u64, StoreError>;

    /// Release resources. Idempotent.
    async fn shutdown(&self);
}
