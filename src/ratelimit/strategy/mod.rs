//! Counting algorithms.
//!
//! Each strategy is a pair of pure functions over [`StoredRecord`]s: a
//! transition (`advance`) that the store runs inside its per-key critical
//! section, and a projection (`status`) that answers check-only calls. The
//! cache-aside orchestration around them lives in [`Strategy::check`].

mod fixed_window;
mod sliding_window;
mod token_bucket;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, trace};

use super::options::ResolvedLimit;
use super::record::StoredRecord;
use super::status::LimitStatus;
use crate::cache::{Cache, CachedRecord};
use crate::store::{IncrementRequest, Store, StoreError, StoreUpdate};

/// The available counting algorithms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Counter per epoch-aligned window
    #[default]
    #[serde(alias = "fixed-window", alias = "fixedWindow")]
    FixedWindow,
    /// Weighted blend of the current and previous aligned windows
    #[serde(alias = "sliding-window", alias = "slidingWindow")]
    SlidingWindow,
    /// Continuously refilling bucket of `max_requests` tokens per window
    #[serde(alias = "token-bucket", alias = "tokenBucket")]
    TokenBucket,
}

/// Error returned when parsing an unknown strategy name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown rate limiting strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl Strategy {
    pub const ALL: [Strategy; 3] = [
        Strategy::FixedWindow,
        Strategy::SlidingWindow,
        Strategy::TokenBucket,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::FixedWindow => "fixed_window",
            Strategy::SlidingWindow => "sliding_window",
            Strategy::TokenBucket => "token_bucket",
        }
    }

    /// The key a record for `key` is stored under.
    ///
    /// Records are namespaced per strategy so a key addressed by two
    /// strategies never shares state.
    pub fn storage_key(&self, key: &str) -> String {
        format!("{}|{}", self.name(), key)
    }

    /// Compute the next record for a write request.
    ///
    /// Pure; stores call this while holding the key's lock.
    pub fn advance(
        &self,
        existing: Option<&StoredRecord>,
        key: &str,
        request: &IncrementRequest,
    ) -> StoreUpdate {
        let existing = existing.filter(|r| r.strategy == *self);
        match self {
            Strategy::FixedWindow => fixed_window::advance(existing, key, request),
            Strategy::SlidingWindow => sliding_window::advance(existing, key, request),
            Strategy::TokenBucket => token_bucket::advance(existing, key, request),
        }
    }

    /// Status for a check-only call: would a call for `limit.amount` units be
    /// admitted right now.
    pub fn status(
        &self,
        record: Option<&StoredRecord>,
        limit: &ResolvedLimit,
        now_ms: u64,
    ) -> LimitStatus {
        let record = record.filter(|r| r.strategy == *self);
        match self {
            Strategy::FixedWindow => fixed_window::status(record, limit, now_ms),
            Strategy::SlidingWindow => sliding_window::status(record, limit, now_ms),
            Strategy::TokenBucket => token_bucket::status(record, limit, now_ms),
        }
    }

    /// Status for a call whose write has been applied.
    pub fn outcome(&self, update: &StoreUpdate, now_ms: u64) -> LimitStatus {
        match self {
            Strategy::FixedWindow => fixed_window::outcome(update, now_ms),
            Strategy::SlidingWindow => sliding_window::outcome(update, now_ms),
            Strategy::TokenBucket => token_bucket::outcome(update, now_ms),
        }
    }

    /// Run one admission check against the two storage tiers.
    ///
    /// `key` is the storage key. Cache errors are treated as misses; store
    /// errors are returned to the caller.
    pub async fn check(
        &self,
        key: &str,
        limit: &ResolvedLimit,
        increment: bool,
        backends: &Backends<'_>,
        now_ms: u64,
    ) -> Result<LimitStatus, StoreError> {
        let cached = backends.cached(key, self, limit, now_ms).await;

        if !increment {
            if let Some(record) = cached {
                trace!(key = %key, "Answering check from cache");
                return Ok(self.status(Some(&record), limit, now_ms));
            }

            let record = backends.store.get(key).await?;
            if let Some(ref record) = record {
                backends.populate(key, record, now_ms).await;
            }
            return Ok(self.status(record.as_ref(), limit, now_ms));
        }

        // A cached record can only undercount the store within its window, so
        // a denial derived from it is safe to return without a store round trip.
        if let Some(record) = cached {
            let status = self.status(Some(&record), limit, now_ms);
            if status.limited {
                debug!(key = %key, strategy = %self, "Denied from cache");
                return Ok(status);
            }
        }

        let update = backends
            .store
            .increment(key, &IncrementRequest::from_limit(limit, now_ms))
            .await?;
        backends.populate(key, &update.record, now_ms).await;

        Ok(self.outcome(&update, now_ms))
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed_window" | "fixed-window" | "fixedWindow" => Ok(Strategy::FixedWindow),
            "sliding_window" | "sliding-window" | "slidingWindow" => Ok(Strategy::SlidingWindow),
            "token_bucket" | "token-bucket" | "tokenBucket" => Ok(Strategy::TokenBucket),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// The storage tiers a check runs against.
#[derive(Clone, Copy)]
pub struct Backends<'a> {
    pub store: &'a dyn Store,
    pub cache: Option<&'a dyn Cache>,
}

impl<'a> Backends<'a> {
    pub fn new(store: &'a dyn Store, cache: Option<&'a dyn Cache>) -> Self {
        Self { store, cache }
    }

    fn available_cache(&self) -> Option<&'a dyn Cache> {
        self.cache.filter(|cache| cache.is_available())
    }

    /// Read a usable cached record: same strategy and policy, not expired.
    async fn cached(
        &self,
        key: &str,
        strategy: &Strategy,
        limit: &ResolvedLimit,
        now_ms: u64,
    ) -> Option<StoredRecord> {
        let cache = self.available_cache()?;
        match cache.get(key).await {
            Ok(Some(cached)) if !cached.is_expired(now_ms) => Some(cached.record)
                .filter(|r| r.matches(*strategy, limit.max_requests, limit.window_ms)),
            Ok(_) => None,
            Err(e) => {
                debug!(
                    key = %key,
                    cache = cache.name(),
                    error = %e,
                    "Cache read failed, treating as miss"
                );
                None
            }
        }
    }

    /// Best-effort write of a store record into the cache.
    async fn populate(&self, key: &str, record: &StoredRecord, now_ms: u64) {
        let Some(cache) = self.available_cache() else {
            return;
        };

        let ttl_ms = record.expires_at.saturating_sub(now_ms);
        if ttl_ms == 0 {
            return;
        }

        let cached = CachedRecord::new(record.clone(), now_ms);
        if let Err(e) = cache.set(key, &cached, ttl_ms).await {
            debug!(key = %key, cache = cache.name(), error = %e, "Cache write failed");
        }
    }
}

/// The time a transition or projection over `record` is evaluated at.
///
/// A request stamped before the record's last write is evaluated at that
/// write instead, so stored windows and refill times never move backwards.
pub(crate) fn clamp_now(record: Option<&StoredRecord>, now_ms: u64) -> u64 {
    record.map_or(now_ms, |r| now_ms.max(r.updated_at))
}

/// Epoch-aligned window containing `now_ms`.
pub(crate) fn aligned_window(now_ms: u64, window_ms: u64) -> (u64, u64) {
    let start = now_ms - now_ms % window_ms;
    (start, start.saturating_add(window_ms))
}
