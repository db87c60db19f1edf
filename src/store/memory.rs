//! In-process store backed by a sharded concurrent map.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use super::{IncrementRequest, Store, StoreError, StoreUpdate};
use crate::ratelimit::StoredRecord;

/// A store that keeps records in memory.
///
/// Per-key atomicity comes from the map's entry API, which holds the shard
/// lock for the whole read-modify-write. Not crash-durable; suitable for a
/// single instance or as the authoritative store in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<String, StoredRecord>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("memory store is shut down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        self.ensure_open()?;
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn increment(
        &self,
        key: &str,
        request: &IncrementRequest,
    ) -> Result<StoreUpdate, StoreError> {
        self.ensure_open()?;

        let update = match self.records.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let update = request.strategy.advance(Some(entry.get()), key, request);
                entry.insert(update.record.clone());
                update
            }
            Entry::Vacant(entry) => {
                let update = request.strategy.advance(None, key, request);
                entry.insert(update.record.clone());
                update
            }
        };

        debug!(
            key = %key,
            count = update.record.count,
            admitted = update.admitted,
            "Applied increment"
        );

        Ok(update)
    }

    async fn clear(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        Ok(self.records.remove(key).is_some())
    }

    async fn cleanup(&self, now_ms: u64) -> Result<u64, StoreError> {
        self.ensure_open()?;

        let mut removed = 0u64;
        // retain holds each shard's write lock, so no increment is mid-flight
        // for a record while it is being evaluated.
        self.records.retain(|_, record| {
            let keep = !record.is_expired(now_ms);
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, "Removed expired records");
        }
        Ok(removed)
    }

    async fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(records = self.records.len(), "Memory store shut down");
            self.records.clear();
        }
    }
}
