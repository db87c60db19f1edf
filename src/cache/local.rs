//! In-process LRU cache.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use super::{Cache, CacheError, CachedRecord};

struct Entry {
    value: CachedRecord,
    deadline: Instant,
}

/// A bounded cache that evicts the least recently touched key when full.
///
/// Entries past their TTL are dropped lazily on read. Local to one process,
/// so instances sharing a store do not see each other's cached state.
pub struct LocalCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl LocalCache {
    /// Create a cache holding at most `capacity` keys (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[async_trait]
impl Cache for LocalCache {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedRecord>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if entry.deadline > Instant::now() => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &CachedRecord, ttl_ms: u64) -> Result<(), CacheError> {
        let entry = Entry {
            value: value.clone(),
            deadline: Instant::now() + Duration::from_millis(ttl_ms),
        };
        self.entries.lock().put(key.to_string(), entry);
        Ok(())
    }

    async fn increment(&self, key: &str, amount: u64) -> Result<Option<u64>, CacheError> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        match entries.get_mut(key) {
            Some(entry) if entry.deadline > now => {
                entry.value.record.count = entry.value.record.count.saturating_add(amount);
                Ok(Some(entry.value.record.count))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().pop(key).is_some())
    }

    fn is_available(&self) -> bool {
        true
    }
}
