//! Shared accelerator on Redis.
//!
//! Each key is a hash holding the JSON-encoded [`CachedRecord`] and a
//! separately incrementable `count` field. The hash expires with the record.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info, warn};

use super::{Cache, CacheError, CachedRecord};

const FIELD_RECORD: &str = "record";
const FIELD_COUNT: &str = "count";

/// How long to stop trying the server after a failure.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const INCREMENT_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return redis.call('HINCRBY', KEYS[1], 'count', ARGV[1])
end
return false
"#;

/// A cache shared by every instance pointing at the same Redis server.
pub struct RedisCache {
    client: Client,
    prefix: String,
    connection: Mutex<Option<MultiplexedConnection>>,
    failed_at: Mutex<Option<Instant>>,
    increment_script: Script,
}

impl RedisCache {
    /// Open a client for `url` and probe it once.
    ///
    /// An invalid URL is an error. An unreachable server is not: the cache
    /// starts out unavailable and is retried after [`RETRY_INTERVAL`].
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let cache = Self {
            client,
            prefix: prefix.to_string(),
            connection: Mutex::new(None),
            failed_at: Mutex::new(None),
            increment_script: Script::new(INCREMENT_SCRIPT),
        };

        match cache.ping().await {
            Ok(()) => info!(prefix = %cache.prefix, "Connected to shared cache"),
            Err(e) => warn!(error = %e, "Shared cache ping failed"),
        }

        Ok(cache)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let result = async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, CacheError>(())
        }
        .await;
        self.track(result)
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    async fn connection(&self) -> Result<MultiplexedConnection, CacheError> {
        let existing = self.connection.lock().clone();
        if let Some(conn) = existing {
            return Ok(conn);
        }

        let conn = tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| CacheError::Unavailable("connection timed out".to_string()))??;

        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// Record the outcome of an operation for availability tracking.
    fn track<T>(&self, result: Result<T, CacheError>) -> Result<T, CacheError> {
        match &result {
            Ok(_) => {
                if self.failed_at.lock().take().is_some() {
                    info!("Shared cache recovered");
                }
            }
            Err(CacheError::Serialization(_)) => {}
            Err(e) => {
                debug!(error = %e, "Shared cache operation failed");
                *self.failed_at.lock() = Some(Instant::now());
                *self.connection.lock() = None;
            }
        }
        result
    }
}

fn decode(fields: HashMap<String, String>) -> Result<Option<CachedRecord>, CacheError> {
    let Some(payload) = fields.get(FIELD_RECORD) else {
        return Ok(None);
    };
    let mut cached: CachedRecord = serde_json::from_str(payload)?;
    if let Some(count) = fields.get(FIELD_COUNT).and_then(|c| c.parse::<u64>().ok()) {
        cached.record.count = count;
    }
    Ok(Some(cached))
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("prefix", &self.prefix)
            .field("available", &self.is_available())
            .finish()
    }
}

#[async_trait]
impl Cache for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedRecord>, CacheError> {
        let key = self.namespaced(key);
        let result = async {
            let mut conn = self.connection().await?;
            let fields: HashMap<String, String> = conn.hgetall(&key).await?;
            decode(fields)
        }
        .await;
        self.track(result)
    }

    async fn set(&self, key: &str, value: &CachedRecord, ttl_ms: u64) -> Result<(), CacheError> {
        let key = self.namespaced(key);
        let payload = serde_json::to_string(value)?;
        let count = value.record.count.to_string();
        let ttl = i64::try_from(ttl_ms).unwrap_or(i64::MAX);

        let result = async {
            let mut conn = self.connection().await?;
            let _: () = redis::pipe()
                .atomic()
                .del(&key)
                .ignore()
                .hset_multiple(
                    &key,
                    &[(FIELD_RECORD, payload.as_str()), (FIELD_COUNT, count.as_str())],
                )
                .ignore()
                .pexpire(&key, ttl)
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok::<_, CacheError>(())
        }
        .await;
        self.track(result)
    }

    async fn increment(&self, key: &str, amount: u64) -> Result<Option<u64>, CacheError> {
        let key = self.namespaced(key);
        let result = async {
            let mut conn = self.connection().await?;
            let count: Option<i64> = self
                .increment_script
                .key(&key)
                .arg(amount)
                .invoke_async(&mut conn)
                .await?;
            Ok::<_, CacheError>(count.map(|c| u64::try_from(c).unwrap_or(0)))
        }
        .await;
        self.track(result)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let key = self.namespaced(key);
        let result = async {
            let mut conn = self.connection().await?;
            let removed: u64 = conn.del(&key).await?;
            Ok::<_, CacheError>(removed > 0)
        }
        .await;
        self.track(result)
    }

    fn is_available(&self) -> bool {
        match *self.failed_at.lock() {
            Some(at) => at.elapsed() >= RETRY_INTERVAL,
            None => true,
        }
    }
}
