//! Crash-durable store on PostgreSQL.
//!
//! Each increment runs in one transaction that first takes a
//! transaction-scoped advisory lock on the key, so concurrent writers for the
//! same key (including the first insert) serialize inside the database.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};

use super::{IncrementRequest, Store, StoreError, StoreUpdate};
use crate::ratelimit::{Scope, Strategy, StoredRecord};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS floodgate_records (
    key TEXT PRIMARY KEY,
    strategy TEXT NOT NULL,
    count BIGINT NOT NULL,
    previous_count BIGINT NOT NULL DEFAULT 0,
    max_requests BIGINT NOT NULL,
    window_ms BIGINT NOT NULL,
    window_start BIGINT NOT NULL,
    window_end BIGINT NOT NULL,
    expires_at BIGINT NOT NULL,
    tokens_remaining DOUBLE PRECISION,
    last_refill BIGINT,
    user_id TEXT,
    tenant_id TEXT,
    ip_address TEXT,
    updated_at BIGINT NOT NULL
)
"#;

const CREATE_EXPIRY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS floodgate_records_expires_at_idx
    ON floodgate_records (expires_at)
"#;

const SELECT_RECORD: &str = r#"
SELECT key, strategy, count, previous_count, max_requests, window_ms,
       window_start, window_end, expires_at, tokens_remaining, last_refill,
       user_id, tenant_id, ip_address, updated_at
FROM floodgate_records
WHERE key = $1
"#;

const SELECT_RECORD_FOR_UPDATE: &str = r#"
SELECT key, strategy, count, previous_count, max_requests, window_ms,
       window_start, window_end, expires_at, tokens_remaining, last_refill,
       user_id, tenant_id, ip_address, updated_at
FROM floodgate_records
WHERE key = $1
FOR UPDATE
"#;

const UPSERT_RECORD: &str = r#"
INSERT INTO floodgate_records (
    key, strategy, count, previous_count, max_requests, window_ms,
    window_start, window_end, expires_at, tokens_remaining, last_refill,
    user_id, tenant_id, ip_address, updated_at
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
ON CONFLICT (key) DO UPDATE SET
    strategy = EXCLUDED.strategy,
    count = EXCLUDED.count,
    previous_count = EXCLUDED.previous_count,
    max_requests = EXCLUDED.max_requests,
    window_ms = EXCLUDED.window_ms,
    window_start = EXCLUDED.window_start,
    window_end = EXCLUDED.window_end,
    expires_at = EXCLUDED.expires_at,
    tokens_remaining = EXCLUDED.tokens_remaining,
    last_refill = EXCLUDED.last_refill,
    user_id = EXCLUDED.user_id,
    tenant_id = EXCLUDED.tenant_id,
    ip_address = EXCLUDED.ip_address,
    updated_at = EXCLUDED.updated_at
"#;

/// Row shape of `floodgate_records`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct RecordRow {
    key: String,
    strategy: String,
    count: i64,
    previous_count: i64,
    max_requests: i64,
    window_ms: i64,
    window_start: i64,
    window_end: i64,
    expires_at: i64,
    tokens_remaining: Option<f64>,
    last_refill: Option<i64>,
    user_id: Option<String>,
    tenant_id: Option<String>,
    ip_address: Option<String>,
    updated_at: i64,
}

fn to_u64(key: &str, field: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("negative {}: {}", field, value),
    })
}

fn to_i64(key: &str, field: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("{} out of range: {}", field, value),
    })
}

impl RecordRow {
    fn into_record(self) -> Result<StoredRecord, StoreError> {
        let key = self.key;
        let strategy = self.strategy.parse::<Strategy>().map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: format!("{}", e),
        })?;
        let last_refill = self
            .last_refill
            .map(|v| to_u64(&key, "last_refill", v))
            .transpose()?;

        Ok(StoredRecord {
            strategy,
            count: to_u64(&key, "count", self.count)?,
            previous_count: to_u64(&key, "previous_count", self.previous_count)?,
            max_requests: to_u64(&key, "max_requests", self.max_requests)?,
            window_ms: to_u64(&key, "window_ms", self.window_ms)?,
            window_start: to_u64(&key, "window_start", self.window_start)?,
            window_end: to_u64(&key, "window_end", self.window_end)?,
            expires_at: to_u64(&key, "expires_at", self.expires_at)?,
            tokens_remaining: self.tokens_remaining,
            last_refill,
            scope: Scope {
                user_id: self.user_id,
                tenant_id: self.tenant_id,
                ip_address: self.ip_address,
            },
            updated_at: to_u64(&key, "updated_at", self.updated_at)?,
            key,
        })
    }

    fn from_record(record: &StoredRecord) -> Result<Self, StoreError> {
        let key = record.key.as_str();
        Ok(Self {
            key: record.key.clone(),
            strategy: record.strategy.name().to_string(),
            count: to_i64(key, "count", record.count)?,
            previous_count: to_i64(key, "previous_count", record.previous_count)?,
            max_requests: to_i64(key, "max_requests", record.max_requests)?,
            window_ms: to_i64(key, "window_ms", record.window_ms)?,
            window_start: to_i64(key, "window_start", record.window_start)?,
            window_end: to_i64(key, "window_end", record.window_end)?,
            expires_at: to_i64(key, "expires_at", record.expires_at)?,
            tokens_remaining: record.tokens_remaining,
            last_refill: record
                .last_refill
                .map(|v| to_i64(key, "last_refill", v))
                .transpose()?,
            user_id: record.scope.user_id.clone(),
            tenant_id: record.scope.tenant_id.clone(),
            ip_address: record.scope.ip_address.clone(),
            updated_at: to_i64(key, "updated_at", record.updated_at)?,
        })
    }
}

/// A store persisting records in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database and ensure the schema exists.
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;

        info!(max_connections, "Connected to PostgreSQL store");
        Ok(store)
    }

    /// Wrap an existing pool. The schema is not created.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the records table and its expiry index if missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_EXPIRY_INDEX).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn get(&self, key: &str) -> Result<Option<StoredRecord>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(SELECT_RECORD)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RecordRow::into_record).transpose()
    }

    async fn increment(
        &self,
        key: &str,
        request: &IncrementRequest,
    ) -> Result<StoreUpdate, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query_as::<_, RecordRow>(SELECT_RECORD_FOR_UPDATE)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await?
            .map(RecordRow::into_record)
            .transpose()?;

        let update = request.strategy.advance(existing.as_ref(), key, request);
        let row = RecordRow::from_record(&update.record)?;

        sqlx::query(UPSERT_RECORD)
            .bind(&row.key)
            .bind(&row.strategy)
            .bind(row.count)
            .bind(row.previous_count)
            .bind(row.max_requests)
            .bind(row.window_ms)
            .bind(row.window_start)
            .bind(row.window_end)
            .bind(row.expires_at)
            .bind(row.tokens_remaining)
            .bind(row.last_refill)
            .bind(&row.user_id)
            .bind(&row.tenant_id)
            .bind(&row.ip_address)
            .bind(row.updated_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            key = %key,
            count = update.record.count,
            admitted = update.admitted,
            "Applied increment"
        );

        Ok(update)
    }

    async fn clear(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM floodgate_records WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup(&self, now_ms: u64) -> Result<u64, StoreError> {
        // Rows locked by an in-flight increment are re-evaluated after it
        // commits, so a refreshed window is never deleted.
        let now = to_i64("*", "now_ms", now_ms)?;
        let result = sqlx::query("DELETE FROM floodgate_records WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn shutdown(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("PostgreSQL store shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_record() -> StoredRecord {
        StoredRecord {
            key: "token_bucket|user:42".to_string(),
            strategy: Strategy::TokenBucket,
            count: 3,
            previous_count: 0,
            max_requests: 10,
            window_ms: 60_000,
            window_start: 1_700_000_000_000,
            window_end: 1_700_000_018_000,
            expires_at: 1_700_000_018_000,
            tokens_remaining: Some(7.25),
            last_refill: Some(1_700_000_000_000),
            scope: Scope::user("42").with_tenant("acme"),
            updated_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_row_mapping_preserves_record() {
        let record = token_record();
        let row = RecordRow::from_record(&record).unwrap();
        assert_eq!(row.strategy, "token_bucket");
        assert_eq!(row.ip_address, None);
        assert_eq!(row.into_record().unwrap(), record);
    }

    #[test]
    fn test_negative_column_is_corrupt() {
        let mut row = RecordRow::from_record(&token_record()).unwrap();
        row.count = -1;
        assert!(matches!(
            row.into_record(),
            Err(StoreError::Corrupt { ref reason, .. }) if reason.contains("count")
        ));
    }

    #[test]
    fn test_unknown_strategy_is_corrupt() {
        let mut row = RecordRow::from_record(&token_record()).unwrap();
        row.strategy = "leaky_bucket".to_string();
        assert!(matches!(row.into_record(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_out_of_range_value_is_rejected() {
        let mut record = token_record();
        record.count = u64::MAX;
        assert!(RecordRow::from_record(&record).is_err());
    }
}
