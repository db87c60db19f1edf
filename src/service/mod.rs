//! The admission service: the public API for checking and consuming limits.

mod cleanup;

pub use cleanup::CleanupWorker;

use std::sync::Arc;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::cache::{build_cache, Cache};
use crate::config::{FloodgateConfig, StoreKind};
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{
    Backends, Clock, DefaultsUpdate, LimitDefaults, LimitOptions, LimitStatus, PolicyRules,
    ResolvedLimit, Strategy, SystemClock,
};
use crate::store::{MemoryStore, PostgresStore, Store};

/// Decides whether operations for a key may proceed.
///
/// The service holds no per-key state of its own; every decision is derived
/// from the store (and, as an optimization, the cache). It is safe to share
/// across tasks behind an `Arc`, and several independently configured
/// services can live in one process.
pub struct AdmissionService {
    id: Uuid,
    store: Arc<dyn Store>,
    cache: Option<Arc<dyn Cache>>,
    clock: Arc<dyn Clock>,
    defaults: RwLock<LimitDefaults>,
    rules: RwLock<Arc<PolicyRules>>,
}

impl AdmissionService {
    /// Create a service over a store, with no cache and built-in defaults.
    pub fn new(store: Arc<dyn Store>) -> Self {
        let id = Uuid::new_v4();
        info!(service = %id, store = store.name(), "Admission service created");
        Self {
            id,
            store,
            cache: None,
            clock: Arc::new(SystemClock),
            defaults: RwLock::new(LimitDefaults::default()),
            rules: RwLock::new(Arc::new(PolicyRules::default())),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        info!(service = %self.id, cache = cache.name(), "Cache attached");
        self.cache = Some(cache);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_defaults(self, defaults: LimitDefaults) -> Self {
        *self.defaults.write() = defaults.sanitized();
        self
    }

    pub fn with_rules(self, rules: PolicyRules) -> Self {
        self.set_rules(rules);
        self
    }

    /// Build a service from configuration, connecting the configured tiers.
    pub async fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match config.store.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::Postgres => {
                let url = config.store.database_url.as_deref().ok_or_else(|| {
                    FloodgateError::Config("postgres store requires database_url".to_string())
                })?;
                Arc::new(
                    PostgresStore::connect(
                        url,
                        config.store.max_connections,
                        config.store.acquire_timeout(),
                    )
                    .await?,
                )
            }
        };

        let mut service = Self::new(store).with_defaults(config.limits);
        if let Some(cache) = build_cache(&config.cache).await? {
            service = service.with_cache(cache);
        }
        if let Some(ref path) = config.rules_path {
            service = service.with_rules(PolicyRules::from_file(path)?);
        }

        Ok(service)
    }

    /// Identifier attached to this instance's log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Report the status for `key` without consuming anything.
    pub async fn check_limit(&self, key: &str, options: &LimitOptions) -> LimitStatus {
        self.run(key, options, false).await
    }

    /// Consume `options.amount` units for `key` if they are admitted.
    pub async fn increment_limit(&self, key: &str, options: &LimitOptions) -> LimitStatus {
        self.run(key, options, true).await
    }

    pub async fn is_limited(&self, key: &str, options: &LimitOptions) -> bool {
        self.check_limit(key, options).await.limited
    }

    pub async fn get_remaining_requests(&self, key: &str, options: &LimitOptions) -> u64 {
        self.check_limit(key, options).await.remaining
    }

    /// Forget all counting state for `key` under every strategy, in both tiers.
    ///
    /// Returns whether the store held any record. `user_id` identifies who
    /// asked, for the audit log.
    pub async fn clear_limit(&self, key: &str, user_id: Option<&str>) -> Result<bool> {
        let storage_keys: Vec<String> = Strategy::ALL.iter().map(|s| s.storage_key(key)).collect();

        let results = join_all(storage_keys.iter().map(|k| self.store.clear(k))).await;
        let mut existed = false;
        for result in results {
            existed |= result?;
        }

        // Cache entries go after the store so a concurrent read-through cannot
        // repopulate them from a record about to be removed.
        if let Some(ref cache) = self.cache {
            for (k, result) in storage_keys
                .iter()
                .zip(join_all(storage_keys.iter().map(|k| cache.delete(k))).await)
            {
                if let Err(e) = result {
                    debug!(service = %self.id, key = %k, error = %e, "Cache delete failed");
                }
            }
        }

        info!(
            service = %self.id,
            key = %key,
            user_id = user_id.unwrap_or("-"),
            existed,
            "Cleared limit"
        );
        Ok(existed)
    }

    /// Remove expired records from the store.
    pub async fn cleanup(&self) -> Result<u64> {
        let now_ms = self.clock.now_millis();
        let removed = self.store.cleanup(now_ms).await?;
        if removed > 0 {
            info!(service = %self.id, removed, "Cleanup removed expired records");
        } else {
            trace!(service = %self.id, "Cleanup found nothing to remove");
        }
        Ok(removed)
    }

    pub fn get_defaults(&self) -> LimitDefaults {
        *self.defaults.read()
    }

    /// Update the runtime defaults. Invalid values are ignored with a warning.
    pub fn set_defaults(&self, update: &DefaultsUpdate) -> LimitDefaults {
        let mut defaults = self.defaults.write();
        defaults.apply(update);
        info!(
            service = %self.id,
            window_ms = defaults.window_ms,
            max_requests = defaults.max_requests,
            strategy = %defaults.strategy,
            "Defaults updated"
        );
        *defaults
    }

    pub fn rules(&self) -> Arc<PolicyRules> {
        self.rules.read().clone()
    }

    /// Replace the policy rules.
    pub fn set_rules(&self, rules: PolicyRules) {
        info!(service = %self.id, policies = rules.policies.len(), "Policy rules loaded");
        *self.rules.write() = Arc::new(rules);
    }

    /// Release store resources. Idempotent.
    pub async fn shutdown(&self) {
        self.store.shutdown().await;
        info!(service = %self.id, "Admission service shut down");
    }

    /// Resolve the effective limit for a key.
    pub fn resolve(&self, key: &str, options: &LimitOptions) -> ResolvedLimit {
        let defaults = self.get_defaults();
        let rules = self.rules();
        ResolvedLimit::resolve(options, rules.find(key), &defaults)
    }

    async fn run(&self, key: &str, options: &LimitOptions, increment: bool) -> LimitStatus {
        let limit = self.resolve(key, options);
        let now_ms = self.clock.now_millis();
        let storage_key = limit.strategy.storage_key(key);
        let backends = Backends::new(self.store.as_ref(), self.cache.as_deref());

        match limit
            .strategy
            .check(&storage_key, &limit, increment, &backends, now_ms)
            .await
        {
            Ok(status) => {
                trace!(
                    service = %self.id,
                    key = %key,
                    strategy = %limit.strategy,
                    increment,
                    limited = status.limited,
                    remaining = status.remaining,
                    "Admission decision"
                );
                status
            }
            Err(e) => {
                warn!(
                    service = %self.id,
                    key = %key,
                    store = self.store.name(),
                    error = %e,
                    "Store unavailable, failing open"
                );
                LimitStatus::fail_open(limit.max_requests, limit.window_ms, now_ms)
            }
        }
    }
}

impl std::fmt::Debug for AdmissionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("id", &self.id)
            .field("store", &self.store.name())
            .field("cache", &self.cache.as_ref().map(|c| c.name()))
            .field("defaults", &self.get_defaults())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::LocalCache;
    use crate::config::StoreConfig;
    use crate::ratelimit::{ManualClock, StoredRecord};
    use crate::store::{IncrementRequest, StoreError, StoreUpdate};
    use async_trait::async_trait;

    /// A store whose every operation fails.
    #[derive(Debug, Default)]
    pub(crate) struct FailingStore;

    #[async_trait]
    impl Store for FailingStore {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn get(&self, _key: &str) -> std::result::Result<Option<StoredRecord>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn increment(
            &self,
            _key: &str,
            _request: &IncrementRequest,
        ) -> std::result::Result<StoreUpdate, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn clear(&self, _key: &str) -> std::result::Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn cleanup(&self, _now_ms: u64) -> std::result::Result<u64, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }

        async fn shutdown(&self) {}
    }

    pub(crate) fn service_at(now_ms: u64) -> (AdmissionService, ManualClock) {
        let clock = ManualClock::at(now_ms);
        let service = AdmissionService::new(Arc::new(MemoryStore::new()))
            .with_clock(Arc::new(clock.clone()));
        (service, clock)
    }

    fn fixed(max_requests: u64, window_ms: u64) -> LimitOptions {
        LimitOptions::new()
            .with_max_requests(max_requests)
            .with_window_ms(window_ms)
            .with_strategy(Strategy::FixedWindow)
    }

    #[tokio::test]
    async fn test_fixed_window_scenario() {
        let (service, clock) = service_at(0);
        let options = fixed(5, 1_000);

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let status = service.increment_limit("user:1", &options).await;
            assert!(!status.limited);
            remaining.push(status.remaining);
        }
        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);

        let status = service.increment_limit("user:1", &options).await;
        assert!(status.limited);
        assert_eq!(status.retry_after, 1);

        clock.set(1_001);
        let status = service.increment_limit("user:1", &options).await;
        assert!(!status.limited);
        assert_eq!(status.remaining, 4);
    }

    #[tokio::test]
    async fn test_check_does_not_consume() {
        let (service, _clock) = service_at(0);
        let options = fixed(3, 1_000);

        for _ in 0..10 {
            let status = service.check_limit("k", &options).await;
            assert_eq!(status.current, 0);
        }
        assert_eq!(service.get_remaining_requests("k", &options).await, 3);
        assert!(!service.is_limited("k", &options).await);

        for _ in 0..3 {
            service.increment_limit("k", &options).await;
        }
        assert!(service.is_limited("k", &options).await);
        assert_eq!(service.get_remaining_requests("k", &options).await, 0);
    }

    #[tokio::test]
    async fn test_strategies_do_not_share_state() {
        let (service, _clock) = service_at(0);
        for _ in 0..5 {
            service.increment_limit("ip:10.0.0.1", &fixed(5, 60_000)).await;
        }

        let bucket = LimitOptions::new()
            .with_max_requests(5)
            .with_window_ms(60_000)
            .with_strategy(Strategy::TokenBucket);
        let status = service.check_limit("ip:10.0.0.1", &bucket).await;
        assert!(!status.limited);
        assert_eq!(status.remaining, 5);
        assert!(service.is_limited("ip:10.0.0.1", &fixed(5, 60_000)).await);
    }

    #[tokio::test]
    async fn test_fail_open_when_store_errors() {
        let service = AdmissionService::new(Arc::new(FailingStore));

        let status = service.increment_limit("user:1", &fixed(5, 1_000)).await;
        assert!(!status.limited);
        assert_eq!(status.remaining, 5);

        let status = service.check_limit("user:1", &fixed(5, 1_000)).await;
        assert!(!status.limited);

        assert!(service.clear_limit("user:1", None).await.is_err());
        assert!(service.cleanup().await.is_err());
    }

    #[tokio::test]
    async fn test_clear_limit_is_idempotent() {
        let (service, _clock) = service_at(0);
        let options = fixed(5, 60_000);
        for _ in 0..3 {
            service.increment_limit("user:1", &options).await;
        }

        assert!(service.clear_limit("user:1", Some("admin")).await.unwrap());
        assert!(!service.clear_limit("user:1", Some("admin")).await.unwrap());

        let status = service.check_limit("user:1", &options).await;
        assert_eq!(status.current, 0);
        assert_eq!(status.remaining, 5);
    }

    #[tokio::test]
    async fn test_clear_limit_covers_every_strategy_and_the_cache() {
        let (service, _clock) = service_at(0);
        let service = service.with_cache(Arc::new(LocalCache::new(16)));

        for strategy in Strategy::ALL {
            let options = LimitOptions::new()
                .with_max_requests(1)
                .with_window_ms(60_000)
                .with_strategy(strategy);
            service.increment_limit("user:1", &options).await;
            assert!(service.is_limited("user:1", &options).await);
        }

        assert!(service.clear_limit("user:1", None).await.unwrap());

        for strategy in Strategy::ALL {
            let options = LimitOptions::new()
                .with_max_requests(1)
                .with_window_ms(60_000)
                .with_strategy(strategy);
            assert!(!service.is_limited("user:1", &options).await);
        }
    }

    #[tokio::test]
    async fn test_token_bucket_refills_exactly_to_capacity() {
        let (service, clock) = service_at(1_000_000);
        let options = LimitOptions::new()
            .with_max_requests(10)
            .with_window_ms(60_000)
            .with_strategy(Strategy::TokenBucket);

        for _ in 0..10 {
            assert!(!service.increment_limit("user:1", &options).await.limited);
        }
        for _ in 0..5 {
            assert!(service.increment_limit("user:1", &options).await.limited);
        }

        clock.advance(60_000);
        let status = service.check_limit("user:1", &options).await;
        assert!(!status.limited);
        assert_eq!(status.remaining, 10);

        clock.advance(60_000);
        assert_eq!(service.get_remaining_requests("user:1", &options).await, 10);
    }

    /// Two instances over one store, the second one's clock behind.
    fn skewed_pair(fast_ms: u64, slow_ms: u64) -> (AdmissionService, AdmissionService) {
        let store = Arc::new(MemoryStore::new());
        let fast =
            AdmissionService::new(store.clone()).with_clock(Arc::new(ManualClock::at(fast_ms)));
        let slow = AdmissionService::new(store).with_clock(Arc::new(ManualClock::at(slow_ms)));
        (fast, slow)
    }

    #[tokio::test]
    async fn test_skewed_instance_does_not_reset_fixed_window() {
        let (fast, slow) = skewed_pair(2_000, 1_999);
        let options = fixed(5, 1_000);

        let mut admitted = 0;
        for _ in 0..5 {
            admitted += usize::from(!fast.increment_limit("user:1", &options).await.limited);
        }
        assert!(slow.increment_limit("user:1", &options).await.limited);
        for _ in 0..5 {
            admitted += usize::from(!fast.increment_limit("user:1", &options).await.limited);
        }

        assert_eq!(admitted, 5);
        assert_eq!(fast.get_remaining_requests("user:1", &options).await, 0);
    }

    #[tokio::test]
    async fn test_skewed_instance_does_not_mint_tokens() {
        let (fast, slow) = skewed_pair(60_000, 54_000);
        let options = LimitOptions::new()
            .with_max_requests(10)
            .with_window_ms(60_000)
            .with_strategy(Strategy::TokenBucket);

        for _ in 0..10 {
            assert!(!fast.increment_limit("user:1", &options).await.limited);
        }

        let mut admitted = 0;
        for _ in 0..20 {
            admitted += usize::from(!slow.increment_limit("user:1", &options).await.limited);
            admitted += usize::from(!fast.increment_limit("user:1", &options).await.limited);
        }
        assert_eq!(admitted, 0);
    }

    #[tokio::test]
    async fn test_boundary_burst_fixed_versus_sliding() {
        let (service, clock) = service_at(59_999);
        let sliding = LimitOptions::new()
            .with_max_requests(100)
            .with_window_ms(60_000)
            .with_strategy(Strategy::SlidingWindow);
        let fixed = fixed(100, 60_000);

        let mut fixed_admitted = 0;
        let mut sliding_admitted = 0;
        for _ in 0..150 {
            if !service.increment_limit("fixed", &fixed).await.limited {
                fixed_admitted += 1;
            }
            if !service.increment_limit("sliding", &sliding).await.limited {
                sliding_admitted += 1;
            }
        }

        clock.set(60_000);
        for _ in 0..150 {
            if !service.increment_limit("fixed", &fixed).await.limited {
                fixed_admitted += 1;
            }
            if !service.increment_limit("sliding", &sliding).await.limited {
                sliding_admitted += 1;
            }
        }

        // Two milliseconds apart.
        assert_eq!(fixed_admitted, 200);
        assert_eq!(sliding_admitted, 100);
    }

    #[tokio::test]
    async fn test_amount_is_all_or_nothing() {
        let (service, _clock) = service_at(0);
        let options = fixed(5, 1_000).with_amount(3);

        let status = service.increment_limit("k", &options).await;
        assert_eq!(status.current, 3);
        assert_eq!(status.remaining, 2);

        let status = service.increment_limit("k", &options).await;
        assert!(status.limited);
        assert_eq!(status.current, 3);

        let status = service.increment_limit("k", &fixed(5, 1_000).with_amount(2)).await;
        assert!(!status.limited);
        assert_eq!(status.remaining, 0);
    }

    #[tokio::test]
    async fn test_zero_amount_counts_as_one() {
        let (service, _clock) = service_at(0);
        let status = service.increment_limit("k", &fixed(5, 1_000).with_amount(0)).await;
        assert_eq!(status.current, 1);
    }

    #[tokio::test]
    async fn test_cached_denial_skips_the_store() {
        let store = Arc::new(MemoryStore::new());
        let service = AdmissionService::new(store.clone())
            .with_clock(Arc::new(ManualClock::at(0)))
            .with_cache(Arc::new(LocalCache::new(16)));
        let options = fixed(2, 60_000);

        service.increment_limit("k", &options).await;
        service.increment_limit("k", &options).await;

        // With the store gone, only the cache can produce a denial.
        store.shutdown().await;
        assert!(service.increment_limit("k", &options).await.limited);
        assert!(service.is_limited("k", &options).await);

        // Keys with no cached state fail open.
        assert!(!service.increment_limit("other", &options).await.limited);
    }

    #[tokio::test]
    async fn test_check_reads_through_and_populates_cache() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(LocalCache::new(16));
        let service = AdmissionService::new(store.clone())
            .with_clock(Arc::new(ManualClock::at(0)))
            .with_cache(cache.clone());
        let options = fixed(5, 60_000);

        service.increment_limit("k", &options).await;
        cache.clear();
        assert!(cache.is_empty());

        let status = service.check_limit("k", &options).await;
        assert_eq!(status.current, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_counted_exactly() {
        let (service, _clock) = service_at(0);
        let service = Arc::new(service);
        let options = fixed(1_000, 60_000);

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let service = service.clone();
                let options = options.clone();
                tokio::spawn(async move { service.increment_limit("hot", &options).await })
            })
            .collect();
        for result in join_all(tasks).await {
            assert!(!result.unwrap().limited);
        }

        assert_eq!(service.check_limit("hot", &options).await.current, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_never_exceed_limit() {
        let (service, _clock) = service_at(0);
        let service = Arc::new(service);
        let options = LimitOptions::new()
            .with_max_requests(50)
            .with_window_ms(60_000)
            .with_strategy(Strategy::SlidingWindow);

        let tasks: Vec<_> = (0..120)
            .map(|_| {
                let service = service.clone();
                let options = options.clone();
                tokio::spawn(async move { service.increment_limit("hot", &options).await })
            })
            .collect();

        let admitted = join_all(tasks)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(status) if !status.limited))
            .count();
        assert_eq!(admitted, 50);
    }

    #[tokio::test]
    async fn test_defaults_apply_and_ignore_invalid_values() {
        let (service, _clock) = service_at(0);
        let defaults = service.set_defaults(&DefaultsUpdate {
            window_ms: Some(1_000),
            max_requests: Some(0),
            strategy: Some("leaky_bucket".to_string()),
        });
        assert_eq!(defaults.window_ms, 1_000);
        assert_eq!(defaults.max_requests, 100);
        assert_eq!(defaults.strategy, Strategy::FixedWindow);

        service.set_defaults(&DefaultsUpdate {
            max_requests: Some(2),
            strategy: Some("token_bucket".to_string()),
            ..Default::default()
        });
        let limit = service.resolve("k", &LimitOptions::new());
        assert_eq!(limit.strategy, Strategy::TokenBucket);
        assert_eq!(limit.max_requests, 2);
        assert_eq!(limit.window_ms, 1_000);
    }

    #[tokio::test]
    async fn test_rules_sit_between_options_and_defaults() {
        let rules = PolicyRules::from_yaml(
            r#"
- key: tenant
  value: acme
  rate_limit:
    max_requests: 2
    unit: second
  policies:
    - key: user
      rate_limit:
        max_requests: 1
        strategy: token_bucket
"#,
        )
        .unwrap();
        let (service, _clock) = service_at(0);
        let service = service.with_rules(rules);

        let limit = service.resolve("tenant:acme", &LimitOptions::new());
        assert_eq!((limit.max_requests, limit.window_ms), (2, 1_000));
        assert_eq!(limit.strategy, Strategy::FixedWindow);

        let limit = service.resolve("tenant:acme:user:7", &LimitOptions::new());
        assert_eq!(limit.max_requests, 1);
        assert_eq!(limit.strategy, Strategy::TokenBucket);

        let limit = service.resolve("tenant:acme", &LimitOptions::new().with_max_requests(9));
        assert_eq!(limit.max_requests, 9);

        let limit = service.resolve("tenant:other", &LimitOptions::new());
        assert_eq!(limit.max_requests, 100);
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_windows() {
        let (service, clock) = service_at(0);
        service.increment_limit("a", &fixed(5, 1_000)).await;
        service.increment_limit("b", &fixed(5, 10_000)).await;

        clock.set(1_000);
        assert_eq!(service.cleanup().await.unwrap(), 1);
        assert_eq!(service.cleanup().await.unwrap(), 0);
        assert_eq!(service.check_limit("b", &fixed(5, 10_000)).await.current, 1);
    }

    #[tokio::test]
    async fn test_shutdown_then_fail_open() {
        let (service, _clock) = service_at(0);
        service.shutdown().await;
        service.shutdown().await;
        assert!(!service.increment_limit("k", &fixed(1, 1_000)).await.limited);
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = FloodgateConfig::default();
        config.cache.kind = crate::cache::CacheKind::None;
        config.limits.max_requests = 3;
        let service = AdmissionService::from_config(&config).await.unwrap();
        assert_eq!(service.get_defaults().max_requests, 3);

        config.store = StoreConfig {
            kind: StoreKind::Postgres,
            database_url: None,
            ..StoreConfig::default()
        };
        assert!(matches!(
            AdmissionService::from_config(&config).await,
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_instances_have_distinct_ids() {
        let a = AdmissionService::new(Arc::new(MemoryStore::new()));
        let b = AdmissionService::new(Arc::new(MemoryStore::new()));
        assert_ne!(a.id(), b.id());
    }
}
