use async_trait::async_trait;
use delivery_guard::{
    cache::{build_key, CacheService, WarmupFuture, WarmupLoader, KEY_PREFIX_COURIER},
    config::{CacheSettings, RateLimitSettings},
    error::{Error, StoreResult},
    limiter::AdmissionService,
    metrics::Metrics,
    store::{
        AtomicScript, KeyTtl, MemoryStore, RedisStore, RedisStoreConfig, StoreBackend, StoreClient,
    },
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tokio_test::{assert_err, assert_ok};

fn rate_limit(limit: u64) -> RateLimitSettings {
    RateLimitSettings {
        enabled: true,
        default_requests_per_window: limit,
        vip_requests_per_window: limit * 10,
        ban_duration_secs: 300,
        window_secs: 60,
    }
}

fn client_for(backend: Arc<dyn StoreBackend>) -> StoreClient {
    StoreClient::new(
        backend,
        Duration::from_secs(1),
        Arc::new(Metrics::new().unwrap()),
    )
}

fn memory_admission(limit: u64) -> (AdmissionService, StoreClient, Arc<MemoryStore>) {
    let backend = Arc::new(MemoryStore::new());
    let client = client_for(backend.clone());
    let service = AdmissionService::new(
        client.clone(),
        rate_limit(limit),
        Arc::new(Metrics::new().unwrap()),
    );
    (service, client, backend)
}

#[tokio::test(start_paused = true)]
async fn test_quota_exhaustion_bans_identity() {
    let (service, _, _) = memory_admission(5);

    for expected_remaining in [4, 3, 2, 1, 0] {
        let decision = service.check_limit("10.0.0.1", false).await;
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, expected_remaining);
        assert!(decision.reset_at.is_some());
        assert!(decision.banned_until.is_none());
    }

    let rejected = service.check_limit("10.0.0.1", false).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.remaining, 0);
    assert_eq!(rejected.retry_after, 300);
    assert!(rejected.banned_until.is_some());

    let status = service.get_status("10.0.0.1", false).await.unwrap();
    assert!(!status.allowed);
    assert_eq!(status.retry_after, 300);
    assert!(status.banned_until.is_some());

    // Other identities keep their own quota
    let other = service.check_limit("10.0.0.2", false).await;
    assert!(other.allowed);
    assert_eq!(other.remaining, 4);
}

#[tokio::test(start_paused = true)]
async fn test_ban_takes_precedence_and_freezes_counter() {
    let (service, client, _) = memory_admission(5);
    let counter_key = AdmissionService::counter_key("10.0.0.3");

    for _ in 0..6 {
        service.check_limit("10.0.0.3", false).await;
    }
    assert_eq!(client.get::<u64>(&counter_key).await.unwrap(), 5);

    let mut last_retry_after = u64::MAX;
    for _ in 0..3 {
        tokio::time::advance(Duration::from_secs(10)).await;
        let decision = service.check_limit("10.0.0.3", false).await;
        assert!(!decision.allowed);
        assert!(decision.retry_after <= last_retry_after);
        last_retry_after = decision.retry_after;
    }
    assert_eq!(last_retry_after, 270);
    assert_eq!(client.get::<u64>(&counter_key).await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_ban_outlives_window_then_expires() {
    let (service, _, _) = memory_admission(2);

    for _ in 0..3 {
        service.check_limit("10.0.0.4", false).await;
    }

    // Window is over but the ban still holds
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(!service.check_limit("10.0.0.4", false).await.allowed);

    tokio::time::advance(Duration::from_secs(240)).await;
    let decision = service.check_limit("10.0.0.4", false).await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 1);
}

#[tokio::test(start_paused = true)]
async fn test_window_expiry_restores_quota() {
    let (service, _, _) = memory_admission(5);

    for _ in 0..3 {
        service.check_limit("10.0.0.5", false).await;
    }
    assert_eq!(service.get_status("10.0.0.5", false).await.unwrap().remaining, 2);

    tokio::time::advance(Duration::from_secs(61)).await;

    let status = service.get_status("10.0.0.5", false).await.unwrap();
    assert_eq!(status.remaining, 5);
    assert!(status.reset_at.is_none());

    let decision = service.check_limit("10.0.0.5", false).await;
    assert_eq!(decision.remaining, 4);
}

#[tokio::test]
async fn test_status_does_not_create_keys() {
    let (service, client, _) = memory_admission(5);

    for _ in 0..3 {
        let status = service.get_status("10.0.0.6", false).await.unwrap();
        assert!(status.allowed);
        assert_eq!(status.remaining, 5);
    }

    assert!(!client
        .exists(&AdmissionService::counter_key("10.0.0.6"))
        .await
        .unwrap());
    assert!(!client
        .exists(&AdmissionService::ban_key("10.0.0.6"))
        .await
        .unwrap());
    assert_eq!(client.key_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_vip_identity_gets_larger_quota() {
    let (service, _, _) = memory_admission(2);

    for _ in 0..2 {
        service.check_limit("vip-client", true).await;
    }
    let decision = service.check_limit("vip-client", true).await;
    assert!(decision.allowed);
    assert_eq!(decision.limit, 20);
    assert_eq!(decision.remaining, 17);
}

#[tokio::test]
async fn test_unavailable_store_admits_requests() {
    let (service, _, backend) = memory_admission(1);
    backend.set_unavailable(true);

    for _ in 0..5 {
        let decision = service.check_limit("10.0.0.7", false).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert!(decision.banned_until.is_none());
    }

    assert_err!(service.get_status("10.0.0.7", false).await);
    assert_err!(service.reset("10.0.0.7").await);

    backend.set_unavailable(false);
    assert!(service.check_limit("10.0.0.7", false).await.allowed);
}

#[tokio::test]
async fn test_reset_lifts_ban() {
    let (service, client, _) = memory_admission(1);

    service.check_limit("10.0.0.8", false).await;
    assert!(!service.check_limit("10.0.0.8", false).await.allowed);

    assert_ok!(service.reset("10.0.0.8").await);
    assert_eq!(client.key_count().await.unwrap(), 0);

    let decision = service.check_limit("10.0.0.8", false).await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 0);

    // Resetting an unknown identity is fine
    service.reset("never-seen").await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_checks_never_exceed_limit() {
    let (service, client, _) = memory_admission(10);
    let service = Arc::new(service);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.check_limit("10.0.0.9", false).await })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().allowed {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 10);
    let counter: u64 = client
        .get(&AdmissionService::counter_key("10.0.0.9"))
        .await
        .unwrap();
    assert_eq!(counter, 10);
}

/// Backend whose calls never complete, like a store that accepted the
/// connection and then stopped answering
struct StalledStore;

#[async_trait]
impl StoreBackend for StalledStore {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        std::future::pending().await
    }

    async fn set(&self, _key: &str, _value: String, _ttl: Option<Duration>) -> StoreResult<()> {
        std::future::pending().await
    }

    async fn set_multiple(
        &self,
        _entries: Vec<(String, String)>,
        _ttl: Option<Duration>,
    ) -> StoreResult<()> {
        std::future::pending().await
    }

    async fn delete(&self, _keys: &[String]) -> StoreResult<u64> {
        std::future::pending().await
    }

    async fn exists(&self, _key: &str) -> StoreResult<bool> {
        std::future::pending().await
    }

    async fn multi_get(&self, _keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        std::future::pending().await
    }

    async fn ttl(&self, _key: &str) -> StoreResult<KeyTtl> {
        std::future::pending().await
    }

    async fn key_count(&self) -> StoreResult<u64> {
        std::future::pending().await
    }

    async fn execute_atomic(
        &self,
        _script: &AtomicScript,
        _keys: &[String],
        _args: &[String],
    ) -> StoreResult<redis::Value> {
        std::future::pending().await
    }

    async fn health_check(&self) -> StoreResult<()> {
        std::future::pending().await
    }
}

fn stalled_client() -> StoreClient {
    StoreClient::new(
        Arc::new(StalledStore),
        Duration::from_millis(200),
        Arc::new(Metrics::new().unwrap()),
    )
}

#[tokio::test(start_paused = true)]
async fn test_stalled_store_times_out_and_admission_fails_open() {
    let client = stalled_client();
    let service = AdmissionService::new(
        client.clone(),
        rate_limit(100),
        Arc::new(Metrics::new().unwrap()),
    );

    for _ in 0..3 {
        let decision = service.check_limit("10.0.0.10", false).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 100);
        assert_eq!(decision.limit, 100);
    }

    let err = client.health_check().await.unwrap_err();
    assert!(err.is_unavailable());
    match service.get_status("10.0.0.10", false).await {
        Err(Error::Store(e)) => assert!(e.is_unavailable()),
        other => panic!("expected a store timeout, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_store_surfaces_cache_error() {
    let cache = CacheService::new(
        stalled_client(),
        CacheSettings::default(),
        Arc::new(Metrics::new().unwrap()),
    );

    match cache.get::<String>("order:1").await {
        Err(Error::Store(e)) => assert!(e.is_unavailable()),
        other => panic!("expected a store timeout, got {:?}", other),
    }
    assert_err!(cache.set_default("order:1", &"x").await);

    let metrics = cache.metrics().await;
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.cache_size, 0);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Courier {
    id: u32,
    name: String,
    active: bool,
}

fn memory_cache(enabled: bool) -> (CacheService, Arc<MemoryStore>) {
    let backend = Arc::new(MemoryStore::new());
    let settings = CacheSettings {
        enabled,
        ..Default::default()
    };
    let cache = CacheService::new(
        client_for(backend.clone()),
        settings,
        Arc::new(Metrics::new().unwrap()),
    );
    (cache, backend)
}

#[tokio::test]
async fn test_cache_hit_rate_accounting() {
    let (cache, _) = memory_cache(true);
    let key = build_key(KEY_PREFIX_COURIER, "17");
    let courier = Courier {
        id: 17,
        name: "Ana".to_string(),
        active: true,
    };

    assert_eq!(cache.get::<Courier>(&key).await.unwrap(), None);
    cache.set_default(&key, &courier).await.unwrap();
    for _ in 0..3 {
        assert_eq!(cache.get::<Courier>(&key).await.unwrap(), Some(courier.clone()));
    }

    let metrics = cache.metrics().await;
    assert_eq!(metrics.hits, 3);
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.total_requests, 4);
    assert!((metrics.hit_rate - 75.0).abs() < f64::EPSILON);
    assert_eq!(metrics.cache_size, 1);
}

#[tokio::test]
async fn test_cache_invalidation_counts_evictions() {
    let (cache, _) = memory_cache(true);
    let key = build_key(KEY_PREFIX_COURIER, "1");
    cache.set_default(&key, &"cached").await.unwrap();

    cache
        .delete(&[key.clone(), build_key(KEY_PREFIX_COURIER, "missing")])
        .await
        .unwrap();
    assert_eq!(cache.get::<String>(&key).await.unwrap(), None);

    let metrics = cache.metrics().await;
    assert_eq!(metrics.evictions, 2);
    assert_eq!(metrics.cache_size, 0);
}

#[tokio::test]
async fn test_disabled_cache_is_inert() {
    let (cache, backend) = memory_cache(false);
    let key = build_key(KEY_PREFIX_COURIER, "2");

    for _ in 0..2 {
        cache.set_default(&key, &"value").await.unwrap();
        assert_eq!(cache.get::<String>(&key).await.unwrap(), None);
        cache.delete(&[key.clone()]).await.unwrap();
    }

    let report = cache.warmup(BTreeMap::new()).await;
    assert_eq!(report.attempted, 0);

    let metrics = cache.metrics().await;
    assert_eq!(metrics.hits, 0);
    assert_eq!(metrics.misses, 2);
    assert_eq!(metrics.evictions, 0);
    assert_eq!(assert_ok!(backend.key_count().await), 0);
}

#[tokio::test]
async fn test_cache_errors_count_as_misses() {
    let (cache, backend) = memory_cache(true);
    backend.set_unavailable(true);

    assert_err!(cache.get::<String>("order:1").await);
    assert_err!(cache.set_default("order:1", &"x").await);

    let metrics = cache.metrics().await;
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.cache_size, 0);
}

#[tokio::test]
async fn test_warmup_skips_failing_loaders() {
    let (cache, _) = memory_cache(true);

    let mut loaders: BTreeMap<String, WarmupLoader> = BTreeMap::new();
    loaders.insert(
        "stats:daily".to_string(),
        Box::new(|| -> WarmupFuture { Box::pin(async { anyhow::Ok(serde_json::json!({"orders": 42})) }) }),
    );
    loaders.insert(
        "stats:weekly".to_string(),
        Box::new(|| -> WarmupFuture { Box::pin(async {
            Err::<serde_json::Value, _>(anyhow::anyhow!("database offline"))
        }) }),
    );

    let report = cache.warmup(loaders).await;
    assert_eq!(report.attempted, 2);
    assert_eq!(report.succeeded, 1);

    let daily: serde_json::Value = cache.get("stats:daily").await.unwrap().unwrap();
    assert_eq!(daily["orders"], 42);
    assert_eq!(cache.get::<serde_json::Value>("stats:weekly").await.unwrap(), None);
}

// These tests require a running Redis instance (REDIS_URL, default
// redis://localhost:6379). Run them with `cargo test -- --ignored`.

async fn redis_client() -> StoreClient {
    let config = RedisStoreConfig {
        url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
        ..Default::default()
    };
    let store = RedisStore::connect(&config).await.unwrap();
    client_for(Arc::new(store))
}

#[tokio::test]
#[ignore]
async fn test_redis_admission_scenario() {
    let client = redis_client().await;
    let service = AdmissionService::new(
        client.clone(),
        rate_limit(3),
        Arc::new(Metrics::new().unwrap()),
    );
    let identity = format!("it-{}", std::process::id());
    service.reset(&identity).await.unwrap();

    for expected_remaining in [2, 1, 0] {
        let decision = service.check_limit(&identity, false).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, expected_remaining);
    }

    let rejected = service.check_limit(&identity, false).await;
    assert!(!rejected.allowed);
    assert_eq!(rejected.retry_after, 300);

    let counter: u64 = client
        .get(&AdmissionService::counter_key(&identity))
        .await
        .unwrap();
    assert_eq!(counter, 3);

    service.reset(&identity).await.unwrap();
    assert!(service.check_limit(&identity, false).await.allowed);
    service.reset(&identity).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_redis_cache_round_trip() {
    let client = redis_client().await;
    let cache = CacheService::new(
        client,
        CacheSettings::default(),
        Arc::new(Metrics::new().unwrap()),
    );
    let key = build_key(KEY_PREFIX_COURIER, &format!("it-{}", std::process::id()));
    let courier = Courier {
        id: 3,
        name: "Rui".to_string(),
        active: false,
    };

    cache.set(&key, &courier, Duration::from_secs(30)).await.unwrap();
    assert_eq!(cache.get::<Courier>(&key).await.unwrap(), Some(courier));
    cache.delete(&[key.clone()]).await.unwrap();
    assert_eq!(cache.get::<Courier>(&key).await.unwrap(), None);
}
