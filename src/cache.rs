use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{error, info};

use crate::{
    config::CacheSettings,
    error::{Result, StoreError},
    metrics::Metrics,
    store::StoreClient,
};

/// Well-known key prefixes
pub const KEY_PREFIX_ORDER: &str = "order";
pub const KEY_PREFIX_COURIER: &str = "courier";
pub const KEY_PREFIX_STATS: &str = "stats";

/// `{prefix}:{id}`
pub fn build_key(prefix: &str, id: &str) -> String {
    format!("{}:{}", prefix, id)
}

/// `{prefix}:list:{filter}:{filter}...`
pub fn build_list_key(prefix: &str, filters: &[&str]) -> String {
    let mut key = format!("{}:list", prefix);
    for filter in filters {
        key.push(':');
        key.push_str(filter);
    }
    key
}

/// Snapshot of cache accounting for this process
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_requests: u64,
    /// Percentage of lookups served from the cache
    pub hit_rate: f64,
    /// Approximate number of keys in the shared store
    pub cache_size: u64,
}

/// Outcome of a warmup run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub attempted: usize,
    pub succeeded: usize,
}

pub type WarmupFuture = Pin<Box<dyn Future<Output = anyhow::Result<serde_json::Value>> + Send>>;

/// Produces the value for one warmup key, usually from the relational store
pub type WarmupLoader = Box<dyn FnOnce() -> WarmupFuture + Send>;

/// Read-through cache over the shared store.
///
/// Hit, miss and eviction counters are local to this instance and reset on
/// restart; in a multi-instance deployment they approximate the real cache
/// behaviour.
pub struct CacheService {
    store: StoreClient,
    settings: CacheSettings,
    metrics: Arc<Metrics>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl CacheService {
    pub fn new(store: StoreClient, settings: CacheSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            settings,
            metrics,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.default_ttl_secs)
    }

    pub fn hot_data_ttl(&self) -> Duration {
        Duration::from_secs(self.settings.hot_data_ttl_secs)
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache_request("miss");
    }

    /// Look up `key`. `Ok(None)` is a miss (absent, expired or caching
    /// disabled). Any other store failure, including a value that does not
    /// decode into `T`, counts as a miss and is returned so the caller can
    /// fall back to the source of truth.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        if !self.settings.enabled {
            self.record_miss();
            return Ok(None);
        }

        match self.store.get(key).await {
            Ok(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_cache_request("hit");
                Ok(Some(value))
            }
            Err(StoreError::NotFound(_)) => {
                self.record_miss();
                Ok(None)
            }
            Err(e) => {
                self.record_miss();
                self.metrics.record_cache_request("error");
                error!(key, error = %e, "Failed to get from cache");
                Err(e.into())
            }
        }
    }

    /// Store `value` under `key`. Cache writes are best effort: callers may
    /// ignore the error.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        if !self.settings.enabled {
            return Ok(());
        }

        self.store.set(key, value, Some(ttl)).await.map_err(|e| {
            error!(key, error = %e, "Failed to set cache");
            e.into()
        })
    }

    /// [`CacheService::set`] with the default TTL
    pub async fn set_default<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.set(key, value, self.default_ttl()).await
    }

    /// Invalidate keys. Evictions count invalidation attempts, whether or not
    /// the keys existed.
    pub async fn delete(&self, keys: &[String]) -> Result<()> {
        if !self.settings.enabled || keys.is_empty() {
            return Ok(());
        }

        self.store.delete(keys).await.map_err(|e| {
            error!(?keys, error = %e, "Failed to delete from cache");
            e
        })?;

        self.evictions.fetch_add(keys.len() as u64, Ordering::Relaxed);
        self.metrics.record_cache_evictions(keys.len() as u64);
        Ok(())
    }

    /// Current counters plus the live key count. Never fails; the key count
    /// falls back to 0 when the store cannot be queried.
    pub async fn metrics(&self) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let evictions = self.evictions.load(Ordering::Relaxed);
        let total_requests = hits + misses;

        let hit_rate = if total_requests > 0 {
            hits as f64 / total_requests as f64 * 100.0
        } else {
            0.0
        };

        let cache_size = match self.store.key_count().await {
            Ok(size) => size,
            Err(e) => {
                error!(error = %e, "Failed to get cache size");
                0
            }
        };

        CacheMetrics {
            hits,
            misses,
            evictions,
            total_requests,
            hit_rate,
            cache_size,
        }
    }

    /// Pre-populate the cache with the hot-data TTL. A failing loader or
    /// write skips that key; the run itself never fails.
    pub async fn warmup(&self, loaders: BTreeMap<String, WarmupLoader>) -> WarmupReport {
        if !self.settings.enabled {
            info!("Cache warming skipped (cache disabled)");
            return WarmupReport::default();
        }

        info!(entries = loaders.len(), "Starting cache warming");
        let mut report = WarmupReport::default();
        let ttl = self.hot_data_ttl();

        for (key, loader) in loaders {
            report.attempted += 1;

            let value = match loader().await {
                Ok(value) => value,
                Err(e) => {
                    error!(key = %key, error = %e, "Failed to fetch data for cache warming");
                    self.metrics.record_warmup_entry("load_failed");
                    continue;
                }
            };

            if self.set(&key, &value, ttl).await.is_err() {
                self.metrics.record_warmup_entry("store_failed");
                continue;
            }

            self.metrics.record_warmup_entry("ok");
            report.succeeded += 1;
        }

        info!(
            success = report.succeeded,
            total = report.attempted,
            "Cache warming completed"
        );
        report
    }
}
