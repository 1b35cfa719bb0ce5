//! Shared key-value store access.
//!
//! [`StoreBackend`] is the raw contract a backend implements (Redis in
//! production, an in-process keyspace for tests and local runs).
//! [`StoreClient`] wraps a backend with JSON (de)serialization, a per-call
//! timeout and operation metrics. It keeps no copy of remote state.

use async_trait::async_trait;
use redis::Value;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    config::{StoreBackendKind, StoreSettings},
    error::{StoreError, StoreResult},
    metrics::Metrics,
};

pub mod memory;
pub mod redis_store;

pub use memory::{Keyspace, MemoryStore};
pub use redis_store::{RedisStore, RedisStoreConfig};

/// Remaining lifetime of a key, following Redis `TTL` semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// The key does not exist
    Missing,
    /// The key exists without an expiry
    Persistent,
    Expires(Duration),
}

impl KeyTtl {
    /// Interpret a Redis `TTL` reply (-2 missing, -1 no expiry)
    pub fn from_redis_secs(secs: i64) -> Self {
        match secs {
            -2 => KeyTtl::Missing,
            s if s < 0 => KeyTtl::Persistent,
            s => KeyTtl::Expires(Duration::from_secs(s as u64)),
        }
    }

    /// The Redis `TTL` reply for this state. Sub-second remainders round to
    /// the nearest second.
    pub fn as_redis_secs(&self) -> i64 {
        match self {
            KeyTtl::Missing => -2,
            KeyTtl::Persistent => -1,
            KeyTtl::Expires(d) => ((d.as_millis() + 500) / 1000) as i64,
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// Native counterpart of a Lua script, run by in-process backends while
/// holding the keyspace lock.
pub type NativeScript = fn(&mut Keyspace, &[String], &[String]) -> StoreResult<Value>;

/// A server-side script executed atomically by the store
pub struct AtomicScript {
    name: &'static str,
    script: redis::Script,
    native: NativeScript,
}

impl AtomicScript {
    pub fn new(name: &'static str, source: &'static str, native: NativeScript) -> Self {
        Self {
            name,
            script: redis::Script::new(source),
            native,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// SHA1 of the Lua source, as used by `EVALSHA`
    pub fn hash(&self) -> &str {
        self.script.get_hash()
    }

    pub fn lua(&self) -> &redis::Script {
        &self.script
    }

    pub fn run_native(
        &self,
        keyspace: &mut Keyspace,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Value> {
        (self.native)(keyspace, keys, args)
    }
}

impl std::fmt::Debug for AtomicScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicScript")
            .field("name", &self.name)
            .field("hash", &self.hash())
            .finish()
    }
}

/// Raw operations a store backend must provide. Values are UTF-8 strings;
/// `ttl` of `None` means the key does not expire.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Backend name used in logs
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    /// Store several values in one round trip
    async fn set_multiple(
        &self,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    /// Delete keys in one round trip, returning how many existed
    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Fetch several keys; the result is positionally aligned with `keys`
    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>>;

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl>;

    /// Approximate number of keys held by the store
    async fn key_count(&self) -> StoreResult<u64>;

    /// Run a script atomically against the store
    async fn execute_atomic(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Value>;

    async fn health_check(&self) -> StoreResult<()>;
}

/// Typed, time-bounded access to a [`StoreBackend`]
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn StoreBackend>,
    command_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl StoreClient {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        command_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            command_timeout,
            metrics,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    /// Bound a backend call by the command timeout and record its outcome
    async fn call<T, F>(&self, operation: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.command_timeout)),
        };

        let label = match &result {
            Ok(_) => "ok",
            Err(StoreError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        self.metrics.record_store_operation(operation, label);
        self.metrics
            .record_store_operation_duration(operation, start.elapsed().as_secs_f64());

        if let Err(e) = &result {
            tracing::debug!(operation, backend = self.backend.name(), error = %e, "store call failed");
        }
        result
    }

    /// Fetch and decode a value. Absence is [`StoreError::NotFound`]; a value
    /// that does not decode into `T` is [`StoreError::Decode`].
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<T> {
        let raw = self
            .call("get", self.backend.get(key))
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        let value = serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
            key: key.to_string(),
            source,
        })?;
        tracing::trace!(key, "value retrieved from store");
        Ok(value)
    }

    /// Encode and store a value. A zero TTL is treated as no expiry.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let raw = encode(key, value)?;
        self.call("set", self.backend.set(key, raw, normalize_ttl(ttl)))
            .await?;
        tracing::trace!(key, "value set in store");
        Ok(())
    }

    /// Store several values in one pipelined round trip
    pub async fn set_multiple<T: Serialize>(
        &self,
        entries: &[(String, T)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let encoded = entries
            .iter()
            .map(|(key, value)| Ok((key.clone(), encode(key, value)?)))
            .collect::<StoreResult<Vec<_>>>()?;

        self.call("set_multiple", self.backend.set_multiple(encoded, normalize_ttl(ttl)))
            .await?;
        tracing::trace!(count = entries.len(), "multiple values set in store");
        Ok(())
    }

    /// Delete keys; absent keys are not an error
    pub async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.call("delete", self.backend.delete(keys)).await
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.call("exists", self.backend.exists(key)).await
    }

    /// Fetch several keys. Keys without a value are absent from the map.
    pub async fn multi_get<T: DeserializeOwned>(
        &self,
        keys: &[String],
    ) -> StoreResult<HashMap<String, T>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let values = self.call("multi_get", self.backend.multi_get(keys)).await?;

        let mut result = HashMap::with_capacity(values.len());
        for (key, raw) in keys.iter().zip(values) {
            if let Some(raw) = raw {
                let value = serde_json::from_str(&raw).map_err(|source| StoreError::Decode {
                    key: key.clone(),
                    source,
                })?;
                result.insert(key.clone(), value);
            }
        }
        Ok(result)
    }

    pub async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        self.call("ttl", self.backend.ttl(key)).await
    }

    pub async fn key_count(&self) -> StoreResult<u64> {
        self.call("key_count", self.backend.key_count()).await
    }

    pub async fn execute_atomic(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Value> {
        self.call("execute_atomic", self.backend.execute_atomic(script, keys, args))
            .await
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        self.call("ping", self.backend.health_check()).await
    }
}

/// Open the backend selected by `settings`
pub async fn connect(settings: &StoreSettings) -> StoreResult<Arc<dyn StoreBackend>> {
    match settings.backend {
        StoreBackendKind::Redis => {
            let store = RedisStore::connect(&RedisStoreConfig::from(settings)).await?;
            Ok(Arc::new(store))
        }
        StoreBackendKind::Memory => {
            tracing::warn!(
                "using the in-process store; limits and cache are not shared between instances"
            );
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode {
        key: key.to_string(),
        source,
    })
}

fn normalize_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u32,
        status: String,
    }

    fn client(store: Arc<MemoryStore>) -> StoreClient {
        StoreClient::new(store, Duration::from_secs(1), Arc::new(Metrics::new().unwrap()))
    }

    #[test]
    fn test_key_ttl_redis_mapping() {
        assert_eq!(KeyTtl::from_redis_secs(-2), KeyTtl::Missing);
        assert_eq!(KeyTtl::from_redis_secs(-1), KeyTtl::Persistent);
        assert_eq!(
            KeyTtl::from_redis_secs(42),
            KeyTtl::Expires(Duration::from_secs(42))
        );
        assert_eq!(KeyTtl::Expires(Duration::from_millis(59_600)).as_redis_secs(), 60);
        assert_eq!(KeyTtl::Missing.remaining(), None);
    }

    #[test]
    fn test_atomic_script_identity() {
        fn noop(_: &mut Keyspace, _: &[String], _: &[String]) -> StoreResult<Value> {
            Ok(Value::Nil)
        }
        let script = AtomicScript::new("noop", "return nil", noop);
        assert_eq!(script.name(), "noop");
        assert_eq!(script.hash(), redis::Script::new("return nil").get_hash());

        let store = client(Arc::new(MemoryStore::new()));
        assert_eq!(store.command_timeout(), Duration::from_secs(1));
        assert_eq!(store.backend_name(), "memory");
    }

    #[tokio::test]
    async fn test_connect_memory_backend() {
        let settings = StoreSettings {
            backend: StoreBackendKind::Memory,
            ..Default::default()
        };
        let backend = connect(&settings).await.unwrap();
        assert_eq!(backend.name(), "memory");
        backend.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = client(Arc::new(MemoryStore::new()));
        let err = store.get::<Order>("order:404").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_set_then_get_typed() {
        let store = client(Arc::new(MemoryStore::new()));
        let order = Order {
            id: 7,
            status: "created".to_string(),
        };
        store.set("order:7", &order, Some(Duration::from_secs(60))).await.unwrap();

        let fetched: Order = store.get("order:7").await.unwrap();
        assert_eq!(fetched, order);
        assert!(store.exists("order:7").await.unwrap());
    }

    #[tokio::test]
    async fn test_decode_failure_is_not_a_miss() {
        let store = client(Arc::new(MemoryStore::new()));
        store.set("order:1", "not an order", None).await.unwrap();

        let err = store.get::<Order>("order:1").await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
        assert!(!err.is_not_found());
    }

    #[tokio::test]
    async fn test_multi_get_returns_partial_map() {
        let store = client(Arc::new(MemoryStore::new()));
        let entries = vec![
            ("courier:1".to_string(), 10u32),
            ("courier:2".to_string(), 20u32),
        ];
        store.set_multiple(&entries, None).await.unwrap();

        let keys = vec![
            "courier:1".to_string(),
            "courier:2".to_string(),
            "courier:3".to_string(),
        ];
        let found: HashMap<String, u32> = store.multi_get(&keys).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found["courier:2"], 20);
        assert!(!found.contains_key("courier:3"));

        let empty: HashMap<String, u32> = store.multi_get(&[]).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_delete_absent_keys_is_ok() {
        let store = client(Arc::new(MemoryStore::new()));
        store.set("stats:daily", &1, None).await.unwrap();

        let removed = store
            .delete(&["stats:daily".to_string(), "stats:weekly".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.delete(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_distinct_from_not_found() {
        let backend = Arc::new(MemoryStore::new());
        let store = client(backend.clone());
        backend.set_unavailable(true);

        let err = store.get::<Order>("order:1").await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(!err.is_not_found());
        assert!(store.health_check().await.is_err());
    }
}
