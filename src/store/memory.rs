use async_trait::async_trait;
use redis::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::time::Instant;

use super::{AtomicScript, KeyTtl, StoreBackend};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Key space with Redis-like expiry semantics. Expired keys are purged
/// lazily on access.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    pub fn get(&mut self, key: &str) -> Option<String> {
        self.live(key).map(|e| e.value.clone())
    }

    /// Set a value, replacing any previous expiry
    pub fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries.insert(key.to_string(), Entry { value, expires_at });
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let existed = self.exists(key);
        self.entries.remove(key);
        existed
    }

    /// Set an expiry on an existing key
    pub fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    /// Increment an integer value, creating it at 0 first. Keeps the
    /// existing expiry.
    pub fn incr(&mut self, key: &str) -> StoreResult<i64> {
        match self.live(key) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| {
                    StoreError::unavailable(format!(
                        "value at {} is not an integer or out of range",
                        key
                    ))
                })?;
                let next = current + 1;
                entry.value = next.to_string();
                Ok(next)
            }
            None => {
                self.set(key, "1".to_string(), None);
                Ok(1)
            }
        }
    }

    pub fn ttl(&mut self, key: &str) -> KeyTtl {
        let now = Instant::now();
        match self.live(key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        }
    }

    pub fn len(&mut self) -> usize {
        let now = Instant::now();
        self.entries.retain(|_, e| !e.is_expired(now));
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

/// In-process [`StoreBackend`]. State is local to one process, so it only
/// stands in for the shared store in tests and single-instance runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the store were unreachable
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn keyspace(&self) -> StoreResult<MutexGuard<'_, Keyspace>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("connection refused"));
        }
        self.keyspace
            .lock()
            .map_err(|_| StoreError::unavailable("keyspace lock poisoned"))
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.keyspace()?.get(key))
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        self.keyspace()?.set(key, value, ttl);
        Ok(())
    }

    async fn set_multiple(
        &self,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut keyspace = self.keyspace()?;
        for (key, value) in entries {
            keyspace.set(&key, value, ttl);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let mut keyspace = self.keyspace()?;
        Ok(keys.iter().filter(|key| keyspace.remove(key)).count() as u64)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.keyspace()?.exists(key))
    }

    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let mut keyspace = self.keyspace()?;
        Ok(keys.iter().map(|key| keyspace.get(key)).collect())
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        Ok(self.keyspace()?.ttl(key))
    }

    async fn key_count(&self) -> StoreResult<u64> {
        Ok(self.keyspace()?.len() as u64)
    }

    async fn execute_atomic(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Value> {
        let mut keyspace = self.keyspace()?;
        script.run_native(&mut keyspace, keys, args)
    }

    async fn health_check(&self) -> StoreResult<()> {
        self.keyspace().map(|_| ())
    }
}
