use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Value};
use std::time::Duration;
use tracing::{info, warn};

use super::{AtomicScript, KeyTtl, StoreBackend};
use crate::error::{StoreError, StoreResult};

/// Redis connection configuration
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

impl From<&crate::config::StoreSettings> for RedisStoreConfig {
    fn from(settings: &crate::config::StoreSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connection_timeout: settings.connection_timeout(),
            command_timeout: settings.command_timeout(),
        }
    }
}

/// Redis-backed [`StoreBackend`] over a reconnecting connection manager
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis and verify the connection with `PING`
    pub async fn connect(config: &RedisStoreConfig) -> StoreResult<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            StoreError::Unavailable(e)
        })?;

        info!("Redis client created, establishing connection manager...");

        let connection = match tokio::time::timeout(
            config.connection_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(StoreError::Unavailable(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}s)",
                    config.connection_timeout.as_secs()
                );
                return Err(StoreError::Timeout(config.connection_timeout));
            }
        };

        let store = Self { connection };

        info!("Testing Redis connection with PING...");
        match tokio::time::timeout(config.command_timeout, store.health_check()).await {
            Ok(Ok(())) => info!("Redis PING successful"),
            Ok(Err(e)) => {
                warn!("Redis PING failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                warn!(
                    "Redis PING timeout ({}ms)",
                    config.command_timeout.as_millis()
                );
                return Err(StoreError::Timeout(config.command_timeout));
            }
        }

        info!("Redis store initialized successfully");
        Ok(store)
    }

    fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }
}

/// Whole seconds for `SET ... EX`, never below one
fn expiry_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl StoreBackend for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("EX").arg(expiry_secs(ttl));
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_multiple(
        &self,
        entries: Vec<(String, String)>,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut conn = self.connection();
        let mut pipe = redis::pipe();

        for (key, value) in &entries {
            let cmd = pipe.cmd("SET").arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("EX").arg(expiry_secs(ttl));
            }
            cmd.ignore();
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let mut conn = self.connection();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn multi_get(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        let mut conn = self.connection();
        // MGET always replies with an array, even for a single key
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn ttl(&self, key: &str) -> StoreResult<KeyTtl> {
        let mut conn = self.connection();
        let secs: i64 = conn.ttl(key).await?;
        Ok(KeyTtl::from_redis_secs(secs))
    }

    async fn key_count(&self) -> StoreResult<u64> {
        let mut conn = self.connection();
        let size: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(size)
    }

    async fn execute_atomic(
        &self,
        script: &AtomicScript,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Value> {
        let mut conn = self.connection();
        let mut invocation = script.lua().prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }
        // EVALSHA, falling back to EVAL when the script is not loaded yet
        let value: Value = invocation.invoke_async(&mut conn).await?;
        Ok(value)
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.connection();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
