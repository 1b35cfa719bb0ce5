use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

/// Environment prefix for configuration overrides, e.g.
/// `DELIVERY_GUARD__RATE_LIMIT__WINDOW_SECS=30`.
pub const ENV_PREFIX: &str = "DELIVERY_GUARD";

/// Top-level service settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerSettings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Which store backend to connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Redis,
    /// In-process keyspace; state is not shared between instances.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackendKind,
    pub url: String,
    pub connection_timeout_ms: u64,
    pub command_timeout_ms: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Redis,
            url: "redis://localhost:6379".to_string(),
            connection_timeout_ms: 5_000,
            command_timeout_ms: 1_000,
        }
    }
}

impl StoreSettings {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub enabled: bool,
    /// TTL for ordinary entries
    pub default_ttl_secs: u64,
    /// TTL for entries populated by warmup
    pub hot_data_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            hot_data_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub default_requests_per_window: u64,
    pub vip_requests_per_window: u64,
    pub ban_duration_secs: u64,
    pub window_secs: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_requests_per_window: 100,
            vip_requests_per_window: 1000,
            ban_duration_secs: 300,
            window_secs: 60,
        }
    }
}

impl RateLimitSettings {
    /// Quota for the given tier
    pub fn limit_for(&self, is_vip: bool) -> u64 {
        if is_vip {
            self.vip_requests_per_window
        } else {
            self.default_requests_per_window
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional file and the environment,
    /// in increasing order of precedence.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the services cannot run with
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limit;
        if rl.window_secs == 0 {
            return Err(Error::Config("rate_limit.window_secs must be positive".to_string()));
        }
        if rl.ban_duration_secs == 0 {
            return Err(Error::Config(
                "rate_limit.ban_duration_secs must be positive".to_string(),
            ));
        }
        if rl.default_requests_per_window == 0 {
            return Err(Error::Config(
                "rate_limit.default_requests_per_window must be positive".to_string(),
            ));
        }
        if rl.vip_requests_per_window < rl.default_requests_per_window {
            return Err(Error::Config(format!(
                "rate_limit.vip_requests_per_window ({}) is below the default quota ({})",
                rl.vip_requests_per_window, rl.default_requests_per_window
            )));
        }
        if self.store.command_timeout_ms == 0 {
            return Err(Error::Config("store.command_timeout_ms must be positive".to_string()));
        }
        if self.cache.hot_data_ttl_secs > self.cache.default_ttl_secs {
            tracing::warn!(
                hot_data_ttl_secs = self.cache.hot_data_ttl_secs,
                default_ttl_secs = self.cache.default_ttl_secs,
                "hot data TTL is longer than the default TTL"
            );
        }
        Ok(())
    }
}

/// Load settings from a YAML string
pub fn load_settings_from_yaml(yaml: &str) -> Result<Settings> {
    let settings: Settings = serde_yaml::from_str(yaml)
        .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))?;
    settings.validate()?;
    Ok(settings)
}
