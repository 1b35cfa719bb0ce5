use std::time::Duration;

use thiserror::Error;

/// Result type for admission and cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Result type for raw store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by the shared key-value store layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// The key is absent or has expired. Callers treat this as a miss.
    #[error("key {0} not found")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to decode value for key {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode value for key {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Network, protocol and timeout failures.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout(_))
    }

    /// Builds an `Unavailable` error from a plain message, used by backends
    /// that do not speak the Redis wire protocol.
    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "store unavailable",
            message.into(),
        )))
    }
}

/// Errors that can occur in the admission and cache services
#[derive(Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Malformed script result: {0}")]
    MalformedScriptResult(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
