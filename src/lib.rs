//! Delivery Guard
//!
//! Shared infrastructure for the delivery platform backend: a time-bounded
//! client for the shared key-value store, a read-through cache service and
//! a distributed fixed-window admission (rate limit) service with temporary
//! bans. Every replica coordinates exclusively through the shared store.

pub mod cache;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod service;
pub mod store;
pub mod utils;

// Re-export main types
pub use cache::{CacheMetrics, CacheService};
pub use config::Settings;
pub use error::{Error, Result, StoreError};
pub use limiter::{AdmissionDecision, AdmissionService};
pub use service::{router, AppState};
pub use store::{MemoryStore, RedisStore, StoreBackend, StoreClient};
