use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use std::{net::SocketAddr, time::Duration};

/// Wall-clock source for deadlines reported to callers
pub struct TimeSource {
    _private: (),
}

impl TimeSource {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Get the current time as a DateTime<Utc>
    pub fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    /// `now` shifted forward by a store TTL
    pub fn after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        let delta = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        now + delta
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the identity a request is governed under: the first entry of
/// `X-Forwarded-For`, then `X-Real-IP`, then the socket peer address.
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    let real_ip = || {
        headers
            .get("x-real-ip")
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
    };

    forwarded
        .or_else(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Format an optional deadline as RFC 3339, empty when unset
pub fn format_deadline(deadline: Option<DateTime<Utc>>) -> String {
    deadline.map(|d| d.to_rfc3339()).unwrap_or_default()
}
