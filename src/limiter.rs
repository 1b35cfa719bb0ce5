//! Per-identity admission control over the shared store.
//!
//! Each identity owns two keys with independent expirations: a fixed-window
//! counter (`ratelimit:counter:{identity}`, TTL set when the key is created)
//! and a ban flag (`ratelimit:ban:{identity}`). The ban check, the increment,
//! the comparison with the quota and the ban write run as one server-side
//! script, so concurrent instances never race on them.

use chrono::{DateTime, Utc};
use redis::Value;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

use crate::{
    config::RateLimitSettings,
    error::{Error, Result, StoreError, StoreResult},
    metrics::Metrics,
    store::{AtomicScript, KeyTtl, Keyspace, StoreClient},
    utils::TimeSource,
};

const COUNTER_PREFIX: &str = "ratelimit:counter";
const BAN_PREFIX: &str = "ratelimit:ban";

/// Script reply status codes
const STATUS_ADMITTED: i64 = 1;
const STATUS_NEWLY_BANNED: i64 = 0;
const STATUS_ALREADY_BANNED: i64 = -1;

/// KEYS: counter, ban. ARGV: limit, window seconds, ban seconds.
/// Replies `{status, count, ttl}`; `ttl` is the counter TTL when admitted
/// and the ban TTL otherwise.
const ADMISSION_LUA: &str = r#"
local counter_key = KEYS[1]
local ban_key = KEYS[2]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local ban_duration = tonumber(ARGV[3])

local current = tonumber(redis.call('GET', counter_key) or '0')

if redis.call('EXISTS', ban_key) == 1 then
    return {-1, current, redis.call('TTL', ban_key)}
end

if current + 1 > limit then
    redis.call('SET', ban_key, '1', 'EX', ban_duration)
    return {0, current, ban_duration}
end

current = redis.call('INCR', counter_key)
if redis.call('TTL', counter_key) < 0 then
    redis.call('EXPIRE', counter_key, window)
end
return {1, current, redis.call('TTL', counter_key)}
"#;

/// Same steps as [`ADMISSION_LUA`], for in-process stores
fn admission_native(
    keyspace: &mut Keyspace,
    keys: &[String],
    args: &[String],
) -> StoreResult<Value> {
    let (counter_key, ban_key) = match keys {
        [counter, ban] => (counter.as_str(), ban.as_str()),
        _ => return Err(StoreError::unavailable("admission script expects 2 keys")),
    };
    let numeric = |i: usize| -> StoreResult<i64> {
        args.get(i).and_then(|a| a.parse().ok()).ok_or_else(|| {
            StoreError::unavailable(format!("admission script argument {} is not a number", i + 1))
        })
    };
    let (limit, window, ban_duration) = (numeric(0)?, numeric(1)?, numeric(2)?);

    let current: i64 = match keyspace.get(counter_key) {
        Some(raw) => raw.parse().map_err(|_| {
            StoreError::unavailable(format!("counter {} is not an integer", counter_key))
        })?,
        None => 0,
    };

    if keyspace.exists(ban_key) {
        let ttl = keyspace.ttl(ban_key).as_redis_secs();
        return Ok(reply(STATUS_ALREADY_BANNED, current, ttl));
    }

    if current + 1 > limit {
        keyspace.set(
            ban_key,
            "1".to_string(),
            Some(Duration::from_secs(ban_duration.max(1) as u64)),
        );
        return Ok(reply(STATUS_NEWLY_BANNED, current, ban_duration));
    }

    let current = keyspace.incr(counter_key)?;
    if keyspace.ttl(counter_key).as_redis_secs() < 0 {
        keyspace.expire(counter_key, Duration::from_secs(window.max(1) as u64));
    }
    Ok(reply(STATUS_ADMITTED, current, keyspace.ttl(counter_key).as_redis_secs()))
}

fn reply(status: i64, count: i64, ttl: i64) -> Value {
    Value::Bulk(vec![Value::Int(status), Value::Int(count), Value::Int(ttl)])
}

/// Outcome of an admission check or status read
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    /// When the current window ends; `None` when no window is running
    pub reset_at: Option<DateTime<Utc>>,
    pub banned_until: Option<DateTime<Utc>>,
    /// Seconds until the ban expires; 0 when not banned
    pub retry_after: u64,
}

impl AdmissionDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            limit: u64::MAX,
            reset_at: None,
            banned_until: None,
            retry_after: 0,
        }
    }

    fn fail_open(limit: u64) -> Self {
        Self {
            allowed: true,
            remaining: limit,
            limit,
            reset_at: None,
            banned_until: None,
            retry_after: 0,
        }
    }

    fn banned(limit: u64, ban_ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit,
            reset_at: None,
            banned_until: Some(TimeSource::after(now, ban_ttl)),
            retry_after: ban_ttl.as_secs(),
        }
    }
}

/// Decoded script reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptOutcome {
    Admitted { count: u64, window_ttl: KeyTtl },
    NewlyBanned { count: u64, ban_secs: u64 },
    AlreadyBanned { count: u64, ban_ttl: KeyTtl },
}

fn parse_script_reply(value: &Value) -> Result<ScriptOutcome> {
    let items = match value {
        Value::Bulk(items) if items.len() == 3 => items,
        other => {
            return Err(Error::MalformedScriptResult(format!(
                "expected a 3-element array, got {:?}",
                other
            )))
        }
    };

    let mut ints = [0i64; 3];
    for (slot, item) in ints.iter_mut().zip(items) {
        *slot = match item {
            Value::Int(n) => *n,
            other => {
                return Err(Error::MalformedScriptResult(format!(
                    "expected integer element, got {:?}",
                    other
                )))
            }
        };
    }

    let [status, count, ttl] = ints;
    let count = count.max(0) as u64;
    match status {
        STATUS_ADMITTED => Ok(ScriptOutcome::Admitted {
            count,
            window_ttl: KeyTtl::from_redis_secs(ttl),
        }),
        STATUS_NEWLY_BANNED => Ok(ScriptOutcome::NewlyBanned {
            count,
            ban_secs: ttl.max(0) as u64,
        }),
        STATUS_ALREADY_BANNED => Ok(ScriptOutcome::AlreadyBanned {
            count,
            ban_ttl: KeyTtl::from_redis_secs(ttl),
        }),
        other => Err(Error::MalformedScriptResult(format!(
            "unknown status {}",
            other
        ))),
    }
}

/// Fixed-window admission control with bans, shared through the store
pub struct AdmissionService {
    store: StoreClient,
    settings: RateLimitSettings,
    script: AtomicScript,
    metrics: Arc<Metrics>,
    time_source: TimeSource,
}

impl AdmissionService {
    pub fn new(store: StoreClient, settings: RateLimitSettings, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            settings,
            script: AtomicScript::new("admission", ADMISSION_LUA, admission_native),
            metrics,
            time_source: TimeSource::new(),
        }
    }

    pub fn settings(&self) -> &RateLimitSettings {
        &self.settings
    }

    pub fn counter_key(identity: &str) -> String {
        format!("{}:{}", COUNTER_PREFIX, identity)
    }

    pub fn ban_key(identity: &str) -> String {
        format!("{}:{}", BAN_PREFIX, identity)
    }

    /// Check and consume one unit of quota for `identity`.
    ///
    /// Never fails: store errors and malformed script replies admit the
    /// request with the nominal limit as remaining.
    pub async fn check_limit(&self, identity: &str, is_vip: bool) -> AdmissionDecision {
        if !self.settings.enabled {
            self.metrics.record_admission("disabled");
            return AdmissionDecision::unlimited();
        }

        let limit = self.settings.limit_for(is_vip);
        let keys = [Self::counter_key(identity), Self::ban_key(identity)];
        let args = [
            limit.to_string(),
            self.settings.window_secs.to_string(),
            self.settings.ban_duration_secs.to_string(),
        ];

        let outcome = self
            .store
            .execute_atomic(&self.script, &keys, &args)
            .await
            .map_err(Error::from)
            .and_then(|value| parse_script_reply(&value));

        let now = self.time_source.utc_now();
        match outcome {
            Ok(ScriptOutcome::Admitted { count, window_ttl }) => {
                self.metrics.record_admission("allowed");
                AdmissionDecision {
                    allowed: true,
                    remaining: limit.saturating_sub(count),
                    limit,
                    reset_at: window_ttl
                        .remaining()
                        .map(|ttl| TimeSource::after(now, ttl)),
                    banned_until: None,
                    retry_after: 0,
                }
            }
            Ok(ScriptOutcome::NewlyBanned { count, ban_secs }) => {
                self.metrics.record_admission("rejected");
                warn!(
                    identity,
                    count,
                    limit,
                    ban_duration = ban_secs,
                    "rate limit exceeded, identity banned"
                );
                AdmissionDecision::banned(limit, Duration::from_secs(ban_secs), now)
            }
            Ok(ScriptOutcome::AlreadyBanned { count, ban_ttl }) => {
                self.metrics.record_admission("banned");
                debug!(identity, count, "request from banned identity");
                AdmissionDecision::banned(limit, ban_ttl.remaining().unwrap_or_default(), now)
            }
            Err(e) => {
                self.metrics.record_admission("fail_open");
                error!(
                    identity,
                    script = self.script.name(),
                    error = %e,
                    "admission check failed, allowing request"
                );
                AdmissionDecision::fail_open(limit)
            }
        }
    }

    /// Report the current state for `identity` without creating or
    /// modifying either key.
    pub async fn get_status(&self, identity: &str, is_vip: bool) -> Result<AdmissionDecision> {
        if !self.settings.enabled {
            return Ok(AdmissionDecision::unlimited());
        }

        let limit = self.settings.limit_for(is_vip);
        let now = self.time_source.utc_now();

        let ban_key = Self::ban_key(identity);
        if self.store.exists(&ban_key).await? {
            let ban_ttl = self.store.ttl(&ban_key).await?;
            return Ok(AdmissionDecision::banned(
                limit,
                ban_ttl.remaining().unwrap_or_default(),
                now,
            ));
        }

        let counter_key = Self::counter_key(identity);
        let count: u64 = match self.store.get(&counter_key).await {
            Ok(count) => count,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e.into()),
        };
        let window_ttl = self.store.ttl(&counter_key).await?;

        Ok(AdmissionDecision {
            allowed: count < limit,
            remaining: limit.saturating_sub(count),
            limit,
            reset_at: window_ttl.remaining().map(|ttl| TimeSource::after(now, ttl)),
            banned_until: None,
            retry_after: 0,
        })
    }

    /// Drop the counter and the ban for `identity`. Idempotent.
    pub async fn reset(&self, identity: &str) -> Result<()> {
        let keys = [Self::counter_key(identity), Self::ban_key(identity)];
        self.store.delete(&keys).await.map_err(|e| {
            error!(identity, error = %e, "failed to reset rate limit");
            Error::from(e)
        })?;
        info!(identity, "rate limit reset");
        Ok(())
    }
}
