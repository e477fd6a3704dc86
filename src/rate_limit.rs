// src/rate_limit.rs
//! Per-voter fixed-window rate limiting.
//!
//! Windows are aligned to the Unix epoch: the bucket for a request is
//! `floor(now / window)`. Each bucket is its own counter key whose TTL equals
//! the window, so rollover happens by expiry and nothing is ever reset.
//! Counting is a single atomic increment in the shared store, which keeps the
//! cap approximately right across any number of service instances.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Script};
use tracing::debug;

use crate::error::StoreError;
use crate::models::VoterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Vote,
    CreatePoll,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Vote => "vote",
            Action::CreatePoll => "poll_creation",
        }
    }
}

/// `limit` actions per `window`, written as `<count>/<s|m|h|d>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub limit: u32,
    pub window: Duration,
}

impl RatePolicy {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { limit, window }
    }
}

impl FromStr for RatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, unit) = s
            .split_once('/')
            .ok_or_else(|| format!("expected <count>/<unit>, got {s:?}"))?;

        let limit: u32 = count
            .trim()
            .parse()
            .map_err(|e| format!("bad count {count:?}: {e}"))?;
        if limit == 0 {
            return Err("count must be at least 1".to_string());
        }

        let secs = match unit.trim() {
            "s" | "sec" | "second" => 1,
            "m" | "min" | "minute" => 60,
            "h" | "hour" => 60 * 60,
            "d" | "day" => 24 * 60 * 60,
            other => return Err(format!("unknown window unit {other:?}")),
        };

        Ok(Self::new(limit, Duration::from_secs(secs)))
    }
}

impl fmt::Display for RatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.limit, self.window.as_secs())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// Time until the current window closes.
    pub retry_after: Duration,
}

/// Shared counter service with an atomic increment-with-TTL primitive.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key`, setting its TTL on first use, and returns the new value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;
}

const INCR_WITH_TTL: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

pub struct RedisCounters {
    connection: ConnectionManager,
    script: Script,
}

impl RedisCounters {
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(INCR_WITH_TTL),
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut connection = self.connection.clone();
        let count: u64 = self
            .script
            .key(key)
            .arg(ttl.as_millis() as u64)
            .invoke_async(&mut connection)
            .await?;

        Ok(count)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    vote_policy: RatePolicy,
    poll_policy: RatePolicy,
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, vote_policy: RatePolicy, poll_policy: RatePolicy) -> Self {
        Self {
            counters,
            vote_policy,
            poll_policy,
        }
    }

    pub fn policy(&self, action: Action) -> RatePolicy {
        match action {
            Action::Vote => self.vote_policy,
            Action::CreatePoll => self.poll_policy,
        }
    }

    pub async fn allow(&self, voter: &VoterId, action: Action) -> Result<RateDecision, StoreError> {
        self.allow_at(voter, action, Utc::now()).await
    }

    pub async fn allow_at(
        &self,
        voter: &VoterId,
        action: Action,
        now: DateTime<Utc>,
    ) -> Result<RateDecision, StoreError> {
        let policy = self.policy(action);
        let window_ms = policy.window.as_millis().max(1) as i64;
        let now_ms = now.timestamp_millis();
        let bucket = now_ms.div_euclid(window_ms);
        let key = window_key(voter, action, bucket);

        let count = self.counters.incr_with_ttl(&key, policy.window).await?;

        let window_end_ms = (bucket + 1) * window_ms;
        let retry_after = Duration::from_millis((window_end_ms - now_ms).max(0) as u64);
        let allowed = count <= u64::from(policy.limit);
        let remaining = u64::from(policy.limit).saturating_sub(count) as u32;

        if !allowed {
            debug!(voter = %voter, action = action.as_str(), count, "Rate limit exceeded");
        }

        Ok(RateDecision {
            allowed,
            remaining,
            retry_after,
        })
    }
}

fn window_key(voter: &VoterId, action: Action, bucket: i64) -> String {
    format!("ratelimit:{}:{}:{}", action.as_str(), voter, bucket)
}
