//! Sliding-window rate limiting per `(identity, endpoint class)`.
//!
//! Redis is the primary store so limits hold across gateway instances. When
//! Redis is unreachable or slower than `store_timeout`, the limiter degrades
//! to a per-instance in-memory log and retries Redis after
//! `primary_retry_after`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gateway_core::GatewayError;
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Endpoint class; each class has its own quota
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Aggregated (non-streaming) completions
    Completion,
    /// Streaming completions
    Stream,
}

impl EndpointClass {
    /// Stable label used in keys and metrics
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completion => "completion",
            Self::Stream => "stream",
        }
    }

    /// Class for a request's streaming flag
    #[must_use]
    pub fn for_streaming(streaming: bool) -> Self {
        if streaming {
            Self::Stream
        } else {
            Self::Completion
        }
    }
}

/// Outcome of one rate-limit check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Requests allowed per window
    pub limit: u32,
    /// Requests left in the current window
    pub remaining: u32,
    /// When the oldest counted request leaves the window
    pub reset_at: DateTime<Utc>,
    /// How long to wait before retrying; set only on rejection
    #[serde(with = "optional_millis")]
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: u32::MAX,
            remaining: u32::MAX,
            reset_at: Utc::now(),
            retry_after: None,
        }
    }

    /// Convert a rejection into `RATE_LIMITED`
    ///
    /// # Errors
    /// Returns `GatewayError::RateLimited` when the request is not allowed
    pub fn into_result(self) -> Result<Self, GatewayError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(GatewayError::rate_limited(self.retry_after, Some(self.limit)))
        }
    }
}

mod optional_millis {
    use serde::Serializer;
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }
}

/// Rate-limit store failures
#[derive(Debug, Error)]
pub enum RateLimitStoreError {
    /// Store could not be reached
    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),

    /// Store did not answer in time
    #[error("rate limit store timed out after {0:?}")]
    Timeout(Duration),

    /// Store answered with something unexpected
    #[error("rate limit store returned an invalid reply: {0}")]
    InvalidReply(String),
}

impl From<redis::RedisError> for RateLimitStoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::ZERO)
        } else if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            Self::Unavailable(err.to_string())
        } else {
            Self::InvalidReply(err.to_string())
        }
    }
}

/// Sliding-window counter backend
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Store name for logs
    fn name(&self) -> &'static str;

    /// Count a request against `key` if fewer than `limit` were counted in
    /// the trailing `window`. Rejected requests are not counted.
    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitStoreError>;
}

/// How often the memory store sweeps idle keys
const SWEEP_EVERY: u64 = 1024;

/// Per-instance sliding log
#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, VecDeque<Instant>>,
    hits: AtomicU64,
    longest_window_ms: AtomicU64,
}

impl MemoryRateLimitStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked keys
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Drop keys with no request inside the longest window seen
    pub fn sweep(&self) {
        let longest = Duration::from_millis(self.longest_window_ms.load(Ordering::Relaxed));
        let now = Instant::now();
        self.windows.retain(|_, log| {
            log.back()
                .is_some_and(|last| now.saturating_duration_since(*last) < longest)
        });
    }

    fn decide(now: Instant, log: &mut VecDeque<Instant>, limit: u32, window: Duration) -> RateLimitDecision {
        while log
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            log.pop_front();
        }

        let allowed = log.len() < limit as usize;
        if allowed {
            log.push_back(now);
        }

        let until_reset = log
            .front()
            .map_or(window, |oldest| (*oldest + window).saturating_duration_since(now));
        let reset_at = Utc::now()
            + chrono::Duration::from_std(until_reset).unwrap_or_else(|_| chrono::Duration::zero());

        RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(log.len() as u32),
            reset_at,
            retry_after: (!allowed).then_some(until_reset),
        }
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitStoreError> {
        self.longest_window_ms
            .fetch_max(window.as_millis() as u64, Ordering::Relaxed);

        let decision = {
            let mut log = self.windows.entry(key.to_string()).or_default();
            Self::decide(Instant::now(), &mut log, limit, window)
        };

        if self.hits.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep();
        }
        Ok(decision)
    }
}

/// Trim, count and conditionally add in one round trip.
/// Replies `{allowed, count, oldest_score_ms}`.
const SLIDING_WINDOW_SCRIPT: &str = r"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local allowed = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  count = count + 1
  allowed = 1
end
redis.call('PEXPIRE', key, window)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = now
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {allowed, count, oldest_score}
";

/// Shared sliding log in a Redis sorted set
pub struct RedisRateLimitStore {
    conn: ConnectionManager,
    script: Script,
}

impl std::fmt::Debug for RedisRateLimitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimitStore").finish_non_exhaustive()
    }
}

impl RedisRateLimitStore {
    /// Connect to Redis.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the connection fails
    pub async fn connect(url: &str) -> Result<Self, RateLimitStoreError> {
        let client =
            Client::open(url).map_err(|e| RateLimitStoreError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis rate limit store");
        Ok(Self {
            conn,
            script: Script::new(SLIDING_WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn hit(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitDecision, RateLimitStoreError> {
        let mut conn = self.conn.clone();
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = window.as_millis() as i64;
        let member = format!("{now_ms}-{:016x}", rand::thread_rng().gen::<u64>());

        let reply: Vec<i64> = self
            .script
            .key(key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let (allowed, count, oldest_ms) = match reply.as_slice() {
            [allowed, count, oldest] => (*allowed, *count, *oldest),
            other => {
                return Err(RateLimitStoreError::InvalidReply(format!(
                    "expected 3 integers, got {}",
                    other.len()
                )))
            }
        };

        let allowed = allowed == 1;
        let reset_ms = oldest_ms + window_ms;
        let reset_at = DateTime::<Utc>::from_timestamp_millis(reset_ms).unwrap_or_else(Utc::now);
        let until_reset = Duration::from_millis(reset_ms.saturating_sub(now_ms).max(0) as u64);

        Ok(RateLimitDecision {
            allowed,
            limit,
            remaining: limit.saturating_sub(count.max(0) as u32),
            reset_at,
            retry_after: (!allowed).then_some(until_reset),
        })
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Disabled limiters allow everything
    pub enabled: bool,
    /// Sliding window length
    pub window: Duration,
    /// Requests per window for [`EndpointClass::Completion`]
    pub completion_limit: u32,
    /// Requests per window for [`EndpointClass::Stream`]
    pub stream_limit: u32,
    /// Primary store operation timeout
    pub store_timeout: Duration,
    /// Back-off before the primary store is tried again
    pub primary_retry_after: Duration,
    /// Prefix for store keys
    pub key_prefix: String,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            completion_limit: 60,
            stream_limit: 30,
            store_timeout: Duration::from_millis(50),
            primary_retry_after: Duration::from_secs(30),
            key_prefix: "gateway:ratelimit".to_string(),
        }
    }
}

impl RateLimiterConfig {
    /// Limit for a class
    #[must_use]
    pub fn limit_for(&self, class: EndpointClass) -> u32 {
        match class {
            EndpointClass::Completion => self.completion_limit,
            EndpointClass::Stream => self.stream_limit,
        }
    }
}

/// Rate limiter with automatic in-memory fallback
pub struct RateLimiter {
    config: RateLimiterConfig,
    primary: Option<Arc<dyn RateLimitStore>>,
    fallback: MemoryRateLimitStore,
    degraded_until: Mutex<Option<Instant>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("primary", &self.primary.as_ref().map(|p| p.name()))
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Limiter backed only by the in-memory store
    #[must_use]
    pub fn in_memory(config: RateLimiterConfig) -> Self {
        Self {
            config,
            primary: None,
            fallback: MemoryRateLimitStore::new(),
            degraded_until: Mutex::new(None),
        }
    }

    /// Limiter with a shared primary store
    #[must_use]
    pub fn with_primary(config: RateLimiterConfig, primary: Arc<dyn RateLimitStore>) -> Self {
        Self {
            primary: Some(primary),
            ..Self::in_memory(config)
        }
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Whether the limiter is enforcing per instance only
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.primary.is_some() && self.degraded_until.lock().is_some()
    }

    /// Count a request for `identity` and decide whether it may proceed
    pub async fn check_and_increment(&self, identity: &str, class: EndpointClass) -> RateLimitDecision {
        if !self.config.enabled {
            return RateLimitDecision::unlimited();
        }

        let key = format!("{}:{}:{}", self.config.key_prefix, class.as_str(), identity);
        let limit = self.config.limit_for(class);
        let window = self.config.window;

        if let Some(primary) = self.primary_if_due() {
            let result = match tokio::time::timeout(
                self.config.store_timeout,
                primary.hit(&key, limit, window),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RateLimitStoreError::Timeout(self.config.store_timeout)),
            };

            match result {
                Ok(decision) => {
                    self.mark_healthy(primary.name());
                    return decision;
                }
                Err(err) => self.mark_degraded(primary.name(), &err),
            }
        }

        // the memory store never fails
        match self.fallback.hit(&key, limit, window).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, "In-memory rate limit store failed; allowing request");
                RateLimitDecision::unlimited()
            }
        }
    }

    /// Like [`Self::check_and_increment`], mapping a rejection to `RATE_LIMITED`
    ///
    /// # Errors
    /// Returns `GatewayError::RateLimited` with a retry-after hint
    pub async fn enforce(
        &self,
        identity: &str,
        class: EndpointClass,
    ) -> Result<RateLimitDecision, GatewayError> {
        let decision = self.check_and_increment(identity, class).await;
        if !decision.allowed {
            debug!(
                identity = %identity,
                class = class.as_str(),
                limit = decision.limit,
                "Rate limit exceeded"
            );
        }
        decision.into_result()
    }

    fn primary_if_due(&self) -> Option<&Arc<dyn RateLimitStore>> {
        let primary = self.primary.as_ref()?;
        let degraded_until = *self.degraded_until.lock();
        match degraded_until {
            Some(until) if Instant::now() < until => None,
            _ => Some(primary),
        }
    }

    fn mark_healthy(&self, store: &str) {
        let mut degraded = self.degraded_until.lock();
        if degraded.take().is_some() {
            info!(store = store, "Rate limit store recovered; shared enforcement restored");
        }
    }

    fn mark_degraded(&self, store: &str, err: &RateLimitStoreError) {
        let mut degraded = self.degraded_until.lock();
        if degraded.is_none() {
            warn!(
                store = store,
                error = %err,
                retry_in_ms = self.config.primary_retry_after.as_millis() as u64,
                "Rate limit store unavailable; enforcing per instance only"
            );
        }
        *degraded = Some(Instant::now() + self.config.primary_retry_after);
    }
}
