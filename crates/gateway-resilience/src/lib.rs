//! # Gateway Resilience
//!
//! Overload and failure protection for the Chat Completion Gateway:
//! - Circuit breaker per provider
//! - Retry policy with exponential backoff
//! - Priority admission queue with per-caller ceilings
//! - Sliding-window rate limiting (Redis with in-memory fallback)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

// Re-export main types
pub use admission::{AdmissionConfig, AdmissionController, AdmissionStats, QueueTicket};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitPermit, CircuitSnapshot,
    CircuitState,
};
pub use rate_limiter::{
    EndpointClass, MemoryRateLimitStore, RateLimitDecision, RateLimitStore, RateLimitStoreError,
    RateLimiter, RateLimiterConfig, RedisRateLimitStore,
};
pub use retry::{AttemptReport, RetryConfig, RetryOutcome, RetryPolicy, RetryPolicyBuilder};
