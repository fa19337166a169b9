//! Retry policy with exponential backoff.
//!
//! Only transient failures are retried; see
//! [`GatewayError::is_retryable`]. Every attempt, successful or not, is
//! reported back in the [`RetryOutcome`].

use chrono::{DateTime, Utc};
use gateway_core::GatewayError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Backoff parameters
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// One attempt made by the retry loop
#[derive(Debug, Clone)]
pub struct AttemptReport {
    /// 0-based attempt index
    pub attempt: u32,
    /// Wall-clock start
    pub started_at: DateTime<Utc>,
    /// How long the attempt took
    pub latency: Duration,
    /// The failure, if the attempt failed
    pub error: Option<GatewayError>,
}

/// Result of a retried operation plus its attempt log
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result
    pub result: Result<T, GatewayError>,
    /// Every attempt, in order
    pub attempts: Vec<AttemptReport>,
}

impl<T> RetryOutcome<T> {
    /// Number of attempts made
    #[must_use]
    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// Whether the final attempt succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Exponential backoff over transient [`GatewayError`]s
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    /// Policy over `config`
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Policy with one second base delay, three retries and 20% jitter
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Calculate delay before retry number `attempt + 1` (0-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_millis() as f64;
        let delay = base * self.config.multiplier.powi(attempt.min(63) as i32);
        let delay = delay.min(self.config.max_delay.as_millis() as f64);

        let jitter_range = delay * self.config.jitter;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }

    /// Whether `error` is worth another attempt
    #[must_use]
    pub fn is_retryable(&self, error: &GatewayError) -> bool {
        error.is_retryable()
    }

    /// Run `operation` until it succeeds, fails non-retryably, or the retry
    /// budget is spent. Non-retryable failures return at once without
    /// consuming budget.
    pub async fn execute_with_retry<F, Fut, T>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempts = Vec::new();
        let mut attempt = 0;

        loop {
            let started_at = Utc::now();
            let start = Instant::now();
            let result = operation(attempt).await;
            let latency = start.elapsed();

            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt, "Retry succeeded");
                    }
                    attempts.push(AttemptReport {
                        attempt,
                        started_at,
                        latency,
                        error: None,
                    });
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(error) => {
                    attempts.push(AttemptReport {
                        attempt,
                        started_at,
                        latency,
                        error: Some(error.clone()),
                    });

                    if !self.is_retryable(&error) || attempt >= self.config.max_retries {
                        return RetryOutcome {
                            result: Err(error),
                            attempts,
                        };
                    }

                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after error"
                    );

                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Backoff parameters in use
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

/// Fluent construction of a [`RetryPolicy`]
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    config: RetryConfig,
}

impl RetryPolicyBuilder {
    /// Start from [`RetryConfig::default`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries allowed after the first attempt
    #[must_use]
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    /// Delay before the first retry
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Ceiling on any single delay
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Growth factor per attempt
    #[must_use]
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.config.multiplier = multiplier;
        self
    }

    /// Jitter as a fraction of the delay, clamped to `0.0..=1.0`
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.config.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Finish
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy::new(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicyBuilder::new()
            .max_retries(max_retries)
            .base_delay(Duration::from_millis(1))
            .jitter(0.0)
            .build()
    }

    #[test]
    fn test_default_backoff_schedule() {
        let policy = RetryPolicyBuilder::new().jitter(0.0).build();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(30)); // Capped
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::with_defaults();
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(1600));
            assert!(delay <= Duration::from_millis(2400));
        }
    }

    #[test]
    fn test_is_retryable() {
        let policy = RetryPolicy::with_defaults();

        assert!(policy.is_retryable(&GatewayError::timeout("p", Duration::from_secs(30))));
        assert!(policy.is_retryable(&GatewayError::provider("p", "error", Some(503), true)));
        assert!(policy.is_retryable(&GatewayError::connection("p", "reset")));

        assert!(!policy.is_retryable(&GatewayError::validation("test", None)));
        assert!(!policy.is_retryable(&GatewayError::protocol("p", "garbled")));
        assert!(!policy.is_retryable(&GatewayError::circuit_open("p", None)));
        assert!(!policy.is_retryable(&GatewayError::provider("p", "error", Some(400), false)));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let policy = fast_policy(3);
        let counter = Arc::new(AtomicU32::new(0));

        let outcome = policy
            .execute_with_retry(|_| {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                    Ok::<_, GatewayError>(42)
                }
            })
            .await;

        assert_eq!(outcome.attempt_count(), 1);
        assert_eq!(outcome.result.expect("success"), 42);
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let policy = fast_policy(3);

        let outcome = policy
            .execute_with_retry(|attempt| async move {
                if attempt < 2 {
                    Err(GatewayError::provider("p", "error", Some(503), true))
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert!(outcome.is_success());
        assert_eq!(outcome.attempt_count(), 3); // Initial + 2 retries
        assert!(outcome.attempts[0].error.is_some());
        assert!(outcome.attempts[2].error.is_none());
    }

    #[tokio::test]
    async fn test_retry_exhausted_after_max_plus_one_attempts() {
        let policy = fast_policy(3);
        let counter = Arc::new(AtomicU32::new(0));

        let outcome: RetryOutcome<()> = policy
            .execute_with_retry(|_| {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                    Err(GatewayError::timeout("p", Duration::from_secs(1)))
                }
            })
            .await;

        assert!(!outcome.is_success());
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        assert_eq!(outcome.attempt_count(), 4);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let policy = fast_policy(3);

        let outcome: RetryOutcome<()> = policy
            .execute_with_retry(|_| async { Err(GatewayError::protocol("p", "bad frame")) })
            .await;

        assert_eq!(outcome.attempt_count(), 1); // No retries
        assert!(matches!(outcome.result, Err(GatewayError::Protocol { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sleeps_between_attempts() {
        let policy = RetryPolicyBuilder::new().max_retries(2).jitter(0.0).build();
        let start = Instant::now();

        let outcome: RetryOutcome<()> = policy
            .execute_with_retry(|_| async { Err(GatewayError::connection("p", "reset")) })
            .await;

        assert_eq!(outcome.attempt_count(), 3);
        // 1s + 2s of virtual time
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_builder_clamps_jitter() {
        let policy = RetryPolicyBuilder::new()
            .max_retries(5)
            .base_delay(Duration::from_millis(200))
            .max_delay(Duration::from_secs(10))
            .multiplier(3.0)
            .jitter(1.5)
            .build();

        assert_eq!(policy.config().max_retries, 5);
        assert_eq!(policy.config().base_delay, Duration::from_millis(200));
        assert_eq!(policy.config().max_delay, Duration::from_secs(10));
        assert!((policy.config().multiplier - 3.0).abs() < 0.001);
        assert!((policy.config().jitter - 1.0).abs() < 0.001);
    }
}
