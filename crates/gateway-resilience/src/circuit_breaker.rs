//! Circuit breaker pattern implementation.
//!
//! One breaker guards each provider. A call must first acquire a
//! [`CircuitPermit`]; the permit then reports the call's outcome. Permits
//! dropped without an outcome (the caller was cancelled) hand their
//! half-open trial slot back.
//!
//! ```text
//! closed --(failure_threshold consecutive failures)--> open
//! open   --(open_duration elapsed, next acquire)-----> half_open
//! half_open --(trial succeeds)--> closed
//! half_open --(trial fails)-----> open
//! ```

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gateway_core::{GatewayError, ProviderId};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed = 0,
    /// Circuit is open, requests are rejected
    Open = 1,
    /// Circuit is half-open, testing if service recovered
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Cool-down before the first trial
    pub open_duration: Duration,
    /// Concurrent trials allowed while half-open
    pub half_open_trial_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_trial_limit: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Set the failure threshold
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the open duration
    #[must_use]
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the half-open trial limit
    #[must_use]
    pub fn with_trial_limit(mut self, limit: u32) -> Self {
        self.half_open_trial_limit = limit.max(1);
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    consecutive_failures: u32,
    trials_in_flight: u32,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    next_trial_at: Option<Instant>,
}

/// Circuit breaker for a single provider
pub struct CircuitBreaker {
    /// Provider identifier
    provider_id: ProviderId,
    /// Configuration
    config: CircuitBreakerConfig,
    /// Current state (atomic for lock-free reads)
    state: AtomicU8,
    /// Counters; every transition happens under this lock
    counters: Mutex<Counters>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(provider_id: impl Into<ProviderId>, config: CircuitBreakerConfig) -> Self {
        Self {
            provider_id: provider_id.into(),
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Create with default configuration
    #[must_use]
    pub fn with_defaults(provider_id: impl Into<ProviderId>) -> Self {
        Self::new(provider_id, CircuitBreakerConfig::default())
    }

    /// Get the provider ID
    #[must_use]
    pub fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    /// Get the current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether a call would currently be rejected without contacting the provider.
    ///
    /// Does not change state; an open circuit whose cool-down has elapsed
    /// reports as callable.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let counters = self.counters.lock();
        match self.state() {
            CircuitState::Closed => false,
            CircuitState::Open => counters
                .next_trial_at
                .map_or(true, |at| Instant::now() < at),
            CircuitState::HalfOpen => {
                counters.trials_in_flight >= self.config.half_open_trial_limit
            }
        }
    }

    /// Acquire permission for one call
    ///
    /// # Errors
    /// Returns `GatewayError::CircuitOpen` while the circuit is open or every
    /// half-open trial slot is taken
    pub fn try_acquire(self: &Arc<Self>) -> Result<CircuitPermit, GatewayError> {
        let mut counters = self.counters.lock();
        let now = Instant::now();

        if self.state() == CircuitState::Open {
            match counters.next_trial_at {
                Some(at) if now >= at => {
                    self.set_state(CircuitState::HalfOpen);
                    counters.trials_in_flight = 0;
                    info!(provider = %self.provider_id, "Circuit breaker half-open, testing");
                }
                next => {
                    return Err(GatewayError::circuit_open(
                        self.provider_id.as_str(),
                        next.map(|at| at.saturating_duration_since(now)),
                    ));
                }
            }
        }

        match self.state() {
            CircuitState::Closed => Ok(CircuitPermit::new(Arc::clone(self), false)),
            CircuitState::HalfOpen => {
                if counters.trials_in_flight >= self.config.half_open_trial_limit {
                    return Err(GatewayError::circuit_open(self.provider_id.as_str(), None));
                }
                counters.trials_in_flight += 1;
                debug!(
                    provider = %self.provider_id,
                    trials = counters.trials_in_flight,
                    "Circuit breaker trial admitted"
                );
                Ok(CircuitPermit::new(Arc::clone(self), true))
            }
            CircuitState::Open => Err(GatewayError::circuit_open(self.provider_id.as_str(), None)),
        }
    }

    fn on_success(&self, trial: bool) {
        let mut counters = self.counters.lock();
        match self.state() {
            CircuitState::Closed => counters.consecutive_failures = 0,
            CircuitState::HalfOpen if trial => {
                counters.trials_in_flight = counters.trials_in_flight.saturating_sub(1);
                self.close(&mut counters);
            }
            // outcomes of calls admitted before the circuit opened
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut counters = self.counters.lock();
        match self.state() {
            CircuitState::Closed => {
                counters.consecutive_failures += 1;
                if counters.consecutive_failures >= self.config.failure_threshold {
                    debug!(
                        provider = %self.provider_id,
                        failures = counters.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker failure threshold reached"
                    );
                    self.open(&mut counters);
                }
            }
            CircuitState::HalfOpen if trial => {
                counters.trials_in_flight = counters.trials_in_flight.saturating_sub(1);
                debug!(provider = %self.provider_id, "Circuit breaker trial failed, reopening");
                self.open(&mut counters);
            }
            CircuitState::HalfOpen | CircuitState::Open => {}
        }
    }

    fn on_abandon(&self, trial: bool) {
        if !trial {
            return;
        }
        let mut counters = self.counters.lock();
        if self.state() == CircuitState::HalfOpen {
            counters.trials_in_flight = counters.trials_in_flight.saturating_sub(1);
            debug!(provider = %self.provider_id, "Circuit breaker trial abandoned");
        }
    }

    fn open(&self, counters: &mut Counters) {
        let now = Instant::now();
        counters.opened_at = Some(now);
        counters.opened_at_wall = Some(Utc::now());
        counters.next_trial_at = Some(now + self.config.open_duration);
        counters.trials_in_flight = 0;
        self.set_state(CircuitState::Open);

        warn!(
            provider = %self.provider_id,
            failures = counters.consecutive_failures,
            open_for_ms = self.config.open_duration.as_millis() as u64,
            "Circuit breaker opened"
        );
    }

    fn close(&self, counters: &mut Counters) {
        *counters = Counters::default();
        self.set_state(CircuitState::Closed);
        info!(provider = %self.provider_id, "Circuit breaker closed");
    }

    fn set_state(&self, state: CircuitState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Point-in-time view for the admin endpoint
    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let counters = self.counters.lock();
        let now = Instant::now();
        CircuitSnapshot {
            provider_id: self.provider_id.clone(),
            state: self.state(),
            consecutive_failures: counters.consecutive_failures,
            trials_in_flight: counters.trials_in_flight,
            opened_at: counters.opened_at_wall,
            retry_after_ms: match self.state() {
                CircuitState::Open => counters
                    .next_trial_at
                    .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("provider_id", &self.provider_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Permission for one call. Report the outcome with [`CircuitPermit::succeed`]
/// or [`CircuitPermit::fail`]; dropping it unreported counts as abandoned.
#[derive(Debug)]
#[must_use = "a permit must report the call outcome"]
pub struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    resolved: bool,
}

impl CircuitPermit {
    fn new(breaker: Arc<CircuitBreaker>, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            resolved: false,
        }
    }

    /// Whether this call is a half-open trial
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Record a successful call
    pub fn succeed(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.trial);
    }

    /// Record a failed call
    pub fn fail(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.trial);
    }

    /// Release without recording an outcome
    pub fn abandon(self) {}
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.resolved {
            self.breaker.on_abandon(self.trial);
        }
    }
}

/// Serializable breaker state
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Provider ID
    pub provider_id: ProviderId,
    /// Current state
    pub state: CircuitState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Trials currently running
    pub trials_in_flight: u32,
    /// When the circuit last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// Time until a trial is allowed, when open
    pub retry_after_ms: Option<u64>,
}

/// Process-wide breakers, one per provider
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<ProviderId, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers share one configuration
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for a provider, created on first use
    #[must_use]
    pub fn get_or_create(&self, provider: &ProviderId) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(provider) {
            return Arc::clone(&existing);
        }
        Arc::clone(
            self.breakers
                .entry(provider.clone())
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(provider.clone(), self.config.clone()))
                })
                .value(),
        )
    }

    /// Existing breaker for a provider
    #[must_use]
    pub fn get(&self, provider: &ProviderId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(provider).map(|b| Arc::clone(&b))
    }

    /// Snapshots of every breaker, sorted by provider
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::ErrorCode;

    fn breaker(threshold: u32, open_ms: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "test-provider",
            CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_open_duration(Duration::from_millis(open_ms)),
        ))
    }

    fn fail_times(cb: &Arc<CircuitBreaker>, n: u32) {
        for _ in 0..n {
            cb.try_acquire().expect("permit").fail();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_initial_state() {
        let cb = breaker(3, 100);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire().is_ok());
        assert!(!cb.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_opens_on_consecutive_failures() {
        let cb = breaker(3, 1_000);
        fail_times(&cb, 2);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail_times(&cb, 1);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_open());

        let err = cb.try_acquire().expect_err("open");
        assert_eq!(err.code(), ErrorCode::CircuitOpen);
        assert!(err.retry_after().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1_000);
        fail_times(&cb, 2);
        cb.try_acquire().expect("permit").succeed();
        fail_times(&cb, 2);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.snapshot().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_until_open_duration_elapses() {
        let cb = breaker(1, 500);
        fail_times(&cb, 1);

        tokio::time::advance(Duration::from_millis(499)).await;
        assert!(cb.try_acquire().is_err());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cb.is_open());
        let permit = cb.try_acquire().expect("trial");
        assert!(permit.is_trial());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        permit.succeed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_trial_limit() {
        let cb = breaker(1, 10);
        fail_times(&cb, 1);
        tokio::time::advance(Duration::from_millis(10)).await;

        let trial = cb.try_acquire().expect("trial");
        assert!(cb.try_acquire().is_err());
        assert!(cb.is_open());

        trial.fail();
        assert_eq!(cb.state(), CircuitState::Open);
        // cool-down restarted
        assert!(cb.try_acquire().is_err());
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(cb.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_trial_returns_slot() {
        let cb = breaker(1, 10);
        fail_times(&cb, 1);
        tokio::time::advance(Duration::from_millis(10)).await;

        let trial = cb.try_acquire().expect("trial");
        drop(trial);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let trial = cb.try_acquire().expect("slot returned");
        trial.succeed();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_outcomes_do_not_close_open_circuit() {
        let cb = breaker(1, 1_000);
        let early = cb.try_acquire().expect("permit");
        fail_times(&cb, 1);
        early.succeed();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_shares_breakers() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default().with_failure_threshold(1));
        let id: ProviderId = "openai".into();
        let a = registry.get_or_create(&id);
        let b = registry.get_or_create(&id);
        assert!(Arc::ptr_eq(&a, &b));

        a.try_acquire().expect("permit").fail();
        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].state, CircuitState::Open);
        assert!(snapshots[0].retry_after_ms.is_some());
        assert!(registry.get(&"other".into()).is_none());
    }
}
