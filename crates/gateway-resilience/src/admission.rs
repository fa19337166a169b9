//! Admission control.
//!
//! Bounds how many requests run at once, globally and per caller. Requests
//! that cannot start immediately wait in a priority queue (higher priority
//! first, FIFO within a priority). A waiter whose caller is at its own
//! ceiling is skipped, so it never blocks other callers behind it.
//!
//! Every admitted request holds a [`QueueTicket`]. The slot is returned
//! exactly once: by an explicit [`QueueTicket::release`], or on drop.

use gateway_core::{CallerId, GatewayError, Priority};
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Admission configuration
#[derive(Debug, Clone)]
pub struct AdmissionConfig {
    /// Global concurrency ceiling
    pub max_concurrent: usize,
    /// Per-caller concurrency ceiling
    pub per_caller_limit: Option<usize>,
    /// Longest a request may wait for a slot
    pub max_wait: Duration,
    /// Waiters beyond this are rejected immediately
    pub max_queue_depth: Option<usize>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 256,
            per_caller_limit: None,
            max_wait: Duration::from_secs(30),
            max_queue_depth: None,
        }
    }
}

impl AdmissionConfig {
    /// Create a config with a global ceiling
    #[must_use]
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            ..Self::default()
        }
    }

    /// Set the per-caller ceiling
    #[must_use]
    pub fn with_per_caller_limit(mut self, limit: usize) -> Self {
        self.per_caller_limit = Some(limit.max(1));
        self
    }

    /// Set the maximum wait
    #[must_use]
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Set the maximum queue depth
    #[must_use]
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = Some(depth);
        self
    }
}

type WaitKey = (Reverse<Priority>, u64);

#[derive(Debug)]
struct Waiter {
    caller_id: CallerId,
    grant: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct State {
    in_flight: usize,
    per_caller: HashMap<CallerId, usize>,
    waiters: BTreeMap<WaitKey, Waiter>,
    next_seq: u64,
}

#[derive(Debug)]
struct Shared {
    config: AdmissionConfig,
    state: Mutex<State>,
}

impl Shared {
    fn caller_has_room(&self, state: &State, caller: &CallerId) -> bool {
        self.config
            .per_caller_limit
            .map_or(true, |limit| state.per_caller.get(caller).copied().unwrap_or(0) < limit)
    }

    fn can_admit(&self, state: &State, caller: &CallerId) -> bool {
        state.in_flight < self.config.max_concurrent && self.caller_has_room(state, caller)
    }

    fn occupy(state: &mut State, caller: &CallerId) {
        state.in_flight += 1;
        *state.per_caller.entry(caller.clone()).or_insert(0) += 1;
    }

    fn vacate(state: &mut State, caller: &CallerId) {
        debug_assert!(state.in_flight > 0, "admission counter released below zero");
        state.in_flight = state.in_flight.saturating_sub(1);
        if let Some(count) = state.per_caller.get_mut(caller) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_caller.remove(caller);
            }
        }
    }

    /// Hand free slots to eligible waiters, best first
    fn dispatch(&self, state: &mut State) {
        loop {
            if state.in_flight >= self.config.max_concurrent {
                return;
            }
            let next = state
                .waiters
                .iter()
                .find(|(_, waiter)| self.caller_has_room(state, &waiter.caller_id))
                .map(|(key, _)| *key);
            let Some(key) = next else { return };
            let Some(waiter) = state.waiters.remove(&key) else { return };

            Self::occupy(state, &waiter.caller_id);
            if waiter.grant.send(()).is_err() {
                // waiter vanished without withdrawing
                Self::vacate(state, &waiter.caller_id);
            }
        }
    }

    fn release_slot(&self, caller: &CallerId) {
        let mut state = self.state.lock();
        Self::vacate(&mut state, caller);
        self.dispatch(&mut state);
    }
}

/// Admission controller; cheap to clone
#[derive(Debug, Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    /// Create a controller
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.config
    }

    /// Wait for an execution slot.
    ///
    /// Dropping the returned future gives up the place in line; a slot
    /// granted to a dropped waiter is returned.
    ///
    /// # Errors
    /// `QueueTimeout` after `max_wait`, `QueueFull` when the wait queue is at
    /// `max_queue_depth`
    pub async fn enqueue(
        &self,
        caller_id: CallerId,
        priority: Priority,
    ) -> Result<QueueTicket, GatewayError> {
        let enqueued_at = Instant::now();

        let (key, rx) = {
            let mut state = self.shared.state.lock();
            if self.shared.can_admit(&state, &caller_id) {
                Shared::occupy(&mut state, &caller_id);
                drop(state);
                return Ok(self.ticket(caller_id, priority, enqueued_at));
            }

            if let Some(depth) = self.shared.config.max_queue_depth {
                if state.waiters.len() >= depth {
                    warn!(caller = %caller_id, depth, "Admission queue full");
                    return Err(GatewayError::QueueFull { capacity: depth });
                }
            }

            let (tx, rx) = oneshot::channel();
            let key = (Reverse(priority), state.next_seq);
            state.next_seq += 1;
            state.waiters.insert(
                key,
                Waiter {
                    caller_id: caller_id.clone(),
                    grant: tx,
                },
            );
            debug!(caller = %caller_id, priority = %priority, queued = state.waiters.len(), "Request queued");
            (key, rx)
        };

        let mut guard = WaitGuard {
            shared: Arc::clone(&self.shared),
            key,
            caller_id: caller_id.clone(),
            rx,
            done: false,
        };

        // the guard keeps the receiver alive until the withdraw decision,
        // so a grant racing the timeout is never lost
        let outcome = tokio::time::timeout(self.shared.config.max_wait, &mut guard.rx).await;
        let granted = match outcome {
            Ok(Ok(())) => {
                guard.done = true;
                true
            }
            Ok(Err(_)) | Err(_) => guard.withdraw(),
        };

        if granted {
            Ok(self.ticket(caller_id, priority, enqueued_at))
        } else {
            let waited = enqueued_at.elapsed();
            debug!(caller = %caller_id, waited_ms = waited.as_millis() as u64, "Admission wait timed out");
            Err(GatewayError::queue_timeout(waited))
        }
    }

    /// Release a ticket; later calls are no-ops
    pub fn release(&self, ticket: &QueueTicket) {
        ticket.release();
    }

    /// Current occupancy
    #[must_use]
    pub fn stats(&self) -> AdmissionStats {
        let state = self.shared.state.lock();
        AdmissionStats {
            in_flight: state.in_flight,
            queued: state.waiters.len(),
            max_concurrent: self.shared.config.max_concurrent,
            active_callers: state.per_caller.len(),
        }
    }

    fn ticket(&self, caller_id: CallerId, priority: Priority, enqueued_at: Instant) -> QueueTicket {
        QueueTicket {
            shared: Arc::clone(&self.shared),
            caller_id,
            priority,
            enqueued_at,
            admitted_at: Instant::now(),
            released: AtomicBool::new(false),
        }
    }
}

struct WaitGuard {
    shared: Arc<Shared>,
    key: WaitKey,
    caller_id: CallerId,
    rx: oneshot::Receiver<()>,
    done: bool,
}

impl WaitGuard {
    /// Leave the queue. Returns `true` if a slot had already been granted,
    /// in which case the caller now owns it.
    fn withdraw(&mut self) -> bool {
        self.done = true;
        let mut state = self.shared.state.lock();
        if state.waiters.remove(&self.key).is_some() {
            return false;
        }
        // dispatch removed us and sent under this same lock
        self.rx.try_recv().is_ok()
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if !self.done && self.withdraw() {
            self.shared.release_slot(&self.caller_id);
        }
    }
}

/// An admitted request's slot
#[derive(Debug)]
pub struct QueueTicket {
    shared: Arc<Shared>,
    caller_id: CallerId,
    priority: Priority,
    enqueued_at: Instant,
    admitted_at: Instant,
    released: AtomicBool,
}

impl QueueTicket {
    /// Caller holding the slot
    #[must_use]
    pub fn caller_id(&self) -> &CallerId {
        &self.caller_id
    }

    /// Priority the request was queued with
    #[must_use]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// When the request asked for a slot
    #[must_use]
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// When the slot was granted
    #[must_use]
    pub fn admitted_at(&self) -> Instant {
        self.admitted_at
    }

    /// Time spent waiting
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        self.admitted_at.saturating_duration_since(self.enqueued_at)
    }

    /// Whether the slot has been returned
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Return the slot. Idempotent.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.shared.release_slot(&self.caller_id);
        }
    }
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.release();
    }
}

/// Admission occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionStats {
    /// Admitted and not yet released
    pub in_flight: usize,
    /// Waiting for a slot
    pub queued: usize,
    /// Global ceiling
    pub max_concurrent: usize,
    /// Callers holding at least one slot
    pub active_callers: usize,
}
