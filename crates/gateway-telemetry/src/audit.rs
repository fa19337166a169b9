//! Audit events.
//!
//! Every provider attempt and every request's terminal state produces one
//! [`AuditEvent`]. Publishing never blocks the request path: the channel
//! sink uses `try_send` and counts what it has to drop.

use chrono::{DateTime, Utc};
use gateway_core::ErrorCode;
use parking_lot::Mutex;
use prometheus::IntCounter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What an [`AuditEvent`] records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// One call to a provider finished
    ProviderAttempt,
    /// A provider was skipped because its circuit was open
    ProviderSkipped,
    /// A request reached a terminal state
    RequestTerminal,
}

impl AuditEventType {
    /// Wire name, identical to the serde form
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ProviderAttempt => "provider_attempt",
            Self::ProviderSkipped => "provider_skipped",
            Self::RequestTerminal => "request_terminal",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the audited step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// Completed normally
    Success,
    /// Upstream or protocol failure
    Failure,
    /// Action refused before doing work (rate limit, queue, open circuit)
    Denied,
    /// Caller went away
    Cancelled,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Denied => "denied",
            Self::Cancelled => "cancelled",
        })
    }
}

/// One audited step of a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Random v4 UUID
    pub id: String,
    /// When the event was built
    pub timestamp: DateTime<Utc>,
    /// Kind of step
    pub event_type: AuditEventType,
    /// How it ended
    pub outcome: AuditOutcome,
    /// Correlates events of one request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Caller the request belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<String>,
    /// Provider involved, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Error code for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Human-readable summary, defaulting to the event type
    pub description: String,
    /// Free-form details such as latency or retry delay
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Incremental construction of an [`AuditEvent`]; outcome defaults to success
#[derive(Debug)]
pub struct AuditEventBuilder {
    event_type: AuditEventType,
    outcome: AuditOutcome,
    request_id: Option<String>,
    caller_id: Option<String>,
    provider_id: Option<String>,
    error_code: Option<ErrorCode>,
    description: Option<String>,
    metadata: HashMap<String, serde_json::Value>,
}

impl AuditEventBuilder {
    /// Start an event of `event_type`
    #[must_use]
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            outcome: AuditOutcome::Success,
            request_id: None,
            caller_id: None,
            provider_id: None,
            error_code: None,
            description: None,
            metadata: HashMap::new(),
        }
    }

    /// Record the outcome
    #[must_use]
    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    /// Record the request id
    #[must_use]
    pub fn request_id(mut self, id: impl ToString) -> Self {
        self.request_id = Some(id.to_string());
        self
    }

    /// Record the caller id
    #[must_use]
    pub fn caller_id(mut self, id: impl ToString) -> Self {
        self.caller_id = Some(id.to_string());
        self
    }

    /// Record the provider id
    #[must_use]
    pub fn provider_id(mut self, id: impl ToString) -> Self {
        self.provider_id = Some(id.to_string());
        self
    }

    /// Record the error code
    #[must_use]
    pub fn error_code(mut self, code: ErrorCode) -> Self {
        self.error_code = Some(code);
        self
    }

    /// Record the description
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach a serializable value; values that fail to serialize are dropped
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(json_value) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), json_value);
        }
        self
    }

    /// Stamp id and timestamp
    #[must_use]
    pub fn build(self) -> AuditEvent {
        AuditEvent {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: self.event_type,
            outcome: self.outcome,
            request_id: self.request_id,
            caller_id: self.caller_id,
            provider_id: self.provider_id,
            error_code: self.error_code,
            description: self.description.unwrap_or_else(|| self.event_type.to_string()),
            metadata: self.metadata,
        }
    }
}

/// Destination for audit events. `publish` must never block.
pub trait AuditSink: Send + Sync + 'static {
    /// Hand off an event
    fn publish(&self, event: AuditEvent);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn publish(&self, _event: AuditEvent) {}
}

/// Keeps events in memory; for tests and debugging
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Events of one type
    #[must_use]
    pub fn events_of(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn publish(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}

/// Bounded channel drained by a background worker that writes each event
/// to the `audit` tracing target
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
    dropped: Arc<AtomicU64>,
    dropped_counter: Option<IntCounter>,
}

impl ChannelAuditSink {
    /// Start the worker. Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(buffer.max(1));
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => info!(
                        target: "audit",
                        event_type = %event.event_type,
                        outcome = %event.outcome,
                        request_id = event.request_id.as_deref().unwrap_or(""),
                        event = %json,
                        "{}",
                        event.description
                    ),
                    Err(e) => warn!(error = %e, "Failed to serialize audit event"),
                }
            }
            debug!("Audit worker stopped");
        });

        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
                dropped_counter: None,
            },
            worker,
        )
    }

    /// Also count drops on a Prometheus counter
    #[must_use]
    pub fn with_drop_counter(mut self, counter: IntCounter) -> Self {
        self.dropped_counter = Some(counter);
        self
    }

    /// Events dropped because the channel was full or closed
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl AuditSink for ChannelAuditSink {
    fn publish(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(counter) = &self.dropped_counter {
                counter.inc();
            }
            if total.is_power_of_two() {
                warn!(dropped = total, "Audit sink full; dropping events");
            }
        }
    }
}
