//! Provider attempt records.

use crate::error::{ErrorCode, GatewayError};
use crate::types::ProviderId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of one provider attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Provider produced output and finished
    Succeeded,
    /// Provider call failed
    Failed {
        /// Error code
        code: ErrorCode,
        /// Error message
        message: String,
        /// Whether the retry controller considered it transient
        retryable: bool,
    },
    /// Provider was skipped because its circuit was open
    SkippedCircuitOpen,
}

impl AttemptOutcome {
    /// Build a failed outcome from an error
    #[must_use]
    pub fn failed(error: &GatewayError) -> Self {
        Self::Failed {
            code: error.code(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }

    /// Short label used for metrics and audit events
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::SkippedCircuitOpen => "skipped_circuit_open",
        }
    }
}

/// A single immutable attempt record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAttempt {
    /// Provider that was tried
    pub provider_id: ProviderId,
    /// 1-based attempt number within the request
    pub attempt_number: u32,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// How it ended
    pub outcome: AttemptOutcome,
    /// Wall-clock latency in milliseconds
    pub latency_ms: u64,
}

/// Append-only, shareable attempt history for one request
#[derive(Debug, Clone, Default)]
pub struct AttemptHistory {
    inner: Arc<Mutex<Vec<ProviderAttempt>>>,
}

impl AttemptHistory {
    /// Create an empty history
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number assigned to the next record
    #[must_use]
    pub fn next_attempt_number(&self) -> u32 {
        self.inner.lock().len() as u32 + 1
    }

    /// Append a record, assigning its attempt number.
    ///
    /// Returns a copy of the stored record.
    pub fn record(
        &self,
        provider_id: ProviderId,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        latency_ms: u64,
    ) -> ProviderAttempt {
        let mut attempts = self.inner.lock();
        let attempt = ProviderAttempt {
            provider_id,
            attempt_number: attempts.len() as u32 + 1,
            started_at,
            outcome,
            latency_ms,
        };
        attempts.push(attempt.clone());
        attempt
    }

    /// Snapshot of all records so far
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProviderAttempt> {
        self.inner.lock().clone()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no attempt has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Attempts made against one provider
    #[must_use]
    pub fn count_for(&self, provider: &ProviderId) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|a| &a.provider_id == provider)
            .count()
    }
}
