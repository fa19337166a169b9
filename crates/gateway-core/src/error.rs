//! Error taxonomy and the public error surface.
//!
//! `GatewayError` is the single error type flowing between gateway
//! components. Every variant maps onto a stable public [`ErrorCode`] and a
//! `retriable` flag so clients can react without parsing messages.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable error codes exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Caller exceeded its request rate
    RateLimited,
    /// Request waited too long for an admission slot
    QueueTimeout,
    /// Provider circuit is open
    CircuitOpen,
    /// Every candidate provider failed or was skipped
    AllProvidersUnavailable,
    /// Provider emitted malformed framing
    ProtocolError,
    /// Request was cancelled by the caller
    Cancelled,
    /// Malformed request
    InvalidRequest,
    /// Upstream provider failed after streaming had begun
    ProviderError,
    /// Unexpected internal failure
    InternalError,
}

impl ErrorCode {
    /// Wire representation of the code
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "RATE_LIMITED",
            Self::QueueTimeout => "QUEUE_TIMEOUT",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::AllProvidersUnavailable => "ALL_PROVIDERS_UNAVAILABLE",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway error type
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Malformed caller input
    #[error("Validation error: {message}")]
    Validation {
        /// Error message
        message: String,
        /// Offending field, if known
        field: Option<String>,
    },

    /// Caller exceeded its sliding-window quota
    #[error("Rate limit exceeded")]
    RateLimited {
        /// Suggested wait before retrying
        retry_after: Option<Duration>,
        /// The limit that was exceeded
        limit: Option<u32>,
    },

    /// Admission wait exceeded the configured maximum
    #[error("Timed out after {waited:?} waiting for an admission slot")]
    QueueTimeout {
        /// How long the request waited
        waited: Duration,
    },

    /// Admission wait queue is full
    #[error("Admission queue is full ({capacity} waiting)")]
    QueueFull {
        /// Configured queue depth
        capacity: usize,
    },

    /// Provider circuit breaker is open
    #[error("Circuit breaker open for provider: {provider}")]
    CircuitOpen {
        /// Provider ID
        provider: String,
        /// Time until the next trial is allowed
        retry_after: Option<Duration>,
    },

    /// No provider could serve the request
    #[error("All providers unavailable after {attempted} attempt(s)")]
    AllProvidersUnavailable {
        /// Number of attempts and skips made
        attempted: usize,
        /// Description of the last failure
        last_error: Option<String>,
    },

    /// Provider framing could not be parsed
    #[error("Protocol error from {provider}: {message}")]
    Protocol {
        /// Provider ID
        provider: String,
        /// Error message
        message: String,
    },

    /// Provider returned an error response
    #[error("Provider {provider} error: {message}")]
    Provider {
        /// Provider ID
        provider: String,
        /// Error message
        message: String,
        /// HTTP status code, if any
        status_code: Option<u16>,
        /// Whether the failure is transient
        retryable: bool,
    },

    /// Provider call exceeded its deadline
    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout {
        /// Provider ID
        provider: String,
        /// Deadline that elapsed
        timeout: Duration,
    },

    /// Connection to the provider failed or was reset
    #[error("Connection to {provider} failed: {message}")]
    Connection {
        /// Provider ID
        provider: String,
        /// Error message
        message: String,
    },

    /// Request was cancelled by the caller
    #[error("Request cancelled")]
    Cancelled,

    /// Invalid gateway configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// Unexpected internal error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl GatewayError {
    /// Create a validation error
    #[must_use]
    pub fn validation(message: impl Into<String>, field: Option<String>) -> Self {
        Self::Validation {
            message: message.into(),
            field,
        }
    }

    /// Create a rate limit error
    #[must_use]
    pub fn rate_limited(retry_after: Option<Duration>, limit: Option<u32>) -> Self {
        Self::RateLimited { retry_after, limit }
    }

    /// Create a queue timeout error
    #[must_use]
    pub fn queue_timeout(waited: Duration) -> Self {
        Self::QueueTimeout { waited }
    }

    /// Create a circuit open error
    #[must_use]
    pub fn circuit_open(provider: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::CircuitOpen {
            provider: provider.into(),
            retry_after,
        }
    }

    /// Create an exhaustion error
    #[must_use]
    pub fn all_providers_unavailable(attempted: usize, last_error: Option<&Self>) -> Self {
        Self::AllProvidersUnavailable {
            attempted,
            last_error: last_error.map(ToString::to_string),
        }
    }

    /// Create a protocol error
    #[must_use]
    pub fn protocol(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a provider error
    #[must_use]
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
        retryable: bool,
    ) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
            retryable,
        }
    }

    /// Create a provider timeout error
    #[must_use]
    pub fn timeout(provider: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            provider: provider.into(),
            timeout,
        }
    }

    /// Create a connection error
    #[must_use]
    pub fn connection(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Rebuild the error behind an `error` event a provider stream produced
    #[must_use]
    pub fn from_event(provider: &str, code: ErrorCode, message: String, retriable: bool) -> Self {
        match code {
            ErrorCode::ProtocolError => Self::protocol(provider, message),
            ErrorCode::Cancelled => Self::Cancelled,
            _ => Self::provider(provider, message, None, retriable),
        }
    }

    /// Public error code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::InvalidRequest,
            Self::RateLimited { .. } => ErrorCode::RateLimited,
            Self::QueueTimeout { .. } | Self::QueueFull { .. } => ErrorCode::QueueTimeout,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::AllProvidersUnavailable { .. } => ErrorCode::AllProvidersUnavailable,
            Self::Protocol { .. } => ErrorCode::ProtocolError,
            Self::Provider { .. } | Self::Timeout { .. } | Self::Connection { .. } => {
                ErrorCode::ProviderError
            }
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Configuration { .. } | Self::Internal { .. } => ErrorCode::InternalError,
        }
    }

    /// Whether the retry controller may repeat the same provider call.
    ///
    /// Only transient transport failures qualify: timeouts, resets, and
    /// provider responses flagged retryable (5xx, 429, 408). Protocol errors
    /// are never retried against the same provider.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            Self::Timeout { .. } | Self::Connection { .. } => true,
            _ => false,
        }
    }

    /// Whether a client may reasonably retry the whole request later
    #[must_use]
    pub fn client_retriable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::QueueTimeout { .. }
            | Self::QueueFull { .. }
            | Self::CircuitOpen { .. }
            | Self::AllProvidersUnavailable { .. }
            | Self::Protocol { .. }
            | Self::Timeout { .. }
            | Self::Connection { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Validation { .. }
            | Self::Cancelled
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Whether this failure should count toward tripping a provider circuit.
    ///
    /// Caller-caused 4xx responses and cancellations say nothing about the
    /// provider's health.
    #[must_use]
    pub fn counts_against_provider(&self) -> bool {
        match self {
            Self::Provider { status_code, .. } => {
                !matches!(status_code, Some(400 | 404 | 413 | 422))
            }
            Self::Protocol { .. } | Self::Timeout { .. } | Self::Connection { .. } => true,
            _ => false,
        }
    }

    /// Retry-after hint, if the error carries one
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::CircuitOpen { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Public error body
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code(),
            message: self.to_string(),
            retriable: self.client_retriable(),
        }
    }
}

/// Public error payload: `{code, message, retriable}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable error code
    pub code: ErrorCode,
    /// Human-readable message
    pub message: String,
    /// Whether the client may retry
    pub retriable: bool,
}
