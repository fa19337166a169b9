//! Canonical stream events.
//!
//! Every provider's wire framing is normalized into a sequence of
//! [`StreamEvent`]s. A well-formed sequence contains any number of `Delta`
//! and `Usage` events followed by exactly one terminal `Done` or `Error`.

use crate::error::{ErrorCode, GatewayError};
use serde::{Deserialize, Serialize};

/// A single canonical stream event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental content
    Delta {
        /// Text fragment
        text: String,
    },
    /// Token usage report
    Usage(Usage),
    /// Successful end of the sequence
    Done {
        /// Why generation stopped
        finish_reason: FinishReason,
        /// Full content, set only for aggregated (non-streaming) responses
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        /// Final usage, set only for aggregated (non-streaming) responses
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    /// Failed end of the sequence
    Error {
        /// Stable error code
        code: ErrorCode,
        /// Human-readable message
        message: String,
        /// Whether the client may retry
        retriable: bool,
    },
}

impl StreamEvent {
    /// Create a delta event
    #[must_use]
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta { text: text.into() }
    }

    /// Create a bare done event
    #[must_use]
    pub fn done(finish_reason: FinishReason) -> Self {
        Self::Done {
            finish_reason,
            content: None,
            usage: None,
        }
    }

    /// Convert an error into a terminal event
    #[must_use]
    pub fn from_error(error: &GatewayError) -> Self {
        Self::Error {
            code: error.code(),
            message: error.to_string(),
            retriable: error.client_retriable(),
        }
    }

    /// Whether this event ends the sequence
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. } | Self::Error { .. })
    }

    /// SSE event name
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::Usage(_) => "usage",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// Reason generation finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural stop
    #[default]
    Stop,
    /// Token limit reached
    Length,
    /// Content was filtered by the provider
    ContentFilter,
    /// Model requested a tool call
    ToolCalls,
}

impl FinishReason {
    /// Map a provider-specific reason string.
    ///
    /// Unknown reasons collapse to `Stop`.
    #[must_use]
    pub fn from_provider(reason: &str) -> Self {
        match reason {
            "length" | "max_tokens" => Self::Length,
            "content_filter" | "safety" => Self::ContentFilter,
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCalls,
            _ => Self::Stop,
        }
    }
}

/// Token usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub prompt_tokens: u32,
    /// Completion tokens
    pub completion_tokens: u32,
    /// Total tokens
    pub total_tokens: u32,
}

impl Usage {
    /// Create usage, deriving the total
    #[must_use]
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Merge a later report into this one, keeping the larger counts
    pub fn merge(&mut self, other: &Self) {
        self.prompt_tokens = self.prompt_tokens.max(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(other.completion_tokens);
        self.total_tokens = self
            .total_tokens
            .max(other.total_tokens)
            .max(self.prompt_tokens.saturating_add(self.completion_tokens));
    }
}
