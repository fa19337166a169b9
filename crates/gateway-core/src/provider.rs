//! Provider capability interfaces.
//!
//! Two seams live here:
//!
//! - [`ProviderAdapter`] is the flat, synchronous protocol translation layer.
//!   One implementation exists per backend protocol and it never touches the
//!   network.
//! - [`CompletionProvider`] is what the orchestrator calls: it starts a
//!   provider call and yields canonical events. The HTTP implementation pairs
//!   an adapter with a transport; tests substitute scripted providers.

use crate::error::GatewayError;
use crate::request::CompletionRequest;
use crate::streaming::{FinishReason, StreamEvent, Usage};
use crate::types::ProviderId;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stream of canonical events produced by one provider attempt
pub type ProviderStream = BoxStream<'static, Result<StreamEvent, GatewayError>>;

/// Supported backend protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI chat completions
    #[serde(rename = "openai")]
    OpenAI,
    /// Anthropic messages
    Anthropic,
    /// FastGPT (OpenAI-compatible with workflow events)
    #[serde(rename = "fastgpt")]
    FastGpt,
    /// Dify chat-messages
    Dify,
}

impl ProviderKind {
    /// Canonical lowercase name
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAI => "openai",
            Self::Anthropic => "anthropic",
            Self::FastGpt => "fastgpt",
            Self::Dify => "dify",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider-native HTTP request produced by an adapter
#[derive(Clone)]
pub struct WireRequest {
    /// Absolute endpoint URL
    pub url: String,
    /// Request headers
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: serde_json::Value,
    /// Whether the provider was asked to stream
    pub streaming: bool,
}

impl WireRequest {
    /// Look up a header value (case-insensitive)
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

const SENSITIVE_HEADERS: &[&str] = &["authorization", "x-api-key", "api-key"];

impl fmt::Debug for WireRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(k, v)| {
                if SENSITIVE_HEADERS.iter().any(|s| k.eq_ignore_ascii_case(s)) {
                    (k.as_str(), "[REDACTED]")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();

        f.debug_struct("WireRequest")
            .field("url", &self.url)
            .field("headers", &headers)
            .field("body", &self.body)
            .field("streaming", &self.streaming)
            .finish()
    }
}

/// One server-sent event as delivered to an adapter.
///
/// The transport does the framing; adapters only see complete events.
/// `event` is `None` for unnamed events (the SSE default type `message`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: String,
}

impl SseFrame {
    /// An unnamed event carrying `data`
    #[must_use]
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// A named event carrying `data`
    #[must_use]
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        let event = event.into();
        Self {
            event: (!event.is_empty() && event != "message").then_some(event),
            data: data.into(),
        }
    }

    /// Whether the event carries nothing (keep-alives)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.data.is_empty()
    }
}

/// Per-attempt scratch state threaded through stream parsing.
///
/// Some providers report the finish reason and the end-of-stream marker in
/// separate frames, and some name the event on an `event:` line instead of
/// inside the payload.
#[derive(Debug, Clone, Default)]
pub struct StreamState {
    /// Finish reason seen but not yet emitted
    pub finish_reason: Option<FinishReason>,
    /// Name of the most recent SSE event
    pub event_name: Option<String>,
    /// Usage reported so far
    pub usage: Option<Usage>,
    /// Whether the terminal event has already been produced
    pub done: bool,
}

impl StreamState {
    /// Build the terminal `done` event and mark the stream finished
    pub fn complete(&mut self) -> StreamEvent {
        self.done = true;
        StreamEvent::done(self.finish_reason.take().unwrap_or_default())
    }
}

/// Flat per-provider protocol capability
pub trait ProviderAdapter: Send + Sync + 'static {
    /// Provider instance ID
    fn id(&self) -> &ProviderId;

    /// Protocol family
    fn kind(&self) -> ProviderKind;

    /// Translate a canonical request into the provider's wire format
    fn translate_request(&self, request: &CompletionRequest) -> Result<WireRequest, GatewayError>;

    /// Parse one server-sent event into zero or more canonical events.
    ///
    /// Heartbeats and progress frames yield an empty vector. Malformed frames
    /// yield `GatewayError::Protocol`.
    fn parse_stream_chunk(
        &self,
        frame: &SseFrame,
        state: &mut StreamState,
    ) -> Result<Vec<StreamEvent>, GatewayError>;

    /// Called once the response body ends.
    ///
    /// Emits the terminal `done` if the provider signalled completion and it
    /// was not produced yet; fails with a protocol error otherwise.
    fn finish_stream(&self, state: &mut StreamState) -> Result<Vec<StreamEvent>, GatewayError> {
        if state.done {
            return Ok(Vec::new());
        }
        if state.finish_reason.is_some() {
            return Ok(vec![state.complete()]);
        }
        Err(GatewayError::protocol(
            self.id().as_str(),
            "stream ended without a completion signal",
        ))
    }

    /// Parse a complete non-streaming response body into `[usage?, done]`
    fn parse_non_stream_response(&self, body: &[u8]) -> Result<Vec<StreamEvent>, GatewayError>;

    /// Map a non-2xx response to the error taxonomy
    fn parse_error_response(&self, status: u16, body: &[u8]) -> GatewayError;
}

/// Classify an HTTP failure status: 408, 429 and 5xx are transient
#[must_use]
pub fn error_for_status(provider: &str, status: u16, message: impl Into<String>) -> GatewayError {
    let retryable = matches!(status, 408 | 429) || (500..600).contains(&status);
    GatewayError::provider(provider, message, Some(status), retryable)
}

/// Something that can run one completion attempt against a backend
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider instance ID
    fn id(&self) -> &ProviderId;

    /// Protocol family
    fn kind(&self) -> ProviderKind;

    /// Start a completion.
    ///
    /// Connection and HTTP status failures are returned directly; failures
    /// after the response began arrive as stream items.
    async fn start(&self, request: &CompletionRequest) -> Result<ProviderStream, GatewayError>;
}
