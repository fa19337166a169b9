//! OpenAI chat completions protocol.
//!
//! Streaming responses are `data:` frames carrying `chat.completion.chunk`
//! objects, terminated by `data: [DONE]`. The finish reason arrives in a
//! chunk before `[DONE]`, and with `stream_options.include_usage` a final
//! usage-only chunk follows it.

use gateway_core::{
    provider::error_for_status, CompletionRequest, FinishReason, GatewayError, ProviderAdapter,
    ProviderId, ProviderKind, SseFrame, StreamEvent, StreamState, Usage, WireRequest,
};
use serde::{Deserialize, Serialize};

use crate::endpoint::ProviderEndpoint;
use crate::http::error_message_from_body;

/// Model used when the endpoint does not name one
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// OpenAI protocol adapter
#[derive(Debug, Clone)]
pub struct OpenAIAdapter {
    endpoint: ProviderEndpoint,
}

impl OpenAIAdapter {
    /// Create an adapter
    #[must_use]
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self { endpoint }
    }

    fn model(&self) -> &str {
        self.endpoint.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

impl ProviderAdapter for OpenAIAdapter {
    fn id(&self) -> &ProviderId {
        &self.endpoint.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    fn translate_request(&self, request: &CompletionRequest) -> Result<WireRequest, GatewayError> {
        let body = OpenAIRequest {
            model: self.model(),
            messages: openai_messages(request),
            stream: request.streaming,
            stream_options: request
                .streaming
                .then_some(StreamOptions { include_usage: true }),
            user: Some(request.caller_id.as_str()),
        };

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        headers.extend(self.endpoint.bearer_header());

        Ok(WireRequest {
            url: self.endpoint.url("/v1/chat/completions"),
            headers,
            body: serde_json::to_value(&body)
                .map_err(|e| GatewayError::internal(format!("Failed to encode request: {e}")))?,
            streaming: request.streaming,
        })
    }

    fn parse_stream_chunk(
        &self,
        frame: &SseFrame,
        state: &mut StreamState,
    ) -> Result<Vec<StreamEvent>, GatewayError> {
        if frame.data.is_empty() {
            return Ok(Vec::new());
        }
        parse_chunk_data(&self.endpoint.id, &frame.data, state)
    }

    fn parse_non_stream_response(&self, body: &[u8]) -> Result<Vec<StreamEvent>, GatewayError> {
        parse_completion_body(&self.endpoint.id, body)
    }

    fn parse_error_response(&self, status: u16, body: &[u8]) -> GatewayError {
        error_for_status(
            self.endpoint.id.as_str(),
            status,
            error_message_from_body(body),
        )
    }
}

/// Canonical messages in OpenAI shape
pub(crate) fn openai_messages(request: &CompletionRequest) -> Vec<OpenAIMessage<'_>> {
    request
        .messages
        .iter()
        .map(|m| OpenAIMessage {
            role: m.role.as_str(),
            content: &m.content,
        })
        .collect()
}

/// Parse the `data:` payload of one OpenAI-style chunk
pub(crate) fn parse_chunk_data(
    provider: &ProviderId,
    data: &str,
    state: &mut StreamState,
) -> Result<Vec<StreamEvent>, GatewayError> {
    let data = data.trim();
    if data == "[DONE]" {
        if state.done {
            return Ok(Vec::new());
        }
        return Ok(vec![state.complete()]);
    }

    let chunk: OpenAIChunk = serde_json::from_str(data).map_err(|e| {
        GatewayError::protocol(provider.as_str(), format!("malformed chunk: {e}"))
    })?;

    if let Some(error) = chunk.error {
        return Err(GatewayError::provider(
            provider.as_str(),
            error.message,
            None,
            false,
        ));
    }

    let mut events = Vec::new();
    if let Some(choice) = chunk.choices.into_iter().next() {
        if let Some(text) = choice.delta.and_then(|d| d.content) {
            if !text.is_empty() {
                events.push(StreamEvent::Delta { text });
            }
        }
        if let Some(reason) = choice.finish_reason {
            state.finish_reason = Some(FinishReason::from_provider(&reason));
        }
    }

    if let Some(usage) = chunk.usage {
        let usage = usage.into_usage();
        state.usage = Some(usage);
        events.push(StreamEvent::Usage(usage));
    }

    Ok(events)
}

/// Parse a non-streaming `chat.completion` body into `[usage?, done]`
pub(crate) fn parse_completion_body(
    provider: &ProviderId,
    body: &[u8],
) -> Result<Vec<StreamEvent>, GatewayError> {
    let response: OpenAIResponse = serde_json::from_slice(body).map_err(|e| {
        GatewayError::protocol(provider.as_str(), format!("malformed response: {e}"))
    })?;

    let choice = response.choices.into_iter().next().ok_or_else(|| {
        GatewayError::protocol(provider.as_str(), "response contained no choices")
    })?;

    let mut events = Vec::with_capacity(2);
    if let Some(usage) = response.usage {
        events.push(StreamEvent::Usage(usage.into_usage()));
    }
    events.push(StreamEvent::Done {
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_provider)
            .unwrap_or_default(),
        content: Some(choice.message.content.unwrap_or_default()),
        usage: None,
    });
    Ok(events)
}

// ============================================================================
// OpenAI API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAIMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct OpenAIMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct OpenAIChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
    #[serde(default)]
    error: Option<OpenAIErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Option<ChunkDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
}

impl OpenAIUsage {
    fn into_usage(self) -> Usage {
        let mut usage = Usage::new(self.prompt_tokens, self.completion_tokens);
        usage.total_tokens = usage.total_tokens.max(self.total_tokens);
        usage
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorDetail {
    message: String,
}
