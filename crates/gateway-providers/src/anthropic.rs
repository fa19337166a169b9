//! Anthropic messages protocol.
//!
//! Streaming uses named SSE events. Text arrives in `content_block_delta`,
//! the stop reason and output token count in `message_delta`, and the stream
//! ends with `message_stop`. `ping` frames are heartbeats.

use gateway_core::{
    provider::error_for_status, CompletionRequest, FinishReason, GatewayError, MessageRole,
    ProviderAdapter, ProviderId, ProviderKind, SseFrame, StreamEvent, StreamState, Usage, WireRequest,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::endpoint::ProviderEndpoint;
use crate::http::error_message_from_body;

/// API version header value
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Model used when the endpoint does not name one
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";

/// Output token ceiling sent with every request
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic protocol adapter
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    endpoint: ProviderEndpoint,
    max_tokens: u32,
}

impl AnthropicAdapter {
    /// Create an adapter
    #[must_use]
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self {
            endpoint,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Override the output token ceiling
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn provider(&self) -> &str {
        self.endpoint.id.as_str()
    }

    fn decode<'a, T: Deserialize<'a>>(&self, data: &'a str) -> Result<T, GatewayError> {
        serde_json::from_str(data)
            .map_err(|e| GatewayError::protocol(self.provider(), format!("malformed event: {e}")))
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &ProviderId {
        &self.endpoint.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn translate_request(&self, request: &CompletionRequest) -> Result<WireRequest, GatewayError> {
        let messages: Vec<AnthropicMessage<'_>> = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| AnthropicMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();

        if messages.is_empty() {
            return Err(GatewayError::validation(
                "at least one user or assistant message is required",
                Some("messages".to_string()),
            ));
        }

        let body = AnthropicRequest {
            model: self.endpoint.model.as_deref().unwrap_or(DEFAULT_MODEL),
            max_tokens: self.max_tokens,
            system: request.system_prompt(),
            messages,
            stream: request.streaming,
        };

        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ];
        if let Some(key) = &self.endpoint.api_key {
            headers.push(("x-api-key".to_string(), key.expose_secret().clone()));
        }

        Ok(WireRequest {
            url: self.endpoint.url("/v1/messages"),
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
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        state.event_name.clone_from(&frame.event);
        if frame.data.is_empty() {
            return Ok(Vec::new());
        }

        let event: AnthropicEvent = self.decode(&frame.data)?;
        let name = frame.event.as_deref().unwrap_or(event.kind.as_str());

        match name {
            "message_start" => {
                if let Some(usage) = event.message.and_then(|m| m.usage) {
                    state.usage = Some(Usage::new(usage.input_tokens, usage.output_tokens));
                }
                Ok(Vec::new())
            }
            "content_block_delta" => Ok(event
                .delta
                .and_then(|d| d.text)
                .filter(|t| !t.is_empty())
                .map(|text| vec![StreamEvent::Delta { text }])
                .unwrap_or_default()),
            "message_delta" => {
                if let Some(reason) = event.delta.and_then(|d| d.stop_reason) {
                    state.finish_reason = Some(FinishReason::from_provider(&reason));
                }
                match event.usage {
                    Some(delta_usage) => {
                        let prompt = state.usage.map_or(0, |u| u.prompt_tokens);
                        let usage = Usage::new(prompt, delta_usage.output_tokens);
                        state.usage = Some(usage);
                        Ok(vec![StreamEvent::Usage(usage)])
                    }
                    None => Ok(Vec::new()),
                }
            }
            "message_stop" => {
                if state.done {
                    Ok(Vec::new())
                } else {
                    Ok(vec![state.complete()])
                }
            }
            "error" => {
                let detail = event.error.unwrap_or_default();
                Err(GatewayError::provider(
                    self.provider(),
                    detail.message,
                    None,
                    detail.kind == "overloaded_error",
                ))
            }
            other => {
                // content_block_start/stop, ping and future event types
                trace!(provider = %self.endpoint.id, event = other, "Ignoring Anthropic event");
                Ok(Vec::new())
            }
        }
    }

    fn parse_non_stream_response(&self, body: &[u8]) -> Result<Vec<StreamEvent>, GatewayError> {
        let response: AnthropicResponse = serde_json::from_slice(body)
            .map_err(|e| GatewayError::protocol(self.provider(), format!("malformed response: {e}")))?;

        let content: String = response
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        let mut events = Vec::with_capacity(2);
        if let Some(usage) = response.usage {
            events.push(StreamEvent::Usage(Usage::new(
                usage.input_tokens,
                usage.output_tokens,
            )));
        }
        events.push(StreamEvent::Done {
            finish_reason: response
                .stop_reason
                .as_deref()
                .map(FinishReason::from_provider)
                .unwrap_or_default(),
            content: Some(content),
            usage: None,
        });
        Ok(events)
    }

    fn parse_error_response(&self, status: u16, body: &[u8]) -> GatewayError {
        error_for_status(self.provider(), status, error_message_from_body(body))
    }
}

// ============================================================================
// Anthropic API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnthropicEvent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: Option<EventMessage>,
    #[serde(default)]
    delta: Option<EventDelta>,
    #[serde(default)]
    usage: Option<OutputUsage>,
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct EventMessage {
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct EventDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OutputUsage {
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
