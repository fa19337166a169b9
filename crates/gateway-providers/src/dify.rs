//! Dify chat-messages protocol.
//!
//! Dify takes a single `query` rather than a message list and streams
//! `data:` frames whose payload names the event: `message` or
//! `agent_message` carry answer text, `message_end` carries usage and ends
//! the stream, and workflow/node events report progress only.

use gateway_core::{
    provider::error_for_status, CompletionRequest, FinishReason, GatewayError, ProviderAdapter,
    ProviderId, ProviderKind, SseFrame, StreamEvent, StreamState, Usage, WireRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::trace;

use crate::endpoint::ProviderEndpoint;
use crate::http::error_message_from_body;

/// Dify protocol adapter
#[derive(Debug, Clone)]
pub struct DifyAdapter {
    endpoint: ProviderEndpoint,
}

impl DifyAdapter {
    /// Create an adapter
    #[must_use]
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self { endpoint }
    }

    fn provider(&self) -> &str {
        self.endpoint.id.as_str()
    }
}

impl ProviderAdapter for DifyAdapter {
    fn id(&self) -> &ProviderId {
        &self.endpoint.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Dify
    }

    fn translate_request(&self, request: &CompletionRequest) -> Result<WireRequest, GatewayError> {
        let query = request.last_user_message().ok_or_else(|| {
            GatewayError::validation(
                "a user message is required",
                Some("messages".to_string()),
            )
        })?;

        let body = DifyRequest {
            inputs: json!({}),
            query,
            response_mode: if request.streaming { "streaming" } else { "blocking" },
            user: request.caller_id.as_str(),
            conversation_id: "",
        };

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        headers.extend(self.endpoint.bearer_header());

        Ok(WireRequest {
            url: self.endpoint.url("/v1/chat-messages"),
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

        let event: DifyEvent = serde_json::from_str(&frame.data)
            .map_err(|e| GatewayError::protocol(self.provider(), format!("malformed event: {e}")))?;
        state.event_name = Some(event.event.clone());

        match event.event.as_str() {
            "message" | "agent_message" => Ok(event
                .answer
                .filter(|a| !a.is_empty())
                .map(|text| vec![StreamEvent::Delta { text }])
                .unwrap_or_default()),
            "message_end" => {
                let mut events = Vec::with_capacity(2);
                if let Some(usage) = event.metadata.and_then(|m| m.usage) {
                    let usage = usage.into_usage();
                    state.usage = Some(usage);
                    events.push(StreamEvent::Usage(usage));
                }
                if !state.done {
                    state.finish_reason.get_or_insert(FinishReason::Stop);
                    events.push(state.complete());
                }
                Ok(events)
            }
            "error" => Err(GatewayError::provider(
                self.provider(),
                event.message.unwrap_or_else(|| "stream error".to_string()),
                event.status,
                event.status.is_some_and(|s| s == 429 || s >= 500),
            )),
            other => {
                // ping, workflow_*, node_*, agent_thought, message_file, tts_*
                trace!(provider = %self.endpoint.id, event = other, "Ignoring Dify event");
                Ok(Vec::new())
            }
        }
    }

    fn parse_non_stream_response(&self, body: &[u8]) -> Result<Vec<StreamEvent>, GatewayError> {
        let response: DifyBlockingResponse = serde_json::from_slice(body)
            .map_err(|e| GatewayError::protocol(self.provider(), format!("malformed response: {e}")))?;

        let mut events = Vec::with_capacity(2);
        if let Some(usage) = response.metadata.and_then(|m| m.usage) {
            events.push(StreamEvent::Usage(usage.into_usage()));
        }
        events.push(StreamEvent::Done {
            finish_reason: FinishReason::Stop,
            content: Some(response.answer),
            usage: None,
        });
        Ok(events)
    }

    fn parse_error_response(&self, status: u16, body: &[u8]) -> GatewayError {
        error_for_status(self.provider(), status, error_message_from_body(body))
    }
}

// ============================================================================
// Dify API Types
// ============================================================================

#[derive(Debug, Serialize)]
struct DifyRequest<'a> {
    inputs: serde_json::Value,
    query: &'a str,
    response_mode: &'static str,
    user: &'a str,
    conversation_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct DifyEvent {
    event: String,
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    metadata: Option<DifyMetadata>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DifyMetadata {
    #[serde(default)]
    usage: Option<DifyUsage>,
}

#[derive(Debug, Deserialize)]
struct DifyUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl DifyUsage {
    fn into_usage(self) -> Usage {
        Usage::new(self.prompt_tokens, self.completion_tokens)
    }
}

#[derive(Debug, Deserialize)]
struct DifyBlockingResponse {
    #[serde(default)]
    answer: String,
    #[serde(default)]
    metadata: Option<DifyMetadata>,
}
