//! FastGPT protocol.
//!
//! FastGPT exposes an OpenAI-compatible endpoint under `/api/v1`. With
//! `detail: true` the answer chunks are wrapped in `event: answer` frames and
//! interleaved with workflow progress events; the gateway requests
//! `detail: false` but accepts both shapes.

use gateway_core::{
    provider::error_for_status, CompletionRequest, GatewayError, ProviderAdapter, ProviderId,
    ProviderKind, SseFrame, StreamEvent, StreamState, WireRequest,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::endpoint::ProviderEndpoint;
use crate::http::error_message_from_body;
use crate::openai::{openai_messages, parse_chunk_data, parse_completion_body, OpenAIMessage};

/// Workflow events that carry no answer content
const PROGRESS_EVENTS: &[&str] = &[
    "flowNodeStatus",
    "flowResponses",
    "toolCall",
    "toolParams",
    "toolResponse",
    "updateVariables",
    "interactive",
    "workflowDuration",
];

/// FastGPT protocol adapter
#[derive(Debug, Clone)]
pub struct FastGptAdapter {
    endpoint: ProviderEndpoint,
}

impl FastGptAdapter {
    /// Create an adapter
    #[must_use]
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self { endpoint }
    }
}

impl ProviderAdapter for FastGptAdapter {
    fn id(&self) -> &ProviderId {
        &self.endpoint.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::FastGpt
    }

    fn translate_request(&self, request: &CompletionRequest) -> Result<WireRequest, GatewayError> {
        let body = FastGptRequest {
            chat_id: request.session_id.as_deref(),
            stream: request.streaming,
            detail: false,
            messages: openai_messages(request),
        };

        let mut headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        headers.extend(self.endpoint.bearer_header());

        Ok(WireRequest {
            url: self.endpoint.url("/api/v1/chat/completions"),
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

        match frame.event.as_deref() {
            None | Some("answer" | "fastAnswer") => {
                if frame.data.is_empty() {
                    return Ok(Vec::new());
                }
                parse_chunk_data(&self.endpoint.id, &frame.data, state)
            }
            Some("error") => {
                let error: FastGptError = serde_json::from_str(&frame.data).unwrap_or_default();
                Err(GatewayError::provider(
                    self.endpoint.id.as_str(),
                    error.message.unwrap_or_else(|| frame.data.clone()),
                    None,
                    false,
                ))
            }
            Some(event) if PROGRESS_EVENTS.contains(&event) => Ok(Vec::new()),
            Some(event) => {
                trace!(provider = %self.endpoint.id, event, "Ignoring unknown FastGPT event");
                Ok(Vec::new())
            }
        }
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

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FastGptRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    chat_id: Option<&'a str>,
    stream: bool,
    detail: bool,
    messages: Vec<OpenAIMessage<'a>>,
}

#[derive(Debug, Default, Deserialize)]
struct FastGptError {
    #[serde(default)]
    message: Option<String>,
}
