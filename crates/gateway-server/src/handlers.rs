//! HTTP request handlers for the gateway API.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, StreamExt};
use gateway_core::{
    CallerId, ChatMessage, CompletionRequest, FinishReason, GatewayError, Priority, ProviderId,
    StreamEvent, Usage,
};
use gateway_resilience::{AdmissionStats, CircuitSnapshot};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use tracing::{debug, error, instrument};

use crate::{
    error::ApiError,
    extractors::{CallerHeader, JsonBody, RequestId},
    state::AppState,
};

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Version
    pub version: String,
    /// Uptime in seconds
    pub uptime_seconds: u64,
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime_seconds(),
    })
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let provider_count = state.gateway.orchestrator().registry().len();

    if provider_count > 0 {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "no providers available")
    }
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics_endpoint(State(state): State<AppState>) -> Result<Response, ApiError> {
    let Some(metrics) = &state.metrics else {
        return Err(ApiError::internal("metrics are disabled"));
    };
    let body = metrics.render().map_err(|e| {
        error!(error = %e, "Failed to render metrics");
        ApiError::internal("failed to render metrics")
    })?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

/// Circuit state per provider
pub async fn circuit_status(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    let mut snapshots = state.gateway.orchestrator().breakers().snapshots();
    snapshots.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
    Json(snapshots)
}

/// Admission queue occupancy
pub async fn admission_status(State(state): State<AppState>) -> Json<AdmissionStats> {
    Json(state.gateway.admission().stats())
}

/// Completion request body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionBody {
    /// Caller identity; `x-caller-id` takes precedence
    #[serde(default)]
    pub caller_id: Option<String>,
    /// Providers to try first, in order
    #[serde(default)]
    pub provider_preference: Vec<String>,
    /// Conversation
    pub messages: Vec<ChatMessage>,
    /// Stream events instead of one aggregated response
    #[serde(default)]
    pub stream: bool,
    /// Admission priority, higher first; an integer from 0 to 255
    #[serde(default)]
    pub priority: Option<f64>,
    /// Conversation to append the exchange to
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Aggregated (non-streaming) completion response
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionResponse {
    /// Request ID
    pub request_id: String,
    /// Full reply
    pub content: String,
    /// Why generation stopped
    pub finish_reason: FinishReason,
    /// Token usage, when the provider reported it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl CompletionBody {
    fn into_request(
        self,
        request_id: gateway_core::RequestId,
        caller_override: Option<String>,
    ) -> Result<CompletionRequest, ApiError> {
        let caller = caller_override
            .or(self.caller_id)
            .ok_or_else(|| ApiError::bad_request("callerId is required"))?;

        let mut builder = CompletionRequest::builder()
            .request_id(request_id)
            .caller(CallerId::new(caller)?)
            .provider_preference(self.provider_preference.into_iter().map(ProviderId::new).collect())
            .messages(self.messages)
            .streaming(self.stream)
            .priority(admission_priority(self.priority)?);
        if let Some(session_id) = self.session_id {
            builder = builder.session_id(session_id);
        }
        Ok(builder.build()?)
    }
}

fn admission_priority(value: Option<f64>) -> Result<Priority, GatewayError> {
    match value {
        None => Ok(Priority::NORMAL),
        Some(p) if p.fract() == 0.0 && (0.0..=255.0).contains(&p) => Ok(Priority(p as u8)),
        Some(p) => Err(GatewayError::validation(
            format!("priority must be an integer from 0 to 255, got {p}"),
            Some("priority".to_string()),
        )),
    }
}

/// Chat completion endpoint.
///
/// Failures before any output exist are answered with a plain HTTP error.
/// Once output has started, a failure arrives as the stream's `error` event.
#[instrument(skip_all, fields(request_id = %request_id.0))]
pub async fn create_completion(
    State(state): State<AppState>,
    request_id: RequestId,
    CallerHeader(caller): CallerHeader,
    JsonBody(body): JsonBody<CompletionBody>,
) -> Result<Response, ApiError> {
    let RequestId(request_id) = request_id;
    let request = body.into_request(request_id.clone(), caller)?;
    let streaming = request.streaming;

    debug!(
        caller_id = %request.caller_id,
        streaming,
        messages = request.messages.len(),
        "Processing completion request"
    );

    let mut handle = state.gateway.submit(request).await?;
    let first = handle
        .next_event()
        .await
        .ok_or_else(|| ApiError::internal("request ended without a terminal event"))?;

    if let StreamEvent::Error {
        code,
        message,
        retriable,
    } = first
    {
        return Err(ApiError::new(code, message, retriable));
    }

    if streaming {
        let events = stream::once(async move { first })
            .chain(handle.into_stream())
            .map(|event| Ok::<_, Infallible>(sse_event(&event)));

        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    match first {
        StreamEvent::Done {
            finish_reason,
            content,
            usage,
        } => Ok(Json(CompletionResponse {
            request_id: request_id.to_string(),
            content: content.unwrap_or_default(),
            finish_reason,
            usage,
        })
        .into_response()),
        other => {
            error!(event = other.event_name(), "Aggregated response was not a terminal event");
            Err(ApiError::internal("malformed aggregated response"))
        }
    }
}

fn sse_event(event: &StreamEvent) -> Event {
    Event::default()
        .event(event.event_name())
        .json_data(event)
        .unwrap_or_else(|e| {
            error!(error = %e, "Failed to encode stream event");
            Event::default()
                .event("error")
                .data(r#"{"type":"error","code":"INTERNAL_ERROR","message":"event encoding failed","retriable":false}"#)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_body_accepts_camel_case() {
        let body: CompletionBody = serde_json::from_value(serde_json::json!({
            "callerId": "team-a",
            "providerPreference": ["fastgpt", "openai"],
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
            "priority": 90,
            "sessionId": "s-1"
        }))
        .expect("body");

        let request = body
            .into_request(gateway_core::RequestId::from_external("r-1"), None)
            .expect("request");
        assert_eq!(request.caller_id.as_str(), "team-a");
        assert_eq!(
            request.provider_preference,
            vec![ProviderId::new("fastgpt"), ProviderId::new("openai")]
        );
        assert_eq!(request.priority, Priority(90));
        assert_eq!(request.session_id.as_deref(), Some("s-1"));
        assert!(request.streaming);
    }

    #[test]
    fn test_out_of_range_priority_names_the_field() {
        for priority in [serde_json::json!(300), serde_json::json!(-1), serde_json::json!(2.5)] {
            let body: CompletionBody = serde_json::from_value(serde_json::json!({
                "callerId": "team-a",
                "messages": [{"role": "user", "content": "hi"}],
                "priority": priority
            }))
            .expect("any number decodes");

            let err = body
                .into_request(gateway_core::RequestId::generate(), None)
                .expect_err("rejected");
            assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
            assert!(err.message.contains("priority"), "{}", err.message);
        }
    }

    #[test]
    fn test_priority_bounds_are_accepted() {
        for (raw, expected) in [(0, Priority(0)), (255, Priority(255))] {
            let body: CompletionBody = serde_json::from_value(serde_json::json!({
                "callerId": "team-a",
                "messages": [{"role": "user", "content": "hi"}],
                "priority": raw
            }))
            .expect("body");
            let request = body
                .into_request(gateway_core::RequestId::generate(), None)
                .expect("request");
            assert_eq!(request.priority, expected);
        }
    }

    #[test]
    fn test_caller_header_overrides_body() {
        let body: CompletionBody = serde_json::from_value(serde_json::json!({
            "callerId": "spoofed",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .expect("body");

        let request = body
            .into_request(gateway_core::RequestId::generate(), Some("verified".to_string()))
            .expect("request");
        assert_eq!(request.caller_id.as_str(), "verified");
        assert_eq!(request.priority, Priority::NORMAL);
        assert!(!request.streaming);
    }

    #[test]
    fn test_missing_caller_is_invalid() {
        let body: CompletionBody = serde_json::from_value(serde_json::json!({
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .expect("body");

        let err = body
            .into_request(gateway_core::RequestId::generate(), None)
            .expect_err("no caller");
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }
}
