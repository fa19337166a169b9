//! Mock provider backends for integration testing
//!
//! Each [`MockBackend`] is a wiremock server speaking one provider's wire
//! protocol at the path its adapter posts to.

use gateway_config::ProviderSettings;
use gateway_core::ProviderKind;
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A wiremock server standing in for one provider
pub struct MockBackend {
    /// The underlying mock server
    pub server: MockServer,
    kind: ProviderKind,
}

impl MockBackend {
    /// Start a backend for `kind`
    pub async fn start(kind: ProviderKind) -> Self {
        Self {
            server: MockServer::start().await,
            kind,
        }
    }

    /// Base URL of the backend
    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Path the adapter for this kind posts to
    pub fn api_path(&self) -> &'static str {
        match self.kind {
            ProviderKind::OpenAI => "/v1/chat/completions",
            ProviderKind::FastGpt => "/api/v1/chat/completions",
            ProviderKind::Anthropic => "/v1/messages",
            ProviderKind::Dify => "/v1/chat-messages",
        }
    }

    /// Provider settings pointing at this backend
    pub fn settings(&self, id: &str) -> ProviderSettings {
        ProviderSettings::new(id, self.kind, self.uri()).with_api_key("test-key")
    }

    /// Answer every call with a stream of `deltas`
    pub async fn mount_stream(&self, deltas: &[&str]) {
        Mock::given(method("POST"))
            .and(path(self.api_path()))
            .respond_with(sse_response(stream_body(self.kind, deltas)))
            .mount(&self.server)
            .await;
    }

    /// Stream `deltas` after holding each response for `delay`
    pub async fn mount_slow_stream(&self, deltas: &[&str], delay: Duration) {
        Mock::given(method("POST"))
            .and(path(self.api_path()))
            .respond_with(sse_response(stream_body(self.kind, deltas)).set_delay(delay))
            .mount(&self.server)
            .await;
    }

    /// Answer every call with an aggregated OpenAI-style body
    pub async fn mount_blocking(&self, content: &str) {
        Mock::given(method("POST"))
            .and(path(self.api_path()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            })))
            .mount(&self.server)
            .await;
    }

    /// Answer every call with `status`
    pub async fn mount_failure(&self, status: u16) {
        Mock::given(method("POST"))
            .and(path(self.api_path()))
            .respond_with(error_response(status))
            .mount(&self.server)
            .await;
    }

    /// Fail the first `failures` calls with `status`, then stream `deltas`
    pub async fn mount_flaky(&self, failures: u64, status: u16, deltas: &[&str]) {
        Mock::given(method("POST"))
            .and(path(self.api_path()))
            .respond_with(error_response(status))
            .up_to_n_times(failures)
            .mount(&self.server)
            .await;
        self.mount_stream(deltas).await;
    }

    /// Stream `deltas`, then break off before the terminal marker
    pub async fn mount_truncated(&self, deltas: &[&str]) {
        let body: String = deltas
            .iter()
            .map(|text| openai_frame(&json!({"choices": [{"delta": {"content": text}}]})))
            .collect();
        Mock::given(method("POST"))
            .and(path(self.api_path()))
            .respond_with(sse_response(body))
            .mount(&self.server)
            .await;
    }

    /// Number of calls the backend has received
    pub async fn calls(&self) -> usize {
        self.server
            .received_requests()
            .await
            .map_or(0, |requests| requests.len())
    }

    /// JSON bodies of every call received so far
    pub async fn request_bodies(&self) -> Vec<serde_json::Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter_map(|request| serde_json::from_slice(&request.body).ok())
            .collect()
    }
}

fn sse_response(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_raw(body, "text/event-stream")
}

fn error_response(status: u16) -> ResponseTemplate {
    ResponseTemplate::new(status).set_body_json(json!({
        "error": {"message": format!("upstream returned {status}")}
    }))
}

fn openai_frame(chunk: &serde_json::Value) -> String {
    format!("data: {chunk}\n\n")
}

/// Streaming body in the wire format of `kind`
pub fn stream_body(kind: ProviderKind, deltas: &[&str]) -> String {
    match kind {
        ProviderKind::OpenAI => {
            let mut body: String = deltas
                .iter()
                .map(|text| openai_frame(&json!({"choices": [{"delta": {"content": text}}]})))
                .collect();
            body.push_str(&openai_frame(
                &json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
            ));
            body.push_str("data: [DONE]\n\n");
            body
        }
        ProviderKind::FastGpt => {
            let mut body = String::from(
                "event: flowNodeStatus\ndata: {\"status\":\"running\",\"name\":\"AI Chat\"}\n\n",
            );
            for text in deltas {
                let chunk = json!({"choices": [{"delta": {"content": text}}]});
                body.push_str(&format!("event: answer\ndata: {chunk}\n\n"));
            }
            let last = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
            body.push_str(&format!("event: answer\ndata: {last}\n\n"));
            body.push_str("event: flowResponses\ndata: []\n\n");
            body.push_str("event: answer\ndata: [DONE]\n\n");
            body
        }
        ProviderKind::Anthropic => {
            let mut body = format!(
                "event: message_start\ndata: {}\n\n",
                json!({"type": "message_start", "message": {"usage": {"input_tokens": 4, "output_tokens": 0}}})
            );
            body.push_str(
                "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0}\n\n",
            );
            for text in deltas {
                let event = json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": text}});
                body.push_str(&format!("event: content_block_delta\ndata: {event}\n\n"));
            }
            body.push_str(&format!(
                "event: message_delta\ndata: {}\n\n",
                json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": deltas.len()}})
            ));
            body.push_str("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n");
            body
        }
        ProviderKind::Dify => {
            let mut body = String::from("data: {\"event\":\"workflow_started\",\"task_id\":\"t1\"}\n\n");
            for text in deltas {
                body.push_str(&format!("data: {}\n\n", json!({"event": "message", "answer": text})));
            }
            body.push_str(&format!(
                "data: {}\n\n",
                json!({"event": "message_end", "metadata": {"usage": {"prompt_tokens": 4, "completion_tokens": deltas.len(), "total_tokens": 4 + deltas.len()}}})
            ));
            body
        }
    }
}
