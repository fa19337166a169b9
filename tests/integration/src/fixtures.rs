//! Test fixtures: configurations, assembled gateways and request bodies

use gateway_config::{GatewayConfig, ProviderSettings};
use gateway_core::{
    CallerId, ChatMessage, CompletionRequest, InMemorySessionStore, Priority, ProviderId,
    RequestId, StreamEvent,
};
use gateway_server::{build_gateway, AppState, Collaborators, CompletionHandle, Gateway};
use gateway_telemetry::{MemoryAuditSink, Metrics};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Config over `providers` with fast retries and generous limits
pub fn test_config(providers: Vec<ProviderSettings>) -> GatewayConfig {
    let mut config = GatewayConfig {
        providers,
        ..GatewayConfig::default()
    };
    config.retry.max_retries = 0;
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter = 0.0;
    config.admission.max_concurrent = 8;
    config.admission.max_wait = Duration::from_secs(5);
    config.rate_limit.completion_limit = 100;
    config.rate_limit.stream_limit = 100;
    config
}

/// A gateway built from configuration, with observable collaborators
pub struct TestGateway {
    /// The façade
    pub gateway: Gateway,
    /// Audit events recorded so far
    pub audit: MemoryAuditSink,
    /// Session history
    pub sessions: Arc<InMemorySessionStore>,
    /// Metrics registry
    pub metrics: Metrics,
    /// The configuration it was built from
    pub config: GatewayConfig,
}

impl TestGateway {
    /// Build through the same path the binary uses
    pub async fn build(config: GatewayConfig) -> Self {
        let audit = MemoryAuditSink::new();
        let sessions = Arc::new(InMemorySessionStore::new());
        let metrics = Metrics::new().expect("metrics");
        let gateway = build_gateway(
            &config,
            Collaborators {
                audit: Arc::new(audit.clone()),
                metrics: metrics.clone(),
                sessions: Some(sessions.clone()),
            },
        )
        .await
        .expect("gateway");

        Self {
            gateway,
            audit,
            sessions,
            metrics,
            config,
        }
    }

    /// Application state for the HTTP router
    pub fn app_state(&self) -> AppState {
        AppState::builder()
            .gateway(self.gateway.clone())
            .config(self.config.clone())
            .metrics(self.metrics.clone())
            .build()
            .expect("state")
    }

    /// Submit `request` and collect every event up to the end of the stream
    pub async fn run(&self, request: CompletionRequest) -> Vec<StreamEvent> {
        let handle = self.gateway.submit(request).await.expect("submitted");
        collect(handle).await
    }
}

/// Open `provider`'s circuit by failing calls through it until it trips
pub fn trip_circuit(gateway: &Gateway, provider: &str) {
    let breaker = gateway
        .orchestrator()
        .breakers()
        .get_or_create(&ProviderId::new(provider));
    while !breaker.is_open() {
        breaker.try_acquire().expect("closed circuit admits").fail();
    }
}

/// Drain a handle
pub async fn collect(mut handle: CompletionHandle) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }
    events
}

/// A single-turn request from `caller`
pub fn chat_request(caller: &str, prompt: &str, streaming: bool) -> CompletionRequest {
    CompletionRequest::builder()
        .request_id(RequestId::generate())
        .caller(CallerId::new(caller).expect("caller"))
        .message(ChatMessage::user(prompt))
        .streaming(streaming)
        .build()
        .expect("request")
}

/// A streaming request with an admission priority
pub fn prioritized_request(caller: &str, prompt: &str, priority: u8) -> CompletionRequest {
    CompletionRequest::builder()
        .request_id(RequestId::generate())
        .caller(CallerId::new(caller).expect("caller"))
        .message(ChatMessage::user(prompt))
        .streaming(true)
        .priority(Priority(priority))
        .build()
        .expect("request")
}

/// JSON body for `POST /v1/completions`
pub fn completion_body(caller: &str, stream: bool) -> Value {
    json!({
        "callerId": caller,
        "messages": [
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": "Say hello"}
        ],
        "stream": stream
    })
}

/// Concatenated delta text
pub fn delta_text(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Delta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect()
}

/// Number of terminal events in `events`
pub fn terminal_count(events: &[StreamEvent]) -> usize {
    events.iter().filter(|event| event.is_terminal()).count()
}
