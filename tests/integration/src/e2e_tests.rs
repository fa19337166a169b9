//! End-to-end flows over HTTP against mock provider backends

use crate::{
    completion_body, event_names, init_tracing, parse_sse, test_config, trip_circuit, MockBackend,
    TestGateway, TestServer,
};
use gateway_core::{MessageRole, ProviderKind};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

struct Stack {
    fastgpt: MockBackend,
    openai: MockBackend,
    gw: TestGateway,
    server: TestServer,
}

async fn stack(configure: impl FnOnce(&mut gateway_config::GatewayConfig)) -> Stack {
    init_tracing();
    let fastgpt = MockBackend::start(ProviderKind::FastGpt).await;
    let openai = MockBackend::start(ProviderKind::OpenAI).await;

    let mut config = test_config(vec![fastgpt.settings("fastgpt"), openai.settings("openai")]);
    config.default_providers = vec!["fastgpt".to_string(), "openai".to_string()];
    configure(&mut config);

    let gw = TestGateway::build(config).await;
    let server = TestServer::start(gw.app_state()).await;
    Stack {
        fastgpt,
        openai,
        gw,
        server,
    }
}

#[tokio::test]
async fn test_streaming_completion_over_http() {
    let s = stack(|_| {}).await;
    s.fastgpt.mount_stream(&["Hello", ", world"]).await;

    let response = s
        .server
        .client
        .post(format!("{}/v1/completions", s.server.base_url))
        .header("x-request-id", "req-e2e-1")
        .json(&completion_body("team-a", true))
        .send()
        .await
        .expect("response");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("req-e2e-1")
    );
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream")));

    let events = parse_sse(&response.text().await.expect("body"));
    assert_eq!(event_names(&events), vec!["delta", "delta", "done"]);
    assert_eq!(events[0].1["text"], "Hello");
    assert_eq!(events[2].1["finish_reason"], "stop");
    assert_eq!(s.openai.calls().await, 0);
}

#[tokio::test]
async fn test_aggregated_completion_over_http() {
    let s = stack(|_| {}).await;
    s.fastgpt.mount_blocking("Hello, world").await;

    let response = s
        .server
        .post_json("/v1/completions", &completion_body("team-a", false))
        .await;

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["content"], "Hello, world");
    assert_eq!(body["finishReason"], "stop");
    assert!(body["requestId"].as_str().is_some_and(|id| !id.is_empty()));
    assert_eq!(body["usage"]["total_tokens"], 5);

    let sent = s.fastgpt.request_bodies().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["stream"], false);
    assert_eq!(s.openai.calls().await, 0);
}

#[tokio::test]
async fn test_open_fastgpt_circuit_falls_back_to_openai() {
    let s = stack(|_| {}).await;
    s.fastgpt.mount_stream(&["never"]).await;
    s.openai.mount_stream(&["fallback ", "reply"]).await;
    trip_circuit(&s.gw.gateway, "fastgpt");

    let response = s
        .server
        .post_json("/v1/completions", &completion_body("team-a", true))
        .await;
    assert_eq!(response.status(), 200);
    let events = parse_sse(&response.text().await.expect("body"));

    assert_eq!(s.fastgpt.calls().await, 0);
    assert_eq!(event_names(&events).last(), Some(&"done"));
    let text: String = events
        .iter()
        .filter_map(|(name, data)| (name == "delta").then(|| data["text"].as_str()).flatten())
        .collect();
    assert_eq!(text, "fallback reply");

    let circuits: Value = s.server.get("/admin/circuits").await.json().await.expect("json");
    let fastgpt = circuits
        .as_array()
        .and_then(|all| all.iter().find(|c| c["provider_id"] == "fastgpt"))
        .expect("fastgpt circuit");
    assert_eq!(fastgpt["state"], "open");
}

#[tokio::test]
async fn test_rate_limit_over_http() {
    let s = stack(|config| config.rate_limit.stream_limit = 2).await;
    s.fastgpt.mount_stream(&["ok"]).await;

    for _ in 0..2 {
        let response = s
            .server
            .post_json("/v1/completions", &completion_body("team-a", true))
            .await;
        assert_eq!(response.status(), 200);
        response.text().await.expect("body");
    }

    let response = s
        .server
        .post_json("/v1/completions", &completion_body("team-a", true))
        .await;
    assert_eq!(response.status(), 429);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("retry-after seconds");
    assert!(retry_after >= 1);

    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert_eq!(body["error"]["retriable"], true);
    assert_eq!(s.fastgpt.calls().await, 2);
}

#[tokio::test]
async fn test_unavailable_providers_return_503_before_streaming() {
    let s = stack(|_| {}).await;
    s.fastgpt.mount_failure(500).await;
    s.openai.mount_failure(503).await;

    let response = s
        .server
        .post_json("/v1/completions", &completion_body("team-a", true))
        .await;

    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"]["code"], "ALL_PROVIDERS_UNAVAILABLE");
}

#[tokio::test]
async fn test_session_history_is_appended() {
    let s = stack(|_| {}).await;
    s.fastgpt.mount_stream(&["Hi", " there"]).await;

    let mut body = completion_body("team-a", true);
    body["sessionId"] = json!("session-7");
    let response = s.server.post_json("/v1/completions", &body).await;
    assert_eq!(response.status(), 200);
    response.text().await.expect("body");

    assert_eq!(
        s.gw.sessions.messages("session-7"),
        vec![
            (MessageRole::User, "Say hello".to_string()),
            (MessageRole::Assistant, "Hi there".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_caller_header_overrides_body() {
    let s = stack(|config| config.rate_limit.stream_limit = 1).await;
    s.fastgpt.mount_stream(&["ok"]).await;

    let first = s
        .server
        .client
        .post(format!("{}/v1/completions", s.server.base_url))
        .header("x-caller-id", "verified-caller")
        .json(&completion_body("spoofed", true))
        .send()
        .await
        .expect("response");
    assert_eq!(first.status(), 200);
    first.text().await.expect("body");

    // the body's caller still has its own quota
    let second = s
        .server
        .post_json("/v1/completions", &completion_body("spoofed", true))
        .await;
    assert_eq!(second.status(), 200);
}

#[tokio::test]
async fn test_operational_endpoints() {
    let s = stack(|_| {}).await;
    s.fastgpt.mount_stream(&["ok"]).await;

    assert_eq!(s.server.get("/health").await.status(), 200);
    assert_eq!(s.server.get("/ready").await.status(), 200);

    s.server
        .post_json("/v1/completions", &completion_body("team-a", true))
        .await
        .text()
        .await
        .expect("body");

    let metrics = s.server.get("/metrics").await.text().await.expect("metrics");
    assert!(metrics.contains("gateway_provider_attempts_total"));
    assert!(metrics.contains("fastgpt"));

    let admission: Value = s.server.get("/admin/admission").await.json().await.expect("json");
    assert_eq!(admission["max_concurrent"], 8);
    assert_eq!(admission["in_flight"], 0);
}

#[tokio::test]
async fn test_missing_caller_is_rejected() {
    let s = stack(|_| {}).await;
    let response = s
        .server
        .post_json(
            "/v1/completions",
            &json!({"messages": [{"role": "user", "content": "hi"}]}),
        )
        .await;

    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
}
