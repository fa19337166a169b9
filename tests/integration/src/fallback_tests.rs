//! Fallback, retry and circuit-breaking scenarios

use crate::{
    chat_request, delta_text, init_tracing, terminal_count, test_config, trip_circuit, MockBackend,
    TestGateway,
};
use gateway_core::{ErrorCode, FinishReason, ProviderId, ProviderKind, StreamEvent};
use gateway_resilience::CircuitState;
use gateway_telemetry::{AuditEventType, AuditOutcome};
use pretty_assertions::assert_eq;

async fn backends() -> (MockBackend, MockBackend) {
    init_tracing();
    (
        MockBackend::start(ProviderKind::FastGpt).await,
        MockBackend::start(ProviderKind::OpenAI).await,
    )
}

fn two_provider_config(fastgpt: &MockBackend, openai: &MockBackend) -> gateway_config::GatewayConfig {
    let mut config = test_config(vec![fastgpt.settings("fastgpt"), openai.settings("openai")]);
    config.default_providers = vec!["fastgpt".to_string(), "openai".to_string()];
    config
}

#[tokio::test]
async fn test_open_circuit_is_skipped_without_a_call() {
    let (fastgpt, openai) = backends().await;
    fastgpt.mount_stream(&["never"]).await;
    openai.mount_stream(&["from ", "openai"]).await;

    let gw = TestGateway::build(two_provider_config(&fastgpt, &openai)).await;
    trip_circuit(&gw.gateway, "fastgpt");

    let events = gw.run(chat_request("team-a", "hi", true)).await;

    assert_eq!(fastgpt.calls().await, 0);
    assert_eq!(openai.calls().await, 1);
    assert_eq!(delta_text(&events), "from openai");
    assert_eq!(events.last(), Some(&StreamEvent::done(FinishReason::Stop)));

    let skipped = gw.audit.events_of(AuditEventType::ProviderSkipped);
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].provider_id.as_deref(), Some("fastgpt"));
    assert_eq!(skipped[0].outcome, AuditOutcome::Denied);
}

#[tokio::test]
async fn test_retries_exhaust_before_falling_back() {
    let (fastgpt, openai) = backends().await;
    fastgpt.mount_failure(503).await;
    openai.mount_stream(&["ok"]).await;

    let mut config = two_provider_config(&fastgpt, &openai);
    config.retry.max_retries = 2;
    let gw = TestGateway::build(config).await;

    let events = gw.run(chat_request("team-a", "hi", true)).await;

    assert_eq!(fastgpt.calls().await, 3);
    assert_eq!(openai.calls().await, 1);
    assert_eq!(delta_text(&events), "ok");

    let failures: Vec<_> = gw
        .audit
        .events_of(AuditEventType::ProviderAttempt)
        .into_iter()
        .filter(|e| e.outcome == AuditOutcome::Failure)
        .collect();
    assert_eq!(failures.len(), 3);
    assert!(failures.iter().all(|e| e.provider_id.as_deref() == Some("fastgpt")));
}

#[tokio::test]
async fn test_transient_failure_recovers_on_same_provider() {
    let (fastgpt, openai) = backends().await;
    fastgpt.mount_flaky(1, 503, &["second ", "try"]).await;
    openai.mount_stream(&["unused"]).await;

    let mut config = two_provider_config(&fastgpt, &openai);
    config.retry.max_retries = 1;
    let gw = TestGateway::build(config).await;

    let events = gw.run(chat_request("team-a", "hi", true)).await;

    assert_eq!(fastgpt.calls().await, 2);
    assert_eq!(openai.calls().await, 0);
    assert_eq!(delta_text(&events), "second try");
}

#[tokio::test]
async fn test_auth_failure_is_not_retried() {
    let (fastgpt, openai) = backends().await;
    fastgpt.mount_failure(401).await;
    openai.mount_stream(&["ok"]).await;

    let mut config = two_provider_config(&fastgpt, &openai);
    config.retry.max_retries = 3;
    let gw = TestGateway::build(config).await;

    let events = gw.run(chat_request("team-a", "hi", true)).await;

    assert_eq!(fastgpt.calls().await, 1);
    assert_eq!(delta_text(&events), "ok");
}

#[tokio::test]
async fn test_every_provider_failing_yields_one_error() {
    let (fastgpt, openai) = backends().await;
    fastgpt.mount_failure(500).await;
    openai.mount_failure(502).await;

    let gw = TestGateway::build(two_provider_config(&fastgpt, &openai)).await;
    let events = gw.run(chat_request("team-a", "hi", true)).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { code: ErrorCode::AllProvidersUnavailable, retriable: true, .. }
    ));

    let terminal = gw.audit.events_of(AuditEventType::RequestTerminal);
    assert_eq!(terminal.len(), 1);
    assert_eq!(terminal[0].outcome, AuditOutcome::Failure);
    assert_eq!(terminal[0].error_code, Some(ErrorCode::AllProvidersUnavailable));
}

#[tokio::test]
async fn test_repeated_failures_open_the_circuit() {
    let (fastgpt, openai) = backends().await;
    fastgpt.mount_failure(500).await;
    openai.mount_stream(&["ok"]).await;

    let mut config = two_provider_config(&fastgpt, &openai);
    config.circuit_breaker.failure_threshold = 2;
    let gw = TestGateway::build(config).await;

    for _ in 0..2 {
        let events = gw.run(chat_request("team-a", "hi", true)).await;
        assert_eq!(terminal_count(&events), 1);
    }
    let breaker = gw
        .gateway
        .orchestrator()
        .breakers()
        .get(&ProviderId::new("fastgpt"))
        .expect("breaker");
    assert_eq!(breaker.state(), CircuitState::Open);

    let events = gw.run(chat_request("team-a", "hi", true)).await;
    assert_eq!(fastgpt.calls().await, 2);
    assert_eq!(openai.calls().await, 3);
    assert_eq!(delta_text(&events), "ok");
}

#[tokio::test]
async fn test_request_preference_overrides_default_order() {
    let (fastgpt, openai) = backends().await;
    fastgpt.mount_stream(&["fastgpt"]).await;
    openai.mount_stream(&["openai"]).await;

    let gw = TestGateway::build(two_provider_config(&fastgpt, &openai)).await;
    let mut request = chat_request("team-a", "hi", true);
    request.provider_preference = vec![ProviderId::new("openai")];

    let events = gw.run(request).await;

    assert_eq!(delta_text(&events), "openai");
    assert_eq!(fastgpt.calls().await, 0);
}
