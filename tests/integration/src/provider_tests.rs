//! Each provider protocol served through the full gateway

use crate::{chat_request, delta_text, init_tracing, terminal_count, test_config, MockBackend, TestGateway};
use gateway_core::{FinishReason, ProviderKind, StreamEvent};
use pretty_assertions::assert_eq;

async fn stream_through(kind: ProviderKind) -> (MockBackend, Vec<StreamEvent>) {
    init_tracing();
    let backend = MockBackend::start(kind).await;
    backend.mount_stream(&["Hello", ", ", "world"]).await;

    let gw = TestGateway::build(test_config(vec![backend.settings("primary")])).await;
    let events = gw.run(chat_request("team-a", "Say hello", true)).await;
    (backend, events)
}

#[tokio::test]
async fn test_openai_stream() {
    let (backend, events) = stream_through(ProviderKind::OpenAI).await;

    assert_eq!(delta_text(&events), "Hello, world");
    assert_eq!(events.last(), Some(&StreamEvent::done(FinishReason::Stop)));
    assert_eq!(terminal_count(&events), 1);

    let bodies = backend.request_bodies().await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(bodies[0]["messages"][0]["content"], "Say hello");
}

#[tokio::test]
async fn test_fastgpt_stream_ignores_workflow_events() {
    let (backend, events) = stream_through(ProviderKind::FastGpt).await;

    assert_eq!(delta_text(&events), "Hello, world");
    assert_eq!(events.last(), Some(&StreamEvent::done(FinishReason::Stop)));
    assert_eq!(terminal_count(&events), 1);
    assert_eq!(backend.calls().await, 1);
}

#[tokio::test]
async fn test_anthropic_stream() {
    let (backend, events) = stream_through(ProviderKind::Anthropic).await;

    assert_eq!(delta_text(&events), "Hello, world");
    assert_eq!(events.last(), Some(&StreamEvent::done(FinishReason::Stop)));
    assert!(events.iter().any(|e| matches!(e, StreamEvent::Usage(u) if u.completion_tokens == 3)));

    let bodies = backend.request_bodies().await;
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(bodies[0]["messages"][0]["role"], "user");
}

#[tokio::test]
async fn test_dify_stream() {
    let (backend, events) = stream_through(ProviderKind::Dify).await;

    assert_eq!(delta_text(&events), "Hello, world");
    assert_eq!(events.last(), Some(&StreamEvent::done(FinishReason::Stop)));

    let bodies = backend.request_bodies().await;
    assert_eq!(bodies[0]["query"], "Say hello");
    assert_eq!(bodies[0]["response_mode"], "streaming");
    assert_eq!(bodies[0]["user"], "team-a");
}

#[tokio::test]
async fn test_aggregated_reply_is_a_single_done() {
    init_tracing();
    let backend = MockBackend::start(ProviderKind::OpenAI).await;
    backend.mount_blocking("Hi there").await;

    let gw = TestGateway::build(test_config(vec![backend.settings("primary")])).await;
    let events = gw.run(chat_request("team-a", "hi", false)).await;

    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Done {
            content, usage, ..
        } => {
            assert_eq!(content.as_deref(), Some("Hi there"));
            assert_eq!(usage.as_ref().map(|u| u.total_tokens), Some(5));
        }
        other => panic!("expected done, got {other:?}"),
    }
    assert_eq!(backend.request_bodies().await[0]["stream"], false);
}

#[tokio::test]
async fn test_truncated_stream_ends_with_protocol_error() {
    init_tracing();
    let backend = MockBackend::start(ProviderKind::OpenAI).await;
    backend.mount_truncated(&["partial"]).await;

    let gw = TestGateway::build(test_config(vec![backend.settings("primary")])).await;
    let events = gw.run(chat_request("team-a", "hi", true)).await;

    assert_eq!(events[0], StreamEvent::delta("partial"));
    assert_eq!(terminal_count(&events), 1);
    assert!(matches!(
        events.last(),
        Some(StreamEvent::Error { code: gateway_core::ErrorCode::ProtocolError, .. })
    ));
}
