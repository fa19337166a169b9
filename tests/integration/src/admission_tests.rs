//! Admission ordering, queue timeouts and cancellation with a busy backend

use crate::{
    collect, delta_text, init_tracing, prioritized_request, test_config, MockBackend, TestGateway,
};
use gateway_core::{ErrorCode, Priority, ProviderKind, StreamEvent};
use gateway_telemetry::{AuditEventType, AuditOutcome};
use pretty_assertions::assert_eq;
use std::time::Duration;

async fn single_slot(delay: Duration, max_wait: Duration) -> (MockBackend, TestGateway) {
    init_tracing();
    let backend = MockBackend::start(ProviderKind::OpenAI).await;
    backend.mount_slow_stream(&["ok"], delay).await;

    let mut config = test_config(vec![backend.settings("openai")]);
    config.admission.max_concurrent = 1;
    config.admission.max_wait = max_wait;
    (backend, TestGateway::build(config).await)
}

fn prompts(bodies: &[serde_json::Value]) -> Vec<String> {
    bodies
        .iter()
        .filter_map(|body| body["messages"][0]["content"].as_str().map(str::to_string))
        .collect()
}

#[tokio::test]
async fn test_high_priority_waiter_goes_first() {
    let (backend, gw) = single_slot(Duration::from_millis(300), Duration::from_secs(5)).await;

    let first = gw
        .gateway
        .submit(prioritized_request("alice", "first", Priority::NORMAL.0))
        .await
        .expect("submitted");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let low = gw
        .gateway
        .submit(prioritized_request("bob", "low", Priority::LOW.0))
        .await
        .expect("submitted");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let high = gw
        .gateway
        .submit(prioritized_request("carol", "high", Priority::HIGH.0))
        .await
        .expect("submitted");

    let (a, b, c) = tokio::join!(collect(first), collect(low), collect(high));
    for events in [&a, &b, &c] {
        assert_eq!(delta_text(events), "ok");
    }

    assert_eq!(
        prompts(&backend.request_bodies().await),
        vec!["first", "high", "low"]
    );
    assert_eq!(gw.gateway.admission().stats().in_flight, 0);
}

#[tokio::test]
async fn test_queue_timeout_is_a_single_error_event() {
    let (backend, gw) = single_slot(Duration::from_millis(800), Duration::from_millis(100)).await;

    let holder = gw
        .gateway
        .submit(prioritized_request("alice", "first", Priority::NORMAL.0))
        .await
        .expect("submitted");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiter = gw
        .gateway
        .submit(prioritized_request("bob", "second", Priority::NORMAL.0))
        .await
        .expect("submitted");
    let events = collect(waiter).await;

    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        StreamEvent::Error { code: ErrorCode::QueueTimeout, retriable: true, .. }
    ));

    assert_eq!(delta_text(&collect(holder).await), "ok");
    assert_eq!(backend.calls().await, 1);

    let denied: Vec<_> = gw
        .audit
        .events_of(AuditEventType::RequestTerminal)
        .into_iter()
        .filter(|e| e.error_code == Some(ErrorCode::QueueTimeout))
        .collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].outcome, AuditOutcome::Denied);
}

#[tokio::test]
async fn test_cancelling_a_queued_request_frees_its_place() {
    let (backend, gw) = single_slot(Duration::from_millis(400), Duration::from_secs(5)).await;

    let holder = gw
        .gateway
        .submit(prioritized_request("alice", "first", Priority::NORMAL.0))
        .await
        .expect("submitted");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut queued = gw
        .gateway
        .submit(prioritized_request("bob", "second", Priority::NORMAL.0))
        .await
        .expect("submitted");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gw.gateway.admission().stats().queued, 1);

    queued.cancel();
    let event = queued.next_event().await.expect("terminal event");
    assert!(matches!(event, StreamEvent::Error { code: ErrorCode::Cancelled, .. }));
    assert!(queued.next_event().await.is_none());

    assert_eq!(delta_text(&collect(holder).await), "ok");
    assert_eq!(backend.calls().await, 1);
    assert_eq!(gw.gateway.admission().stats().queued, 0);
}
