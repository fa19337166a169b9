//! Sliding-window rate limiting through the façade

use crate::{chat_request, collect, init_tracing, terminal_count, test_config, MockBackend, TestGateway};
use gateway_core::{ErrorCode, GatewayError, ProviderKind};
use gateway_telemetry::{AuditEventType, AuditOutcome};
use pretty_assertions::assert_eq;

async fn limited_gateway(stream_limit: u32, redis_url: Option<&str>) -> (MockBackend, TestGateway) {
    init_tracing();
    let backend = MockBackend::start(ProviderKind::OpenAI).await;
    backend.mount_stream(&["ok"]).await;

    let mut config = test_config(vec![backend.settings("openai")]);
    config.rate_limit.stream_limit = stream_limit;
    config.rate_limit.completion_limit = 1;
    config.rate_limit.redis_url = redis_url.map(str::to_string);
    (backend, TestGateway::build(config).await)
}

#[tokio::test]
async fn test_limit_plus_one_is_rejected() {
    let (backend, gw) = limited_gateway(3, None).await;

    for _ in 0..3 {
        let events = gw.run(chat_request("team-a", "hi", true)).await;
        assert_eq!(terminal_count(&events), 1);
    }

    let err = gw
        .gateway
        .submit(chat_request("team-a", "hi", true))
        .await
        .expect_err("fourth request is over the limit");
    assert_eq!(err.code(), ErrorCode::RateLimited);
    match err {
        GatewayError::RateLimited { retry_after, limit } => {
            assert_eq!(limit, Some(3));
            assert!(retry_after.is_some_and(|d| !d.is_zero()));
        }
        other => panic!("expected rate limited, got {other:?}"),
    }

    // rejected requests never reach a provider
    assert_eq!(backend.calls().await, 3);

    let denied: Vec<_> = gw
        .audit
        .events_of(AuditEventType::RequestTerminal)
        .into_iter()
        .filter(|e| e.outcome == AuditOutcome::Denied)
        .collect();
    assert_eq!(denied.len(), 1);
    assert_eq!(denied[0].error_code, Some(ErrorCode::RateLimited));
}

#[tokio::test]
async fn test_callers_have_independent_windows() {
    let (_backend, gw) = limited_gateway(1, None).await;

    gw.run(chat_request("team-a", "hi", true)).await;
    assert!(gw.gateway.submit(chat_request("team-a", "hi", true)).await.is_err());

    let handle = gw
        .gateway
        .submit(chat_request("team-b", "hi", true))
        .await
        .expect("other caller is unaffected");
    assert_eq!(terminal_count(&collect(handle).await), 1);
}

#[tokio::test]
async fn test_streaming_and_aggregate_limits_are_separate() {
    let (_backend, gw) = limited_gateway(5, None).await;

    gw.run(chat_request("team-a", "hi", false)).await;
    let err = gw
        .gateway
        .submit(chat_request("team-a", "hi", false))
        .await
        .expect_err("aggregate limit is one");
    assert_eq!(err.code(), ErrorCode::RateLimited);

    assert!(gw.gateway.submit(chat_request("team-a", "hi", true)).await.is_ok());
}

#[tokio::test]
async fn test_unreachable_redis_still_enforces_in_memory() {
    let (_backend, gw) = limited_gateway(1, Some("redis://127.0.0.1:1")).await;

    gw.run(chat_request("team-a", "hi", true)).await;
    let err = gw
        .gateway
        .submit(chat_request("team-a", "hi", true))
        .await
        .expect_err("memory store enforces the limit");
    assert_eq!(err.code(), ErrorCode::RateLimited);
}
