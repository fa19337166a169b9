//! Scripted providers for unit tests.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use gateway_core::{
    CompletionProvider, CompletionRequest, FinishReason, GatewayError, InMemorySessionStore,
    ProviderId, ProviderKind, ProviderStream, StreamEvent,
};
use gateway_providers::ProviderRegistry;
use gateway_resilience::{
    AdmissionConfig, AdmissionController, CircuitBreakerConfig, CircuitBreakerRegistry,
    RateLimiter, RateLimiterConfig, RetryPolicyBuilder,
};
use gateway_routing::FallbackOrchestrator;
use gateway_telemetry::{MemoryAuditSink, Metrics};
use std::sync::Arc;
use std::time::Duration;

use crate::facade::Gateway;

pub(crate) enum Script {
    Reply(Vec<&'static str>),
    Fail,
    /// One delta, then nothing until dropped
    Hang,
}

pub(crate) struct ScriptedProvider {
    id: ProviderId,
    script: Script,
}

impl ScriptedProvider {
    pub(crate) fn new(id: &str, script: Script) -> Arc<Self> {
        Arc::new(Self {
            id: ProviderId::new(id),
            script,
        })
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAI
    }

    async fn start(&self, _request: &CompletionRequest) -> Result<ProviderStream, GatewayError> {
        match &self.script {
            Script::Reply(parts) => {
                let mut events: Vec<Result<StreamEvent, GatewayError>> =
                    parts.iter().map(|p| Ok(StreamEvent::delta(*p))).collect();
                events.push(Ok(StreamEvent::done(FinishReason::Stop)));
                Ok(stream::iter(events).boxed())
            }
            Script::Fail => Err(GatewayError::provider(self.id.as_str(), "boom", Some(500), true)),
            Script::Hang => Ok(stream::iter(vec![Ok(StreamEvent::delta("thinking"))])
                .chain(stream::pending())
                .boxed()),
        }
    }
}

pub(crate) struct Fixture {
    pub gateway: Gateway,
    pub audit: MemoryAuditSink,
    pub sessions: Arc<InMemorySessionStore>,
    pub metrics: Metrics,
}

pub(crate) fn fixture(providers: Vec<Arc<ScriptedProvider>>, rate: RateLimiterConfig) -> Fixture {
    let registry = Arc::new(ProviderRegistry::new());
    for (priority, provider) in providers.into_iter().enumerate() {
        registry
            .register(provider, priority as u32)
            .expect("register");
    }
    let audit = MemoryAuditSink::new();
    let metrics = Metrics::new().expect("metrics");
    let orchestrator = FallbackOrchestrator::new(
        registry,
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        RetryPolicyBuilder::new()
            .max_retries(0)
            .base_delay(Duration::from_millis(1))
            .jitter(0.0)
            .build(),
        Arc::new(audit.clone()),
    )
    .with_metrics(metrics.clone());
    let sessions = Arc::new(InMemorySessionStore::new());
    let gateway = Gateway::builder()
        .rate_limiter(Arc::new(RateLimiter::in_memory(rate)))
        .admission(AdmissionController::new(AdmissionConfig::new(2)))
        .orchestrator(Arc::new(orchestrator))
        .sessions(sessions.clone())
        .audit(Arc::new(audit.clone()))
        .metrics(metrics.clone())
        .build()
        .expect("gateway");

    Fixture {
        gateway,
        audit,
        sessions,
        metrics,
    }
}
