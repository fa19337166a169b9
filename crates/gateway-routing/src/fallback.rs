//! Provider fallback.
//!
//! Walks an ordered provider list. Providers with an open circuit are
//! skipped; every other provider is tried under the retry policy. An attempt
//! counts as successful once the provider yields its first event, at which
//! point the remaining providers are not contacted. Failures after that are
//! never retried: the stream ends with an error and the circuit records it.

use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use gateway_core::{
    AttemptHistory, AttemptOutcome, CompletionProvider, CompletionRequest, GatewayError,
    ProviderAttempt, ProviderId, ProviderStream, StreamEvent,
};
use gateway_providers::ProviderRegistry;
use gateway_resilience::{CircuitBreaker, CircuitBreakerRegistry, CircuitPermit, RetryPolicy};
use gateway_telemetry::{AuditEventBuilder, AuditEventType, AuditOutcome, AuditSink, Metrics};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Publishes attempt records to history, audit and metrics
#[derive(Clone)]
struct AttemptRecorder {
    history: AttemptHistory,
    audit: Arc<dyn AuditSink>,
    metrics: Option<Metrics>,
    request: Arc<CompletionRequest>,
}

impl AttemptRecorder {
    fn record(
        &self,
        provider_id: &ProviderId,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        latency: Duration,
    ) -> ProviderAttempt {
        let attempt = self.history.record(
            provider_id.clone(),
            started_at,
            outcome,
            latency.as_millis() as u64,
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(provider_id.as_str(), attempt.outcome.label(), latency);
        }

        let (event_type, audit_outcome) = match &attempt.outcome {
            AttemptOutcome::Succeeded => (AuditEventType::ProviderAttempt, AuditOutcome::Success),
            AttemptOutcome::Failed { .. } => (AuditEventType::ProviderAttempt, AuditOutcome::Failure),
            AttemptOutcome::SkippedCircuitOpen => {
                (AuditEventType::ProviderSkipped, AuditOutcome::Denied)
            }
        };
        let mut event = AuditEventBuilder::new(event_type)
            .outcome(audit_outcome)
            .request_id(&self.request.request_id)
            .caller_id(&self.request.caller_id)
            .provider_id(provider_id)
            .metadata("attempt_number", attempt.attempt_number)
            .metadata("latency_ms", attempt.latency_ms);
        if let AttemptOutcome::Failed { code, message, .. } = &attempt.outcome {
            event = event.error_code(*code).description(message.clone());
        }
        self.audit.publish(event.build());

        attempt
    }
}

/// A provider call that has produced its first event
struct StartedAttempt {
    first: StreamEvent,
    rest: ProviderStream,
    permit: CircuitPermit,
    started_at: DateTime<Utc>,
    start: Instant,
}

/// Fallback orchestrator
pub struct FallbackOrchestrator {
    registry: Arc<ProviderRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryPolicy,
    audit: Arc<dyn AuditSink>,
    metrics: Option<Metrics>,
}

impl FallbackOrchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        retry: RetryPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            registry,
            breakers,
            retry,
            audit,
            metrics: None,
        }
    }

    /// Record attempts on these metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Provider registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Circuit breakers
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Providers to try, in order
    #[must_use]
    pub fn provider_order(&self, request: &CompletionRequest) -> Vec<ProviderId> {
        if request.provider_preference.is_empty() {
            self.registry.default_order()
        } else {
            request.provider_preference.clone()
        }
    }

    /// Find a provider that will serve `request`.
    ///
    /// # Errors
    /// `ALL_PROVIDERS_UNAVAILABLE` when every provider was skipped or failed
    pub async fn complete(
        &self,
        request: Arc<CompletionRequest>,
    ) -> Result<OrchestratedStream, GatewayError> {
        self.complete_with_history(request, AttemptHistory::new()).await
    }

    /// Like [`Self::complete`], recording into a caller-owned history
    ///
    /// # Errors
    /// `ALL_PROVIDERS_UNAVAILABLE` when every provider was skipped or failed
    pub async fn complete_with_history(
        &self,
        request: Arc<CompletionRequest>,
        history: AttemptHistory,
    ) -> Result<OrchestratedStream, GatewayError> {
        let recorder = AttemptRecorder {
            history,
            audit: Arc::clone(&self.audit),
            metrics: self.metrics.clone(),
            request: Arc::clone(&request),
        };
        let order = self.provider_order(&request);
        let mut attempted = 0;
        let mut last_error: Option<GatewayError> = None;

        for provider_id in &order {
            attempted += 1;

            let Some(provider) = self.registry.get(provider_id) else {
                warn!(request_id = %request.request_id, provider = %provider_id, "Unknown provider; skipping");
                last_error = Some(GatewayError::configuration(format!(
                    "provider '{provider_id}' is not registered"
                )));
                continue;
            };

            let breaker = self.breakers.get_or_create(provider_id);
            if breaker.is_open() {
                debug!(request_id = %request.request_id, provider = %provider_id, "Circuit open; skipping");
                recorder.record(
                    provider_id,
                    Utc::now(),
                    AttemptOutcome::SkippedCircuitOpen,
                    Duration::ZERO,
                );
                last_error = Some(breaker_error(&breaker));
                continue;
            }

            let outcome = self
                .retry
                .execute_with_retry(|_| {
                    start_attempt(Arc::clone(&provider), Arc::clone(&breaker), Arc::clone(&request))
                })
                .await;

            for report in &outcome.attempts {
                if let Some(error) = &report.error {
                    let attempt_outcome = if matches!(error, GatewayError::CircuitOpen { .. }) {
                        AttemptOutcome::SkippedCircuitOpen
                    } else {
                        AttemptOutcome::failed(error)
                    };
                    recorder.record(provider_id, report.started_at, attempt_outcome, report.latency);
                }
            }

            match outcome.result {
                Ok(started) => {
                    info!(
                        request_id = %request.request_id,
                        provider = %provider_id,
                        attempts = recorder.history.len() + 1,
                        "Provider started streaming"
                    );
                    return Ok(OrchestratedStream {
                        provider_id: provider_id.clone(),
                        first: Some(started.first),
                        inner: started.rest,
                        permit: Some(started.permit),
                        started_at: started.started_at,
                        start: started.start,
                        recorder,
                        finished: false,
                    });
                }
                Err(error) => {
                    warn!(
                        request_id = %request.request_id,
                        provider = %provider_id,
                        error = %error,
                        "Provider failed; falling back"
                    );
                    last_error = Some(error);
                }
            }
        }

        warn!(
            request_id = %request.request_id,
            attempted,
            "All providers unavailable"
        );
        Err(GatewayError::all_providers_unavailable(
            attempted,
            last_error.as_ref(),
        ))
    }
}

fn breaker_error(breaker: &CircuitBreaker) -> GatewayError {
    let snapshot = breaker.snapshot();
    GatewayError::circuit_open(
        breaker.provider_id().as_str(),
        snapshot.retry_after_ms.map(Duration::from_millis),
    )
}

/// Settle a permit according to an error
fn settle_failure(permit: CircuitPermit, error: &GatewayError) {
    if error.counts_against_provider() {
        permit.fail();
    } else {
        permit.abandon();
    }
}

async fn start_attempt(
    provider: Arc<dyn CompletionProvider>,
    breaker: Arc<CircuitBreaker>,
    request: Arc<CompletionRequest>,
) -> Result<StartedAttempt, GatewayError> {
    let permit = breaker.try_acquire()?;
    let started_at = Utc::now();
    let start = Instant::now();

    let mut stream = match provider.start(&request).await {
        Ok(stream) => stream,
        Err(error) => {
            settle_failure(permit, &error);
            return Err(error);
        }
    };

    match stream.next().await {
        Some(Ok(StreamEvent::Error {
            code,
            message,
            retriable,
        })) => {
            let error = GatewayError::from_event(provider.id().as_str(), code, message, retriable);
            settle_failure(permit, &error);
            Err(error)
        }
        Some(Ok(first)) => Ok(StartedAttempt {
            first,
            rest: stream,
            permit,
            started_at,
            start,
        }),
        Some(Err(error)) => {
            settle_failure(permit, &error);
            Err(error)
        }
        None => {
            let error = GatewayError::protocol(provider.id().as_str(), "stream ended before any event");
            settle_failure(permit, &error);
            Err(error)
        }
    }
}

/// Events from the provider that won the fallback race.
///
/// The successful attempt is recorded when the stream terminates, so the
/// record carries the real outcome and latency. Dropping the stream early
/// records a cancelled attempt without touching the circuit.
pub struct OrchestratedStream {
    provider_id: ProviderId,
    first: Option<StreamEvent>,
    inner: ProviderStream,
    permit: Option<CircuitPermit>,
    started_at: DateTime<Utc>,
    start: Instant,
    recorder: AttemptRecorder,
    finished: bool,
}

impl std::fmt::Debug for OrchestratedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratedStream")
            .field("provider_id", &self.provider_id)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl OrchestratedStream {
    /// Provider serving the request
    #[must_use]
    pub fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    /// Attempts so far, including skips and failed providers
    #[must_use]
    pub fn history(&self) -> &AttemptHistory {
        &self.recorder.history
    }

    fn finish(&mut self, result: Result<(), &GatewayError>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let outcome = match result {
            Ok(()) => {
                if let Some(permit) = self.permit.take() {
                    permit.succeed();
                }
                AttemptOutcome::Succeeded
            }
            Err(error) => {
                if let Some(permit) = self.permit.take() {
                    settle_failure(permit, error);
                }
                warn!(
                    request_id = %self.recorder.request.request_id,
                    provider = %self.provider_id,
                    error = %error,
                    "Stream failed after output started"
                );
                AttemptOutcome::failed(error)
            }
        };
        self.recorder
            .record(&self.provider_id, self.started_at, outcome, self.start.elapsed());
    }

    /// Track terminal events as they pass through
    fn observe(&mut self, item: Result<StreamEvent, GatewayError>) -> Result<StreamEvent, GatewayError> {
        match &item {
            Ok(StreamEvent::Done { .. }) => self.finish(Ok(())),
            Ok(StreamEvent::Error { message, .. }) => {
                let error =
                    GatewayError::provider(self.provider_id.as_str(), message.clone(), None, false);
                self.finish(Err(&error));
            }
            Ok(_) => {}
            Err(error) => self.finish(Err(error)),
        }
        item
    }
}

impl Stream for OrchestratedStream {
    type Item = Result<StreamEvent, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(first) = this.first.take() {
            return Poll::Ready(Some(this.observe(Ok(first))));
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some(this.observe(item))),
            Poll::Ready(None) => {
                let error = GatewayError::protocol(
                    this.provider_id.as_str(),
                    "stream ended without a terminal event",
                );
                this.finish(Err(&error));
                Poll::Ready(Some(Err(error)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for OrchestratedStream {
    fn drop(&mut self) {
        if !self.finished {
            // the permit is abandoned by its own drop
            self.finish(Err(&GatewayError::Cancelled));
        }
    }
}
