//! Request lifecycle.
//!
//! [`Gateway::submit`] drives one request through
//! `received → admitted → fallback_in_progress → streaming → completed`.
//! `rate_limited` and `failed` are the other terminal phases. The admission
//! slot is given back the moment any terminal phase is reached, whatever the
//! reason, and exactly one terminal audit event is published per request.

use async_stream::stream;
use futures::stream::{BoxStream, StreamExt};
use gateway_core::{
    CompletionRequest, ErrorCode, GatewayError, MessageRole, NoopSessionStore, ProviderId,
    RequestId, SessionStore, StreamEvent,
};
use gateway_resilience::{AdmissionController, EndpointClass, QueueTicket, RateLimiter};
use gateway_routing::{DeliveryMode, FallbackOrchestrator, StreamMultiplexer};
use gateway_telemetry::{
    AuditEventBuilder, AuditEventType, AuditOutcome, AuditSink, Metrics, NoopAuditSink,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Default capacity of a request's event channel
pub const DEFAULT_EVENT_BUFFER: usize = 64;

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayPhase {
    /// Accepted, not yet checked
    Received,
    /// Rejected by the rate limiter
    RateLimited,
    /// Holding an admission slot
    Admitted,
    /// Looking for a provider
    FallbackInProgress,
    /// Forwarding provider output
    Streaming,
    /// Finished with `done`
    Completed,
    /// Finished with `error`
    Failed,
}

impl GatewayPhase {
    /// Wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::RateLimited => "rate_limited",
            Self::Admitted => "admitted",
            Self::FallbackInProgress => "fallback_in_progress",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// No transitions leave a terminal phase
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::RateLimited | Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Received, Self::RateLimited | Self::Admitted | Self::Failed)
                | (Self::Admitted, Self::FallbackInProgress | Self::Failed)
                | (Self::FallbackInProgress, Self::Streaming | Self::Failed)
                | (Self::Streaming, Self::Completed | Self::Failed)
        )
    }
}

impl fmt::Display for GatewayPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase bookkeeping for one request; owns its admission slot
#[derive(Debug)]
pub struct RequestLifecycle {
    request_id: RequestId,
    phase: GatewayPhase,
    ticket: Option<QueueTicket>,
    metrics: Option<Metrics>,
    failure: Option<(ErrorCode, String)>,
    provider_id: Option<ProviderId>,
}

impl RequestLifecycle {
    /// Start tracking a request in `received`
    #[must_use]
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            phase: GatewayPhase::Received,
            ticket: None,
            metrics: None,
            failure: None,
            provider_id: None,
        }
    }

    /// Report admissions and releases on these metrics
    #[must_use]
    pub fn with_metrics(mut self, metrics: Option<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> GatewayPhase {
        self.phase
    }

    /// Code and message of the failure that ended the request
    #[must_use]
    pub fn failure(&self) -> Option<&(ErrorCode, String)> {
        self.failure.as_ref()
    }

    /// Provider that served the request
    #[must_use]
    pub fn provider_id(&self) -> Option<&ProviderId> {
        self.provider_id.as_ref()
    }

    /// Whether an admission slot is currently held
    #[must_use]
    pub fn holds_slot(&self) -> bool {
        self.ticket.is_some()
    }

    /// Move to `next`.
    ///
    /// # Errors
    /// `INTERNAL_ERROR` for a transition the state machine does not allow
    pub fn transition(&mut self, next: GatewayPhase) -> Result<(), GatewayError> {
        if !self.phase.can_transition_to(next) {
            return Err(GatewayError::internal(format!(
                "illegal lifecycle transition {} -> {next}",
                self.phase
            )));
        }
        debug!(request_id = %self.request_id, from = %self.phase, to = %next, "Lifecycle transition");
        self.phase = next;
        if next.is_terminal() {
            self.release_slot();
        }
        Ok(())
    }

    /// `received → admitted`, taking ownership of the slot
    ///
    /// # Errors
    /// `INTERNAL_ERROR` when not in `received`
    pub fn admit(&mut self, ticket: QueueTicket) -> Result<(), GatewayError> {
        self.transition(GatewayPhase::Admitted)?;
        if let Some(metrics) = &self.metrics {
            metrics.request_admitted(ticket.wait_time());
        }
        self.ticket = Some(ticket);
        Ok(())
    }

    /// Record the serving provider
    pub fn set_provider(&mut self, provider_id: ProviderId) {
        self.provider_id = Some(provider_id);
    }

    /// `received → rate_limited`
    ///
    /// # Errors
    /// `INTERNAL_ERROR` when not in `received`
    pub fn reject(&mut self, error: &GatewayError) -> Result<(), GatewayError> {
        self.transition(GatewayPhase::RateLimited)?;
        self.failure = Some((error.code(), error.to_string()));
        Ok(())
    }

    /// Any non-terminal phase `→ failed`
    ///
    /// # Errors
    /// `INTERNAL_ERROR` when the request already ended
    pub fn fail(&mut self, code: ErrorCode, message: impl Into<String>) -> Result<(), GatewayError> {
        self.transition(GatewayPhase::Failed)?;
        self.failure = Some((code, message.into()));
        Ok(())
    }

    fn release_slot(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.release();
            if let Some(metrics) = &self.metrics {
                metrics.request_released();
            }
        }
    }
}

impl Drop for RequestLifecycle {
    fn drop(&mut self) {
        self.release_slot();
    }
}

/// Caller's side of a running request
#[derive(Debug)]
pub struct CompletionHandle {
    request_id: RequestId,
    events: mpsc::Receiver<StreamEvent>,
    cancel: watch::Sender<bool>,
}

impl CompletionHandle {
    /// Request being served
    #[must_use]
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Next event; `None` once the terminal event has been consumed
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Abort the request. A `CANCELLED` error event follows unless the
    /// request already ended.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Consume the handle as a stream; dropping the stream cancels the request
    pub fn into_stream(self) -> BoxStream<'static, StreamEvent> {
        stream! {
            let mut handle = self;
            while let Some(event) = handle.events.recv().await {
                yield event;
            }
        }
        .boxed()
    }
}

enum Finish {
    Completed { reply: String },
    /// Failed before any event reached the caller
    Failed(GatewayError),
    /// Failure already delivered as an `error` event
    StreamFailed { code: ErrorCode, message: String },
    Cancelled,
    Disconnected,
}

struct Inner {
    rate_limiter: Arc<RateLimiter>,
    admission: AdmissionController,
    orchestrator: Arc<FallbackOrchestrator>,
    sessions: Arc<dyn SessionStore>,
    audit: Arc<dyn AuditSink>,
    metrics: Option<Metrics>,
    event_buffer: usize,
}

/// Gateway façade; cheap to clone
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("rate_limiter", &self.inner.rate_limiter)
            .field("admission", &self.inner.admission.stats())
            .field("event_buffer", &self.inner.event_buffer)
            .finish_non_exhaustive()
    }
}

impl Gateway {
    /// Create a builder
    #[must_use]
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Rate limiter
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.rate_limiter
    }

    /// Admission controller
    #[must_use]
    pub fn admission(&self) -> &AdmissionController {
        &self.inner.admission
    }

    /// Fallback orchestrator
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.inner.orchestrator
    }

    /// Metrics, when enabled
    #[must_use]
    pub fn metrics(&self) -> Option<&Metrics> {
        self.inner.metrics.as_ref()
    }

    /// Start serving a request.
    ///
    /// Validation and the rate limit are checked before this returns;
    /// everything after that is reported through the handle's events.
    ///
    /// # Errors
    /// `INVALID_REQUEST` or `RATE_LIMITED`
    pub async fn submit(&self, request: CompletionRequest) -> Result<CompletionHandle, GatewayError> {
        let request = Arc::new(request);
        let mut lifecycle =
            RequestLifecycle::new(request.request_id.clone()).with_metrics(self.inner.metrics.clone());

        if let Err(error) = request.validate() {
            lifecycle.fail(error.code(), error.to_string())?;
            self.inner.publish_terminal(&request, &lifecycle);
            return Err(error);
        }

        let class = EndpointClass::for_streaming(request.streaming);
        if let Err(error) = self
            .inner
            .rate_limiter
            .enforce(request.caller_id.as_str(), class)
            .await
        {
            lifecycle.reject(&error)?;
            if let Some(metrics) = &self.inner.metrics {
                metrics.record_rate_limited(class.as_str());
            }
            self.inner.publish_terminal(&request, &lifecycle);
            return Err(error);
        }

        let (events_tx, events_rx) = mpsc::channel(self.inner.event_buffer);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let request_id = request.request_id.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.run(request, lifecycle, events_tx, cancel_rx).await;
        });

        Ok(CompletionHandle {
            request_id,
            events: events_rx,
            cancel: cancel_tx,
        })
    }
}

impl Inner {
    async fn run(
        &self,
        request: Arc<CompletionRequest>,
        mut lifecycle: RequestLifecycle,
        events: mpsc::Sender<StreamEvent>,
        mut cancel: watch::Receiver<bool>,
    ) {
        let finish = {
            let drive = self.drive(&request, &mut lifecycle, &events);
            tokio::select! {
                biased;
                () = wait_cancelled(&mut cancel) => Finish::Cancelled,
                () = events.closed() => Finish::Disconnected,
                finish = drive => finish,
            }
        };

        let settled = match finish {
            Finish::Completed { reply } => {
                let settled = lifecycle.transition(GatewayPhase::Completed);
                if settled.is_ok() {
                    self.append_session(&request, reply).await;
                }
                settled
            }
            Finish::Failed(error) => {
                deliver(&events, StreamEvent::from_error(&error)).await;
                lifecycle.fail(error.code(), error.to_string())
            }
            Finish::StreamFailed { code, message } => lifecycle.fail(code, message),
            Finish::Cancelled => {
                let error = GatewayError::Cancelled;
                deliver(&events, StreamEvent::from_error(&error)).await;
                lifecycle.fail(error.code(), error.to_string())
            }
            Finish::Disconnected => {
                debug!(request_id = %request.request_id, "Caller went away");
                lifecycle.fail(ErrorCode::Cancelled, GatewayError::Cancelled.to_string())
            }
        };
        if let Err(error) = settled {
            warn!(request_id = %request.request_id, error = %error, "Lifecycle bookkeeping failed");
        }

        self.publish_terminal(&request, &lifecycle);
    }

    async fn drive(
        &self,
        request: &Arc<CompletionRequest>,
        lifecycle: &mut RequestLifecycle,
        events: &mpsc::Sender<StreamEvent>,
    ) -> Finish {
        let ticket = match self
            .admission
            .enqueue(request.caller_id.clone(), request.priority)
            .await
        {
            Ok(ticket) => ticket,
            Err(error) => return Finish::Failed(error),
        };
        if let Err(error) = lifecycle.admit(ticket) {
            return Finish::Failed(error);
        }
        if let Err(error) = lifecycle.transition(GatewayPhase::FallbackInProgress) {
            return Finish::Failed(error);
        }

        let upstream = match self.orchestrator.complete(Arc::clone(request)).await {
            Ok(upstream) => upstream,
            Err(error) => return Finish::Failed(error),
        };
        let provider_id = upstream.provider_id().clone();
        lifecycle.set_provider(provider_id.clone());
        if let Err(error) = lifecycle.transition(GatewayPhase::Streaming) {
            return Finish::Failed(error);
        }

        let mode = DeliveryMode::for_streaming(request.streaming);
        let mut output = StreamMultiplexer::new(mode, provider_id.as_str()).run(upstream);
        let mut reply = String::new();

        while let Some(event) = output.next().await {
            let ending = match &event {
                StreamEvent::Delta { text } => {
                    reply.push_str(text);
                    None
                }
                StreamEvent::Done { content, .. } => {
                    if let Some(content) = content.as_deref().filter(|_| reply.is_empty()) {
                        reply.push_str(content);
                    }
                    Some(None)
                }
                StreamEvent::Error { code, message, .. } => Some(Some((*code, message.clone()))),
                StreamEvent::Usage(_) => None,
            };

            if events.send(event).await.is_err() {
                return Finish::Disconnected;
            }
            match ending {
                Some(None) => return Finish::Completed { reply },
                Some(Some((code, message))) => return Finish::StreamFailed { code, message },
                None => {}
            }
        }

        Finish::Failed(GatewayError::internal("output ended without a terminal event"))
    }

    async fn append_session(&self, request: &CompletionRequest, reply: String) {
        let Some(session_id) = request.session_id.as_deref() else {
            return;
        };
        if let Some(prompt) = request.last_user_message() {
            if let Err(error) = self
                .sessions
                .append_message(session_id, MessageRole::User, prompt)
                .await
            {
                warn!(request_id = %request.request_id, session_id, error = %error, "Session append failed");
                return;
            }
        }
        if let Err(error) = self
            .sessions
            .append_message(session_id, MessageRole::Assistant, &reply)
            .await
        {
            warn!(request_id = %request.request_id, session_id, error = %error, "Session append failed");
        }
    }

    fn publish_terminal(&self, request: &CompletionRequest, lifecycle: &RequestLifecycle) {
        let phase = lifecycle.phase();
        let failure = lifecycle.failure();
        let outcome = match failure {
            None => AuditOutcome::Success,
            Some((ErrorCode::Cancelled, _)) => AuditOutcome::Cancelled,
            Some((ErrorCode::RateLimited | ErrorCode::QueueTimeout | ErrorCode::InvalidRequest, _)) => {
                AuditOutcome::Denied
            }
            Some(_) => AuditOutcome::Failure,
        };
        let label = failure.map_or_else(
            || phase.as_str().to_string(),
            |(code, _)| code.as_str().to_ascii_lowercase(),
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_request(&label);
        }

        let mut event = AuditEventBuilder::new(AuditEventType::RequestTerminal)
            .outcome(outcome)
            .request_id(&request.request_id)
            .caller_id(&request.caller_id)
            .metadata("phase", phase.as_str())
            .metadata("streaming", request.streaming);
        if let Some(provider_id) = lifecycle.provider_id() {
            event = event.provider_id(provider_id);
        }
        if let Some((code, message)) = failure {
            event = event.error_code(*code).description(message.clone());
        }
        self.audit.publish(event.build());

        info!(
            request_id = %request.request_id,
            caller_id = %request.caller_id,
            provider = lifecycle.provider_id().map(ProviderId::as_str),
            phase = %phase,
            outcome = %label,
            "Request finished"
        );
    }
}

/// Resolves once cancellation is requested; never if the handle is dropped
/// without cancelling, since that shows up as a closed event channel.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Send unless the caller has gone away
async fn deliver(events: &mpsc::Sender<StreamEvent>, event: StreamEvent) {
    tokio::select! {
        _ = events.send(event) => {}
        () = events.closed() => {}
    }
}

/// Builder for [`Gateway`]
#[derive(Default)]
pub struct GatewayBuilder {
    rate_limiter: Option<Arc<RateLimiter>>,
    admission: Option<AdmissionController>,
    orchestrator: Option<Arc<FallbackOrchestrator>>,
    sessions: Option<Arc<dyn SessionStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    metrics: Option<Metrics>,
    event_buffer: Option<usize>,
}

impl GatewayBuilder {
    /// Rate limiter (required)
    #[must_use]
    pub fn rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(rate_limiter);
        self
    }

    /// Admission controller (required)
    #[must_use]
    pub fn admission(mut self, admission: AdmissionController) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Fallback orchestrator (required)
    #[must_use]
    pub fn orchestrator(mut self, orchestrator: Arc<FallbackOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Session store; defaults to discarding
    #[must_use]
    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Audit sink; defaults to discarding
    #[must_use]
    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Metrics
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Per-request event channel capacity
    #[must_use]
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = Some(capacity);
        self
    }

    /// Build the gateway
    ///
    /// # Errors
    /// `Configuration` when a required component is missing
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let rate_limiter = self
            .rate_limiter
            .ok_or_else(|| GatewayError::configuration("gateway requires a rate limiter"))?;
        let admission = self
            .admission
            .ok_or_else(|| GatewayError::configuration("gateway requires an admission controller"))?;
        let orchestrator = self
            .orchestrator
            .ok_or_else(|| GatewayError::configuration("gateway requires a fallback orchestrator"))?;

        Ok(Gateway {
            inner: Arc::new(Inner {
                rate_limiter,
                admission,
                orchestrator,
                sessions: self.sessions.unwrap_or_else(|| Arc::new(NoopSessionStore)),
                audit: self.audit.unwrap_or_else(|| Arc::new(NoopAuditSink)),
                metrics: self.metrics,
                event_buffer: self.event_buffer.unwrap_or(DEFAULT_EVENT_BUFFER).max(1),
            }),
        })
    }
}
