//! HTTP transport for protocol adapters.

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use gateway_core::{
    CompletionProvider, CompletionRequest, GatewayError, ProviderAdapter, ProviderId,
    ProviderKind, ProviderStream, SseFrame, StreamState,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use reqwest_eventsource::retry::Never;
use reqwest_eventsource::{Error as EventSourceError, Event, EventSource};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default connect timeout for provider clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// A [`CompletionProvider`] that speaks HTTP through a protocol adapter.
///
/// `timeout` bounds the wait for response headers, for a non-streaming body,
/// and for each gap between streamed chunks.
pub struct HttpProvider<A> {
    adapter: Arc<A>,
    client: Client,
    timeout: Duration,
}

impl<A: ProviderAdapter> HttpProvider<A> {
    /// Create a provider with its own connection pool
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(adapter: A, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .pool_max_idle_per_host(100)
            .build()
            .map_err(|e| GatewayError::internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(adapter, client, timeout))
    }

    /// Create a provider sharing an existing client
    #[must_use]
    pub fn with_client(adapter: A, client: Client, timeout: Duration) -> Self {
        Self {
            adapter: Arc::new(adapter),
            client,
            timeout,
        }
    }

    /// The wrapped adapter
    #[must_use]
    pub fn adapter(&self) -> &A {
        &self.adapter
    }
}

#[async_trait]
impl<A: ProviderAdapter> CompletionProvider for HttpProvider<A> {
    fn id(&self) -> &ProviderId {
        self.adapter.id()
    }

    fn kind(&self) -> ProviderKind {
        self.adapter.kind()
    }

    async fn start(&self, request: &CompletionRequest) -> Result<ProviderStream, GatewayError> {
        let provider = self.adapter.id().clone();
        let timeout = self.timeout;
        let wire = self.adapter.translate_request(request)?;

        debug!(
            provider = %provider,
            request_id = %request.request_id,
            url = %wire.url,
            streaming = wire.streaming,
            "Sending request to provider"
        );

        let mut builder = self.client.post(&wire.url).json(&wire.body);
        for (name, value) in &wire.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if !wire.streaming {
            return self.start_blocking(builder).await;
        }

        let mut source = EventSource::new(builder)
            .map_err(|e| GatewayError::internal(format!("Failed to create event source: {e}")))?;
        // one attempt is one connection; retries belong to the orchestrator
        source.set_retry_policy(Box::new(Never));

        // connect now, so status and transport failures surface before the
        // first event is handed out
        let mut pending = None;
        match tokio::time::timeout(timeout, source.next()).await {
            Err(_) => return Err(GatewayError::timeout(provider.as_str(), timeout)),
            Ok(Some(Ok(Event::Open))) => {}
            Ok(Some(Ok(Event::Message(message)))) => pending = Some(message),
            Ok(Some(Err(error))) => return Err(self.open_error(error).await),
            Ok(None) => {
                return Err(GatewayError::protocol(provider.as_str(), "stream closed before opening"))
            }
        }
        trace!(provider = %provider, "Provider stream opened");

        let adapter = Arc::clone(&self.adapter);
        let stream = try_stream! {
            let mut state = StreamState::default();

            if let Some(message) = pending {
                let frame = SseFrame::named(message.event, message.data);
                for event in adapter.parse_stream_chunk(&frame, &mut state)? {
                    yield event;
                }
            }

            while !state.done {
                let next = tokio::time::timeout(timeout, source.next())
                    .await
                    .map_err(|_| GatewayError::timeout(provider.as_str(), timeout))?;
                match next {
                    Some(Ok(Event::Open)) => {}
                    Some(Ok(Event::Message(message))) => {
                        let frame = SseFrame::named(message.event, message.data);
                        for event in adapter.parse_stream_chunk(&frame, &mut state)? {
                            yield event;
                        }
                    }
                    Some(Err(EventSourceError::StreamEnded)) | None => break,
                    Some(Err(error)) => Err(stream_error(&provider, error, timeout))?,
                }
            }
            source.close();

            for event in adapter.finish_stream(&mut state)? {
                yield event;
            }
        };

        Ok(Box::pin(stream))
    }
}

impl<A: ProviderAdapter> HttpProvider<A> {
    async fn start_blocking(&self, builder: RequestBuilder) -> Result<ProviderStream, GatewayError> {
        let provider = self.adapter.id();
        let timeout = self.timeout;

        let response = tokio::time::timeout(timeout, builder.send())
            .await
            .map_err(|_| GatewayError::timeout(provider.as_str(), timeout))?
            .map_err(|e| classify_transport_error(provider, &e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, response).await);
        }

        let body = tokio::time::timeout(timeout, response.bytes())
            .await
            .map_err(|_| GatewayError::timeout(provider.as_str(), timeout))?
            .map_err(|e| classify_transport_error(provider, &e, timeout))?;
        let events = self.adapter.parse_non_stream_response(&body)?;
        Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed())
    }

    async fn status_error(&self, status: StatusCode, response: Response) -> GatewayError {
        let body = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .ok()
            .and_then(Result::ok)
            .unwrap_or_default();
        let error = self.adapter.parse_error_response(status.as_u16(), &body);
        warn!(provider = %self.adapter.id(), status = status.as_u16(), error = %error, "Provider returned error status");
        error
    }

    async fn open_error(&self, error: EventSourceError) -> GatewayError {
        let provider = self.adapter.id();
        match error {
            EventSourceError::InvalidStatusCode(status, response) => {
                self.status_error(status, response).await
            }
            EventSourceError::InvalidContentType(content_type, _) => GatewayError::protocol(
                provider.as_str(),
                format!("expected an event stream, got content type {content_type:?}"),
            ),
            other => stream_error(provider, other, self.timeout),
        }
    }
}

fn stream_error(provider: &ProviderId, error: EventSourceError, timeout: Duration) -> GatewayError {
    match error {
        EventSourceError::Transport(e) => classify_transport_error(provider, &e, timeout),
        other => GatewayError::protocol(provider.as_str(), format!("malformed event stream: {other}")),
    }
}

/// Map a reqwest failure onto the error taxonomy.
///
/// Timeouts, refused connections and mid-body resets are transient.
pub(crate) fn classify_transport_error(
    provider: &ProviderId,
    error: &reqwest::Error,
    timeout: Duration,
) -> GatewayError {
    if error.is_timeout() {
        GatewayError::timeout(provider.as_str(), timeout)
    } else if error.is_connect() || error.is_body() || error.is_request() {
        GatewayError::connection(provider.as_str(), error.to_string())
    } else {
        GatewayError::provider(provider.as_str(), error.to_string(), None, false)
    }
}

/// Best-effort human message from a provider error body.
///
/// Understands the common envelopes (`{"error":{"message"}}`,
/// `{"message"}`, `{"error":"..."}`, `{"statusText"}`) and falls back to the
/// raw text, truncated.
pub(crate) fn error_message_from_body(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        let candidates = [
            value.pointer("/error/message"),
            value.get("message"),
            value.get("error").filter(|e| e.is_string()),
            value.get("msg"),
            value.get("statusText"),
        ];
        if let Some(message) = candidates
            .into_iter()
            .flatten()
            .filter_map(serde_json::Value::as_str)
            .find(|s| !s.is_empty())
        {
            return message.to_string();
        }
    }

    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "empty error response".to_string();
    }
    text.chars().take(MAX_ERROR_MESSAGE_LEN).collect()
}
