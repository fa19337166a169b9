//! Stream normalization for delivery.
//!
//! Whatever the upstream does, the output is a well-formed sequence: zero or
//! more non-terminal events, then exactly one `done` or `error`.

use async_stream::stream;
use futures::stream::{BoxStream, Stream, StreamExt};
use gateway_core::{FinishReason, GatewayError, StreamEvent, Usage};

/// How events reach the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Forward events as they arrive
    Streaming,
    /// Buffer everything into one `done` carrying the full content
    Aggregate,
}

impl DeliveryMode {
    /// Mode for a request's streaming flag
    #[must_use]
    pub fn for_streaming(streaming: bool) -> Self {
        if streaming {
            Self::Streaming
        } else {
            Self::Aggregate
        }
    }
}

/// Normalizes one upstream sequence
#[derive(Debug, Clone)]
pub struct StreamMultiplexer {
    mode: DeliveryMode,
    source: String,
}

impl StreamMultiplexer {
    /// Create a multiplexer; `source` names the upstream in synthesized errors
    #[must_use]
    pub fn new(mode: DeliveryMode, source: impl Into<String>) -> Self {
        Self {
            mode,
            source: source.into(),
        }
    }

    /// Delivery mode
    #[must_use]
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Wrap an upstream sequence
    pub fn run<S>(self, upstream: S) -> BoxStream<'static, StreamEvent>
    where
        S: Stream<Item = Result<StreamEvent, GatewayError>> + Send + 'static,
    {
        match self.mode {
            DeliveryMode::Streaming => streaming(upstream, self.source),
            DeliveryMode::Aggregate => aggregate(upstream, self.source),
        }
    }
}

fn missing_terminal(source: &str) -> StreamEvent {
    StreamEvent::from_error(&GatewayError::protocol(
        source,
        "upstream ended without a terminal event",
    ))
}

fn streaming<S>(upstream: S, source: String) -> BoxStream<'static, StreamEvent>
where
    S: Stream<Item = Result<StreamEvent, GatewayError>> + Send + 'static,
{
    stream! {
        let mut upstream = Box::pin(upstream);
        let mut saw_delta = false;
        let mut saw_usage = false;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(StreamEvent::Delta { text }) => {
                    if !text.is_empty() {
                        saw_delta = true;
                        yield StreamEvent::Delta { text };
                    }
                }
                Ok(StreamEvent::Usage(usage)) => {
                    saw_usage = true;
                    yield StreamEvent::Usage(usage);
                }
                Ok(StreamEvent::Done { finish_reason, content, usage }) => {
                    // blocking upstreams hand the whole reply over at the end
                    if let Some(text) = content.filter(|t| !saw_delta && !t.is_empty()) {
                        yield StreamEvent::delta(text);
                    }
                    // usage already forwarded is not repeated
                    if let Some(usage) = usage.filter(|_| !saw_usage) {
                        yield StreamEvent::Usage(usage);
                    }
                    yield StreamEvent::done(finish_reason);
                    return;
                }
                Ok(event @ StreamEvent::Error { .. }) => {
                    yield event;
                    return;
                }
                Ok(event) => yield event,
                Err(error) => {
                    yield StreamEvent::from_error(&error);
                    return;
                }
            }
        }
        yield missing_terminal(&source);
    }
    .boxed()
}

fn aggregate<S>(upstream: S, source: String) -> BoxStream<'static, StreamEvent>
where
    S: Stream<Item = Result<StreamEvent, GatewayError>> + Send + 'static,
{
    stream! {
        let mut upstream = Box::pin(upstream);
        let mut buffer = String::new();
        let mut usage: Option<Usage> = None;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(StreamEvent::Delta { text }) => buffer.push_str(&text),
                Ok(StreamEvent::Usage(report)) => merge_usage(&mut usage, &report),
                Ok(StreamEvent::Done { finish_reason, content, usage: final_usage }) => {
                    if buffer.is_empty() {
                        if let Some(text) = content {
                            buffer = text;
                        }
                    }
                    if let Some(report) = final_usage {
                        merge_usage(&mut usage, &report);
                    }
                    yield aggregated_done(finish_reason, buffer, usage);
                    return;
                }
                Ok(event @ StreamEvent::Error { .. }) => {
                    yield event;
                    return;
                }
                Err(error) => {
                    yield StreamEvent::from_error(&error);
                    return;
                }
            }
        }
        yield missing_terminal(&source);
    }
    .boxed()
}

fn merge_usage(slot: &mut Option<Usage>, report: &Usage) {
    match slot {
        Some(existing) => existing.merge(report),
        None => *slot = Some(report.clone()),
    }
}

fn aggregated_done(finish_reason: FinishReason, content: String, usage: Option<Usage>) -> StreamEvent {
    StreamEvent::Done {
        finish_reason,
        content: Some(content),
        usage,
    }
}
