//! Prometheus metrics.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Metrics error
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Metric could not be created or registered
    #[error("metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    /// Exposition text was not UTF-8
    #[error("metric encoding failed: {0}")]
    Encoding(String),
}

/// Gateway metrics on a private registry
#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    provider_attempts_total: IntCounterVec,
    provider_attempt_duration: prometheus::HistogramVec,
    in_flight_requests: IntGauge,
    queue_wait_seconds: Histogram,
    rate_limit_rejections_total: IntCounterVec,
    audit_dropped_total: IntCounter,
}

impl Metrics {
    /// Create and register every metric
    ///
    /// # Errors
    /// Returns error if registration fails
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Completion requests by terminal outcome"),
            &["outcome"],
        )?;
        let provider_attempts_total = IntCounterVec::new(
            Opts::new("gateway_provider_attempts_total", "Provider attempts by outcome"),
            &["provider", "outcome"],
        )?;
        let provider_attempt_duration = prometheus::HistogramVec::new(
            HistogramOpts::new(
                "gateway_provider_attempt_duration_seconds",
                "Provider attempt latency",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["provider"],
        )?;
        let in_flight_requests = IntGauge::with_opts(Opts::new(
            "gateway_in_flight_requests",
            "Requests holding an admission slot",
        ))?;
        let queue_wait_seconds = Histogram::with_opts(
            HistogramOpts::new("gateway_queue_wait_seconds", "Time spent waiting for admission")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        let rate_limit_rejections_total = IntCounterVec::new(
            Opts::new(
                "gateway_rate_limit_rejections_total",
                "Requests rejected by the rate limiter",
            ),
            &["class"],
        )?;
        let audit_dropped_total = IntCounter::with_opts(Opts::new(
            "gateway_audit_dropped_total",
            "Audit events dropped because the sink was full",
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(provider_attempts_total.clone()))?;
        registry.register(Box::new(provider_attempt_duration.clone()))?;
        registry.register(Box::new(in_flight_requests.clone()))?;
        registry.register(Box::new(queue_wait_seconds.clone()))?;
        registry.register(Box::new(rate_limit_rejections_total.clone()))?;
        registry.register(Box::new(audit_dropped_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            provider_attempts_total,
            provider_attempt_duration,
            in_flight_requests,
            queue_wait_seconds,
            rate_limit_rejections_total,
            audit_dropped_total,
        })
    }

    /// Count a request reaching a terminal state
    pub fn record_request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    /// Count a provider attempt
    pub fn record_attempt(&self, provider: &str, outcome: &str, latency: Duration) {
        self.provider_attempts_total
            .with_label_values(&[provider, outcome])
            .inc();
        if outcome != "skipped_circuit_open" {
            self.provider_attempt_duration
                .with_label_values(&[provider])
                .observe(latency.as_secs_f64());
        }
    }

    /// A request took an admission slot
    pub fn request_admitted(&self, queue_wait: Duration) {
        self.in_flight_requests.inc();
        self.queue_wait_seconds.observe(queue_wait.as_secs_f64());
    }

    /// A request gave its admission slot back
    pub fn request_released(&self) {
        self.in_flight_requests.dec();
    }

    /// Count a rate-limit rejection
    pub fn record_rate_limited(&self, class: &str) {
        self.rate_limit_rejections_total
            .with_label_values(&[class])
            .inc();
    }

    /// Counter bumped by the audit sink on overflow
    #[must_use]
    pub fn audit_dropped(&self) -> IntCounter {
        self.audit_dropped_total.clone()
    }

    /// Current in-flight gauge value
    #[must_use]
    pub fn in_flight(&self) -> i64 {
        self.in_flight_requests.get()
    }

    /// Prometheus text exposition
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
