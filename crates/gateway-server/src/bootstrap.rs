//! Assembles a [`Gateway`] from configuration.

use gateway_config::{
    AdmissionSettings, CircuitBreakerSettings, GatewayConfig, RateLimitSettings, RetrySettings,
};
use gateway_core::{GatewayError, ProviderId, SessionStore};
use gateway_providers::{build_provider, ProviderEndpoint, ProviderRegistry};
use gateway_resilience::{
    AdmissionConfig, AdmissionController, CircuitBreakerConfig, CircuitBreakerRegistry,
    RateLimiter, RateLimiterConfig, RedisRateLimitStore, RetryPolicy, RetryPolicyBuilder,
};
use gateway_routing::FallbackOrchestrator;
use gateway_telemetry::{AuditSink, Metrics};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::facade::Gateway;

const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared collaborators handed to the gateway
pub struct Collaborators {
    /// Audit sink
    pub audit: Arc<dyn AuditSink>,
    /// Metrics
    pub metrics: Metrics,
    /// Session store, if one is configured
    pub sessions: Option<Arc<dyn SessionStore>>,
}

/// Register every enabled provider
///
/// # Errors
/// Returns error if a provider cannot be built or an ID repeats
pub fn build_registry(config: &GatewayConfig) -> Result<ProviderRegistry, GatewayError> {
    let registry = ProviderRegistry::new();
    for settings in config.enabled_providers() {
        let mut endpoint = ProviderEndpoint::new(settings.id.as_str(), settings.endpoint.as_str())
            .with_secret(settings.api_key.clone());
        if let Some(model) = &settings.model {
            endpoint = endpoint.with_model(model.as_str());
        }
        if endpoint.api_key.is_none() {
            warn!(provider = %settings.id, "Provider has no API key");
        }

        let provider = build_provider(settings.provider_type, endpoint, settings.timeout)?;
        registry.register(provider, settings.priority)?;
    }

    if !config.default_providers.is_empty() {
        registry.set_default_order(
            config
                .default_providers
                .iter()
                .map(|id| ProviderId::new(id.as_str()))
                .collect(),
        );
    }
    Ok(registry)
}

/// Breaker settings
#[must_use]
pub fn breaker_config(settings: &CircuitBreakerSettings) -> CircuitBreakerConfig {
    CircuitBreakerConfig::default()
        .with_failure_threshold(settings.failure_threshold)
        .with_open_duration(settings.open_duration)
        .with_trial_limit(settings.half_open_trial_limit)
}

/// Retry policy
#[must_use]
pub fn retry_policy(settings: &RetrySettings) -> RetryPolicy {
    RetryPolicyBuilder::new()
        .max_retries(settings.max_retries)
        .base_delay(settings.base_delay)
        .max_delay(settings.max_delay)
        .multiplier(settings.multiplier)
        .jitter(settings.jitter)
        .build()
}

/// Admission settings
#[must_use]
pub fn admission_config(settings: &AdmissionSettings) -> AdmissionConfig {
    let mut config = AdmissionConfig::new(settings.max_concurrent).with_max_wait(settings.max_wait);
    if let Some(limit) = settings.per_caller_limit {
        config = config.with_per_caller_limit(limit);
    }
    if let Some(depth) = settings.max_queue_depth {
        config = config.with_max_queue_depth(depth);
    }
    config
}

/// Rate limiter settings
#[must_use]
pub fn rate_limiter_config(settings: &RateLimitSettings) -> RateLimiterConfig {
    RateLimiterConfig {
        enabled: settings.enabled,
        window: settings.window,
        completion_limit: settings.completion_limit,
        stream_limit: settings.stream_limit,
        store_timeout: settings.store_timeout,
        primary_retry_after: settings.primary_retry_after,
        key_prefix: settings.key_prefix.clone(),
    }
}

/// Rate limiter backed by Redis when configured and reachable, memory otherwise
pub async fn build_rate_limiter(settings: &RateLimitSettings) -> RateLimiter {
    let config = rate_limiter_config(settings);
    let Some(url) = settings.redis_url.as_deref() else {
        info!("Rate limiting with the in-memory store");
        return RateLimiter::in_memory(config);
    };

    match tokio::time::timeout(REDIS_CONNECT_TIMEOUT, RedisRateLimitStore::connect(url)).await {
        Ok(Ok(store)) => RateLimiter::with_primary(config, Arc::new(store)),
        Ok(Err(error)) => {
            warn!(error = %error, "Redis unavailable; rate limiting in memory only");
            RateLimiter::in_memory(config)
        }
        Err(_) => {
            warn!(timeout = ?REDIS_CONNECT_TIMEOUT, "Redis connect timed out; rate limiting in memory only");
            RateLimiter::in_memory(config)
        }
    }
}

/// Build the whole gateway
///
/// # Errors
/// Returns error if a provider cannot be built
pub async fn build_gateway(
    config: &GatewayConfig,
    collaborators: Collaborators,
) -> Result<Gateway, GatewayError> {
    let registry = Arc::new(build_registry(config)?);
    let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_config(&config.circuit_breaker)));
    let orchestrator = FallbackOrchestrator::new(
        registry,
        breakers,
        retry_policy(&config.retry),
        Arc::clone(&collaborators.audit),
    )
    .with_metrics(collaborators.metrics.clone());
    let rate_limiter = build_rate_limiter(&config.rate_limit).await;

    let mut builder = Gateway::builder()
        .rate_limiter(Arc::new(rate_limiter))
        .admission(AdmissionController::new(admission_config(&config.admission)))
        .orchestrator(Arc::new(orchestrator))
        .audit(collaborators.audit)
        .metrics(collaborators.metrics)
        .event_buffer(config.server.event_buffer);
    if let Some(sessions) = collaborators.sessions {
        builder = builder.sessions(sessions);
    }
    builder.build()
}
