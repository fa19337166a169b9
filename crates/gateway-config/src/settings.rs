//! Configuration sections.

use gateway_core::ProviderKind;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use validator::Validate;

use crate::ConfigError;

/// Root gateway configuration
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP server settings
    #[validate(nested)]
    pub server: ServerSettings,

    /// Registered providers
    #[validate(nested)]
    pub providers: Vec<ProviderSettings>,

    /// Provider order used when a request gives no preference.
    /// Empty means "registry priority order".
    pub default_providers: Vec<String>,

    /// Circuit breaker settings, shared by every provider
    #[validate(nested)]
    pub circuit_breaker: CircuitBreakerSettings,

    /// Retry settings
    #[validate(nested)]
    pub retry: RetrySettings,

    /// Admission control settings
    #[validate(nested)]
    pub admission: AdmissionSettings,

    /// Rate limit settings
    #[validate(nested)]
    pub rate_limit: RateLimitSettings,

    /// Logging and audit settings
    #[validate(nested)]
    pub telemetry: TelemetrySettings,
}

impl GatewayConfig {
    /// Run field validation plus cross-section checks
    ///
    /// # Errors
    /// Returns a validation error describing the first problem found
    pub fn check(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            url::Url::parse(&provider.endpoint).map_err(|e| {
                ConfigError::Validation(format!(
                    "provider '{}' has invalid endpoint '{}': {e}",
                    provider.id, provider.endpoint
                ))
            })?;
        }

        for id in &self.default_providers {
            if !seen.contains(id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "default provider '{id}' is not configured"
                )));
            }
        }

        if let Some(per_caller) = self.admission.per_caller_limit {
            if per_caller > self.admission.max_concurrent {
                return Err(ConfigError::Validation(format!(
                    "admission.per_caller_limit ({per_caller}) exceeds max_concurrent ({})",
                    self.admission.max_concurrent
                )));
            }
        }

        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Validation(
                "retry.base_delay must not exceed retry.max_delay".to_string(),
            ));
        }

        Ok(())
    }

    /// Enabled providers only
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderSettings> {
        self.providers.iter().filter(|p| p.enabled)
    }
}

/// HTTP server settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address
    #[validate(length(min = 1))]
    pub host: String,

    /// Bind port
    #[validate(range(min = 1))]
    pub port: u16,

    /// Upper bound on a whole request, streaming included
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Capacity of the per-request event channel
    #[validate(range(min = 1, max = 4096))]
    pub event_buffer: usize,

    /// Grace period for in-flight requests on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout: Duration::from_secs(300),
            event_buffer: 64,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// One provider instance
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ProviderSettings {
    /// Unique provider ID used in `providerPreference`
    #[validate(length(min = 1, max = 64))]
    pub id: String,

    /// Protocol family
    pub provider_type: ProviderKind,

    /// Base URL of the provider API
    #[validate(length(min = 1))]
    pub endpoint: String,

    /// Inline API key
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Model name, for providers that require one
    #[serde(default)]
    pub model: Option<String>,

    /// Whether the provider is registered
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lower values come first in the default order
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Per-call timeout
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl ProviderSettings {
    /// Create provider settings with defaults
    #[must_use]
    pub fn new(id: impl Into<String>, provider_type: ProviderKind, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            provider_type,
            endpoint: endpoint.into(),
            api_key: None,
            api_key_env: None,
            model: None,
            enabled: true,
            priority: default_priority(),
            timeout: default_provider_timeout(),
        }
    }

    /// Set the API key
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(key.into()));
        self
    }

    /// Set the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures before opening
    #[validate(range(min = 1))]
    pub failure_threshold: u32,

    /// Cool-down before a trial is allowed
    #[serde(with = "humantime_serde")]
    pub open_duration: Duration,

    /// Concurrent trials while half-open
    #[validate(range(min = 1))]
    pub half_open_trial_limit: u32,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_trial_limit: 1,
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt
    #[validate(range(max = 10))]
    pub max_retries: u32,

    /// First backoff delay
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,

    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Backoff multiplier
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,

    /// Jitter fraction (0.2 = ±20%)
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

/// Admission control settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct AdmissionSettings {
    /// Global concurrency ceiling
    #[validate(range(min = 1))]
    pub max_concurrent: usize,

    /// Per-caller concurrency ceiling
    pub per_caller_limit: Option<usize>,

    /// Longest a request may wait for a slot
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,

    /// Waiters beyond this are rejected immediately
    pub max_queue_depth: Option<usize>,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 256,
            per_caller_limit: Some(16),
            max_wait: Duration::from_secs(30),
            max_queue_depth: Some(1024),
        }
    }
}

/// Rate limit settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Whether rate limiting is enforced
    pub enabled: bool,

    /// Sliding window length
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Non-streaming requests per window
    #[validate(range(min = 1))]
    pub completion_limit: u32,

    /// Streaming requests per window
    #[validate(range(min = 1))]
    pub stream_limit: u32,

    /// Shared Redis store; local-only when unset
    pub redis_url: Option<String>,

    /// Longest a Redis round-trip may take before falling back
    #[serde(with = "humantime_serde")]
    pub store_timeout: Duration,

    /// How long to stay on the local store after a Redis failure
    #[serde(with = "humantime_serde")]
    pub primary_retry_after: Duration,

    /// Redis key prefix
    #[validate(length(min = 1))]
    pub key_prefix: String,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(60),
            completion_limit: 60,
            stream_limit: 30,
            redis_url: None,
            store_timeout: Duration::from_millis(50),
            primary_retry_after: Duration::from_secs(30),
            key_prefix: "gateway:ratelimit".to_string(),
        }
    }
}

/// Telemetry settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Log level or `EnvFilter` directive
    #[validate(length(min = 1))]
    pub log_level: String,

    /// Emit JSON logs
    pub json_logs: bool,

    /// Capacity of the audit event channel
    #[validate(range(min = 1))]
    pub audit_buffer: usize,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            audit_buffer: 1024,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u32 {
    100
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(60)
}
