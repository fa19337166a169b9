//! Shared application state.

use gateway_config::GatewayConfig;
use gateway_telemetry::Metrics;
use std::sync::Arc;
use std::time::Instant;

use crate::facade::Gateway;

/// State shared by every handler
#[derive(Clone, Debug)]
pub struct AppState {
    /// Request lifecycle façade
    pub gateway: Gateway,
    /// Loaded configuration
    pub config: Arc<GatewayConfig>,
    /// Metrics rendered by `/metrics`
    pub metrics: Option<Metrics>,
    /// Process start, for uptime
    pub started_at: Instant,
}

impl AppState {
    /// Create a builder
    #[must_use]
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::default()
    }

    /// Seconds since start
    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Builder for [`AppState`]
#[derive(Default)]
pub struct AppStateBuilder {
    gateway: Option<Gateway>,
    config: Option<GatewayConfig>,
    metrics: Option<Metrics>,
}

impl AppStateBuilder {
    /// Gateway (required)
    #[must_use]
    pub fn gateway(mut self, gateway: Gateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Configuration; defaults when unset
    #[must_use]
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Metrics exposed on `/metrics`
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the state; `None` without a gateway
    #[must_use]
    pub fn build(self) -> Option<AppState> {
        let gateway = self.gateway?;
        let metrics = self.metrics.or_else(|| gateway.metrics().cloned());
        Some(AppState {
            gateway,
            config: Arc::new(self.config.unwrap_or_default()),
            metrics,
            started_at: Instant::now(),
        })
    }
}
