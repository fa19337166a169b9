//! # Chat Completion Gateway
//!
//! One streaming chat-completion API in front of FastGPT, OpenAI, Anthropic
//! and Dify, with per-provider circuit breakers, retries, ordered fallback,
//! priority admission and sliding-window rate limiting.
//!
//! ## Usage
//!
//! ```bash
//! # Start with default configuration
//! chat-completion-gateway
//!
//! # Start with a config file
//! GATEWAY_CONFIG=/etc/gateway/config.yaml chat-completion-gateway
//!
//! # Start with environment overrides
//! GATEWAY_PORT=9000 GATEWAY_REDIS_URL=redis://localhost:6379 chat-completion-gateway
//! ```

use anyhow::Context;
use gateway_config::load_config;
use gateway_server::{build_gateway, AppState, Collaborators, Server, ServerConfig};
use gateway_telemetry::{init_logging, ChannelAuditSink, LoggingConfig, Metrics};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const AUDIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Application entry point
#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!(error = ?e, "Gateway failed");
        eprintln!("chat-completion-gateway: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = load_config().await.context("loading configuration")?;

    let logging = LoggingConfig::new(config.telemetry.log_level.as_str())
        .with_json(config.telemetry.json_logs);
    init_logging(&logging).context("initializing logging")?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        providers = config.providers.len(),
        "Starting Chat Completion Gateway"
    );

    let metrics = Metrics::new().context("registering metrics")?;
    let (audit, audit_worker) = ChannelAuditSink::spawn(config.telemetry.audit_buffer);
    let audit = audit.with_drop_counter(metrics.audit_dropped());

    let gateway = build_gateway(
        &config,
        Collaborators {
            audit: Arc::new(audit),
            metrics: metrics.clone(),
            sessions: None,
        },
    )
    .await
    .context("building gateway")?;

    if gateway.orchestrator().registry().is_empty() {
        warn!("No providers enabled; /ready will report unavailable");
    }

    let server_config = ServerConfig::from(&config.server);
    let state = AppState::builder()
        .gateway(gateway)
        .config(config)
        .metrics(metrics)
        .build()
        .context("assembling application state")?;

    Server::new(server_config, state)
        .run()
        .await
        .context("serving HTTP")?;

    // the worker exits once every sink clone is dropped
    match tokio::time::timeout(AUDIT_FLUSH_TIMEOUT, audit_worker).await {
        Ok(Err(e)) => warn!(error = %e, "Audit worker ended abnormally"),
        Err(_) => warn!("Audit worker still busy at exit; remaining events dropped"),
        Ok(Ok(())) => {}
    }
    Ok(())
}
