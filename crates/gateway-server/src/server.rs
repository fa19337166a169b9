//! HTTP server lifecycle.

use gateway_config::ServerSettings;
use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::routes::create_router;
use crate::shutdown::{drain_in_flight, shutdown_signal};
use crate::state::AppState;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listen address could not be parsed
    #[error("invalid listen address '{0}'")]
    Address(String),
    /// Socket failure
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listener settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Longest to wait for open requests after a shutdown signal
    pub shutdown_timeout: Duration,
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            shutdown_timeout: settings.shutdown_timeout,
        }
    }
}

impl ServerConfig {
    /// Socket address to bind
    ///
    /// # Errors
    /// Returns error if host and port do not form an address
    pub fn socket_addr(&self) -> Result<SocketAddr, ServerError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|_| ServerError::Address(format!("{}:{}", self.host, self.port)))
    }
}

/// Gateway HTTP server
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    state: AppState,
}

impl Server {
    /// Create a server
    #[must_use]
    pub fn new(config: ServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    /// Bind and serve until Ctrl-C or SIGTERM
    ///
    /// # Errors
    /// Returns error if the socket cannot be bound or serving fails
    pub async fn run(self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr).await?;
        info!(address = %addr, "Gateway listening");
        self.serve(listener, async {
            shutdown_signal().await;
        })
        .await
    }

    /// Serve on an already-bound listener until `signal` resolves, then stop
    /// accepting and give open requests up to the shutdown timeout.
    ///
    /// # Errors
    /// Returns error if serving fails
    pub async fn serve<F>(self, listener: TcpListener, signal: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let admission = self.state.gateway.admission().clone();
        let shutdown_timeout = self.config.shutdown_timeout;
        let (trigger, mut triggered) = watch::channel(false);

        let app = create_router(self.state);
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                // sender dropped means we are already on the way out
                let _ = triggered.wait_for(|fired| *fired).await;
            })
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => return result.map_err(ServerError::Io),
            () = signal => {}
        }

        info!(timeout = ?shutdown_timeout, "Shutting down; no longer accepting connections");
        trigger.send_replace(true);

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(shutdown_timeout, &mut server).await {
            Ok(result) => result?,
            Err(_) => warn!(
                in_flight = admission.stats().in_flight,
                "Shutdown timeout elapsed; closing remaining connections"
            ),
        }

        let remaining = shutdown_timeout.saturating_sub(started.elapsed());
        drain_in_flight(&admission, remaining).await;
        info!("Gateway stopped");
        Ok(())
    }
}
