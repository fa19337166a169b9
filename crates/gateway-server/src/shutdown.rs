//! Graceful shutdown handling for the gateway.

use gateway_resilience::AdmissionController;
use std::time::Duration;
use tokio::signal;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DRAIN_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// How draining ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every admission slot was returned
    Drained,
    /// The deadline passed with slots still held
    TimedOut {
        /// Requests still in flight
        remaining: usize,
    },
}

/// Shutdown signal handler with multiple signal support
///
/// # Panics
/// Panics if signal handlers cannot be installed
#[allow(clippy::expect_used)]
pub async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        "ctrl+c"
    };

    #[cfg(unix)]
    let sigterm = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
        "sigterm"
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<&'static str>();

    let signal_name = tokio::select! {
        name = ctrl_c => name,
        name = sigterm => name,
    };

    info!(signal = signal_name, "Received shutdown signal");
    signal_name
}

/// Wait until no admission slot is held, or `timeout` passes
pub async fn drain_in_flight(admission: &AdmissionController, timeout: Duration) -> DrainOutcome {
    let deadline = Instant::now() + timeout;
    let mut last_logged = Instant::now();

    loop {
        let remaining = admission.stats().in_flight;
        if remaining == 0 {
            info!("All in-flight requests completed");
            return DrainOutcome::Drained;
        }
        if Instant::now() >= deadline {
            warn!(remaining, "Drain timeout exceeded");
            return DrainOutcome::TimedOut { remaining };
        }
        if last_logged.elapsed() >= DRAIN_PROGRESS_INTERVAL {
            info!(remaining, "Waiting for in-flight requests");
            last_logged = Instant::now();
        }
        sleep(DRAIN_POLL_INTERVAL).await;
    }
}
