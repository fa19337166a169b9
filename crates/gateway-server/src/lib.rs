//! # Gateway Server
//!
//! HTTP surface and request lifecycle for the Chat Completion Gateway.
//!
//! This crate provides:
//! - The [`Gateway`] façade driving each request from rate limiting to its
//!   terminal event
//! - Axum routes for completions (SSE or aggregated JSON) and operations
//! - Assembly of the gateway from configuration
//! - Graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod error;
pub mod extractors;
pub mod facade;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod state;

#[cfg(test)]
mod testing;

// Re-export main types
pub use bootstrap::{build_gateway, Collaborators};
pub use error::ApiError;
pub use facade::{CompletionHandle, Gateway, GatewayBuilder, GatewayPhase, RequestLifecycle};
pub use routes::create_router;
pub use server::{Server, ServerConfig, ServerError};
pub use shutdown::{drain_in_flight, shutdown_signal, DrainOutcome};
pub use state::AppState;
