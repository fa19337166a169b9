//! # Gateway Routing
//!
//! Decides which provider serves a request and shapes what the caller sees:
//! - Ordered fallback across providers, honoring circuit state and retries
//! - Stream normalization with exactly one terminal event

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fallback;
pub mod multiplexer;

// Re-export main types
pub use fallback::{FallbackOrchestrator, OrchestratedStream};
pub use multiplexer::{DeliveryMode, StreamMultiplexer};
