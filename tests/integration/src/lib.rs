//! Integration tests for the Chat Completion Gateway
//!
//! Every scenario runs the real adapters, resilience layers and façade
//! against wiremock provider backends:
//! - Provider wire protocols end to end
//! - Fallback, retries and circuit breaking
//! - Rate limiting
//! - Admission ordering and queue timeouts
//! - The HTTP surface

pub mod fixtures;
pub mod helpers;
pub mod mock_providers;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;
pub use mock_providers::*;

#[cfg(test)]
mod admission_tests;
#[cfg(test)]
mod e2e_tests;
#[cfg(test)]
mod fallback_tests;
#[cfg(test)]
mod provider_tests;
#[cfg(test)]
mod rate_limit_tests;
