//! # Gateway Core
//!
//! Core types, traits, and error handling for the Chat Completion Gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - The canonical completion request
//! - The canonical stream event sequence
//! - Provider attempt records
//! - The provider capability trait
//! - Error types and the public error surface
//! - Collaborator interfaces (session store)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod attempt;
pub mod error;
pub mod provider;
pub mod request;
pub mod session;
pub mod streaming;
pub mod types;

// Re-export commonly used types
pub use attempt::{AttemptHistory, AttemptOutcome, ProviderAttempt};
pub use error::{ErrorBody, ErrorCode, GatewayError};
pub use provider::{
    CompletionProvider, ProviderAdapter, ProviderKind, ProviderStream, SseFrame, StreamState,
    WireRequest,
};
pub use request::{ChatMessage, CompletionRequest, CompletionRequestBuilder, MessageRole};
pub use session::{InMemorySessionStore, NoopSessionStore, SessionStore};
pub use streaming::{FinishReason, StreamEvent, Usage};
pub use types::{CallerId, Priority, ProviderId, RequestId};
