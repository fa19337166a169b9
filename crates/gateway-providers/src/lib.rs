//! # Gateway Providers
//!
//! Provider protocol adapters for the Chat Completion Gateway.
//!
//! Each backend protocol has a flat [`gateway_core::ProviderAdapter`]
//! implementation:
//! - OpenAI chat completions
//! - Anthropic messages
//! - FastGPT (OpenAI-compatible, with workflow events)
//! - Dify chat-messages
//!
//! [`HttpProvider`] runs any adapter over HTTP and [`ProviderRegistry`] makes
//! the running providers available by ID.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod anthropic;
pub mod dify;
pub mod endpoint;
pub mod fastgpt;
pub mod http;
pub mod openai;
pub mod registry;

// Re-export main types
pub use anthropic::AnthropicAdapter;
pub use dify::DifyAdapter;
pub use endpoint::ProviderEndpoint;
pub use fastgpt::FastGptAdapter;
pub use http::HttpProvider;
pub use openai::OpenAIAdapter;
pub use registry::{build_provider, ProviderEntry, ProviderRegistry};
