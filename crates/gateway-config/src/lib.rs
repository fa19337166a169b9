//! # Gateway Config
//!
//! Configuration loading and validation for the Chat Completion Gateway.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod loader;
pub mod settings;

pub use loader::{apply_env_overrides, load_config, load_from_file, parse_str, ConfigFormat};
pub use settings::{
    AdmissionSettings, CircuitBreakerSettings, GatewayConfig, ProviderSettings,
    RateLimitSettings, RetrySettings, ServerSettings, TelemetrySettings,
};

use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Config text could not be parsed
    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    /// Unknown file extension
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),

    /// Environment override could not be parsed
    #[error("Invalid value '{value}' for {var}")]
    InvalidOverride {
        /// Variable name
        var: String,
        /// Offending value
        value: String,
    },

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    Validation(String),
}
