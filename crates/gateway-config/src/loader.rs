//! Configuration loading.
//!
//! Order of precedence: built-in defaults, then the file named by
//! `GATEWAY_CONFIG`, then `GATEWAY_*` environment overrides. API keys given
//! as `api_key_env` are resolved last, then the result is validated.

use secrecy::SecretString;
use std::env;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::{ConfigError, GatewayConfig};

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "GATEWAY_CONFIG";

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML
    Yaml,
    /// TOML
    Toml,
    /// JSON
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    ///
    /// # Errors
    /// Returns an error for unknown extensions
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            Some("json") => Ok(Self::Json),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

/// Load configuration from the environment
///
/// # Errors
/// Returns an error if the file cannot be read or parsed, an override is
/// malformed, or validation fails
pub async fn load_config() -> Result<GatewayConfig, ConfigError> {
    let mut config = match env::var(CONFIG_PATH_ENV) {
        Ok(path) => load_from_file(&path).await?,
        Err(_) => {
            debug!("{CONFIG_PATH_ENV} not set, using built-in defaults");
            GatewayConfig::default()
        }
    };

    apply_env_overrides(&mut config, |key| env::var(key).ok())?;
    resolve_api_keys(&mut config, |key| env::var(key).ok());
    config.check()?;

    Ok(config)
}

/// Read and parse a config file without overrides or validation
///
/// # Errors
/// Returns an error if the file cannot be read or parsed
pub async fn load_from_file(path: impl AsRef<Path>) -> Result<GatewayConfig, ConfigError> {
    let path = path.as_ref();
    let format = ConfigFormat::from_path(path)?;
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

    let config = parse_str(&contents, format)?;
    info!(path = %path.display(), providers = config.providers.len(), "Loaded configuration file");
    Ok(config)
}

/// Parse configuration text
///
/// # Errors
/// Returns a parse error if the text is malformed
pub fn parse_str(contents: &str, format: ConfigFormat) -> Result<GatewayConfig, ConfigError> {
    match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        ConfigFormat::Toml => toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string())),
        ConfigFormat::Json => {
            serde_json::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }
}

/// Apply `GATEWAY_*` overrides using the given lookup
///
/// # Errors
/// Returns an error if an override value cannot be parsed
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("GATEWAY_HOST") {
        config.server.host = host;
    }
    if let Some(port) = lookup("GATEWAY_PORT") {
        config.server.port = parse_override("GATEWAY_PORT", &port)?;
    }
    if let Some(url) = lookup("GATEWAY_REDIS_URL") {
        config.rate_limit.redis_url = Some(url).filter(|u| !u.is_empty());
    }
    if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
        config.telemetry.log_level = level;
    }
    if let Some(max) = lookup("GATEWAY_MAX_CONCURRENT") {
        config.admission.max_concurrent = parse_override("GATEWAY_MAX_CONCURRENT", &max)?;
    }
    Ok(())
}

/// Fill `api_key` from `api_key_env` where no inline key is set
pub fn resolve_api_keys<F>(config: &mut GatewayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for provider in &mut config.providers {
        if provider.api_key.is_some() {
            continue;
        }
        let Some(var) = provider.api_key_env.as_deref() else {
            continue;
        };
        match lookup(var) {
            Some(key) if !key.is_empty() => provider.api_key = Some(SecretString::new(key)),
            _ => warn!(provider = %provider.id, env = %var, "API key environment variable not set"),
        }
    }
}

fn parse_override<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidOverride {
        var: var.to_string(),
        value: value.to_string(),
    })
}
