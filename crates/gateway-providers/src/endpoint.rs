//! Connection details shared by all adapters.

use gateway_core::ProviderId;
use secrecy::{ExposeSecret, SecretString};

/// Where and how to reach one provider instance
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    /// Provider instance ID
    pub id: ProviderId,
    /// Base URL, without a trailing slash
    pub base_url: String,
    /// API key
    pub api_key: Option<SecretString>,
    /// Model name, where the protocol needs one
    pub model: Option<String>,
}

impl ProviderEndpoint {
    /// Create an endpoint
    #[must_use]
    pub fn new(id: impl Into<ProviderId>, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: None,
            model: None,
        }
    }

    /// Set the API key
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(SecretString::new(key.into()));
        self
    }

    /// Set an already-wrapped API key
    #[must_use]
    pub fn with_secret(mut self, key: Option<SecretString>) -> Self {
        self.api_key = key;
        self
    }

    /// Set the model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Join a path onto the base URL
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `Authorization: Bearer …` header, if a key is set
    #[must_use]
    pub fn bearer_header(&self) -> Option<(String, String)> {
        self.api_key.as_ref().map(|key| {
            (
                "Authorization".to_string(),
                format!("Bearer {}", key.expose_secret()),
            )
        })
    }
}
