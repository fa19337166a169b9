//! Validated domain newtypes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GatewayError;

/// Unique identifier of a single completion request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random request ID
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("req_{}", uuid::Uuid::new_v4().simple()))
    }

    /// Wrap an externally supplied ID (e.g. an `x-request-id` header)
    #[must_use]
    pub fn from_external(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Verified caller identity, supplied by the identity layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallerId(String);

impl CallerId {
    /// Maximum accepted caller ID length
    pub const MAX_LEN: usize = 256;

    /// Create a caller ID
    ///
    /// # Errors
    /// Returns a validation error if the ID is empty, too long, or contains whitespace
    pub fn new(id: impl Into<String>) -> Result<Self, GatewayError> {
        let id = id.into();
        if id.is_empty() {
            return Err(GatewayError::validation(
                "callerId cannot be empty",
                Some("callerId".to_string()),
            ));
        }
        if id.len() > Self::MAX_LEN {
            return Err(GatewayError::validation(
                format!("callerId exceeds {} characters", Self::MAX_LEN),
                Some("callerId".to_string()),
            ));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(GatewayError::validation(
                "callerId cannot contain whitespace",
                Some("callerId".to_string()),
            ));
        }
        Ok(Self(id))
    }

    /// Borrow as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CallerId {
    type Error = GatewayError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CallerId> for String {
    fn from(value: CallerId) -> Self {
        value.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a registered provider (e.g. `"openai"`, `"fastgpt-prod"`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    /// Create a provider ID
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Admission priority; higher values are admitted first
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    /// Lowest priority
    pub const LOW: Self = Self(0);
    /// Default priority for requests that do not specify one
    pub const NORMAL: Self = Self(50);
    /// Highest priority
    pub const HIGH: Self = Self(100);
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
