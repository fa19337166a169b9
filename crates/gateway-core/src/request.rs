//! Request types for the gateway.
//!
//! This module defines the canonical completion request that every provider
//! adapter translates from. A request is immutable once admitted and is shared
//! between the façade, orchestrator and adapters as `Arc<CompletionRequest>`.

use crate::error::GatewayError;
use crate::types::{CallerId, Priority, ProviderId, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Unique request identifier
    pub request_id: RequestId,

    /// Verified caller identity
    pub caller_id: CallerId,

    /// Ordered provider preference; empty means "use the default order"
    #[serde(default)]
    pub provider_preference: Vec<ProviderId>,

    /// Conversation messages, oldest first
    pub messages: Vec<ChatMessage>,

    /// Whether the caller wants incremental deltas
    #[serde(default)]
    pub streaming: bool,

    /// Admission priority
    #[serde(default)]
    pub priority: Priority,

    /// Conversation session, if the caller wants history persisted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// When the gateway received the request
    pub created_at: DateTime<Utc>,
}

impl CompletionRequest {
    /// Create a new builder for `CompletionRequest`
    #[must_use]
    pub fn builder() -> CompletionRequestBuilder {
        CompletionRequestBuilder::default()
    }

    /// Validate the request
    ///
    /// # Errors
    /// Returns error if the message list is empty or a message has no content
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::validation(
                "messages cannot be empty",
                Some("messages".to_string()),
            ));
        }

        for (index, message) in self.messages.iter().enumerate() {
            if message.content.trim().is_empty() {
                return Err(GatewayError::validation(
                    format!("message {index} has empty content"),
                    Some(format!("messages[{index}].content")),
                ));
            }
        }

        Ok(())
    }

    /// Content of the most recent user message
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
    }

    /// Concatenated system messages, if any
    #[must_use]
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }
}

/// Builder for `CompletionRequest`
#[derive(Debug, Default)]
pub struct CompletionRequestBuilder {
    request_id: Option<RequestId>,
    caller_id: Option<CallerId>,
    provider_preference: Vec<ProviderId>,
    messages: Vec<ChatMessage>,
    streaming: bool,
    priority: Priority,
    session_id: Option<String>,
}

impl CompletionRequestBuilder {
    /// Set the request ID
    #[must_use]
    pub fn request_id(mut self, id: RequestId) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Set the caller identity
    #[must_use]
    pub fn caller(mut self, caller_id: CallerId) -> Self {
        self.caller_id = Some(caller_id);
        self
    }

    /// Append a provider to the preference list
    #[must_use]
    pub fn prefer(mut self, provider: impl Into<ProviderId>) -> Self {
        self.provider_preference.push(provider.into());
        self
    }

    /// Replace the provider preference list
    #[must_use]
    pub fn provider_preference(mut self, providers: Vec<ProviderId>) -> Self {
        self.provider_preference = providers;
        self
    }

    /// Add a message
    #[must_use]
    pub fn message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Set all messages
    #[must_use]
    pub fn messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    /// Enable or disable streaming
    #[must_use]
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// Set the admission priority
    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a session ID
    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Build the request
    ///
    /// # Errors
    /// Returns error if the caller is missing or the request fails validation
    pub fn build(self) -> Result<CompletionRequest, GatewayError> {
        let caller_id = self.caller_id.ok_or_else(|| {
            GatewayError::validation("callerId is required", Some("callerId".to_string()))
        })?;

        let request = CompletionRequest {
            request_id: self.request_id.unwrap_or_else(RequestId::generate),
            caller_id,
            provider_preference: self.provider_preference,
            messages: self.messages,
            streaming: self.streaming,
            priority: self.priority,
            session_id: self.session_id,
            created_at: Utc::now(),
        };

        request.validate()?;

        Ok(request)
    }
}

/// Chat message with role and content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Role of the message author
    pub role: MessageRole,

    /// Text content of the message
    pub content: String,
}

impl ChatMessage {
    /// Create a system message
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// System message
    System,
    /// User message
    User,
    /// Assistant message
    Assistant,
}

impl MessageRole {
    /// Wire name of the role
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
