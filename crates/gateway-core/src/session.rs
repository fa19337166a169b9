//! Session store collaborator.
//!
//! Conversation history is owned by an external service. The gateway only
//! appends the prompt and the reply after a completed request.

use crate::error::GatewayError;
use crate::request::MessageRole;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// External conversation history store
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append one message to a session
    async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), GatewayError>;
}

/// Store that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSessionStore;

#[async_trait]
impl SessionStore for NoopSessionStore {
    async fn append_message(
        &self,
        _session_id: &str,
        _role: MessageRole,
        _content: &str,
    ) -> Result<(), GatewayError> {
        Ok(())
    }
}

/// In-process store, used in tests and single-node development
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<(MessageRole, String)>>>,
}

impl InMemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages recorded for a session
    #[must_use]
    pub fn messages(&self, session_id: &str) -> Vec<(MessageRole, String)> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<(), GatewayError> {
        self.sessions
            .write()
            .entry(session_id.to_string())
            .or_default()
            .push((role, content.to_string()));
        Ok(())
    }
}
