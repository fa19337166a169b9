//! Provider registry.
//!
//! Process-wide map from provider ID to a running provider, plus the
//! default order used when a request names no preference.

use dashmap::DashMap;
use gateway_core::{CompletionProvider, GatewayError, ProviderId, ProviderKind};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::anthropic::AnthropicAdapter;
use crate::dify::DifyAdapter;
use crate::endpoint::ProviderEndpoint;
use crate::fastgpt::FastGptAdapter;
use crate::http::HttpProvider;
use crate::openai::OpenAIAdapter;

/// A registered provider
#[derive(Clone)]
pub struct ProviderEntry {
    /// The provider
    pub provider: Arc<dyn CompletionProvider>,
    /// Lower values come first in the default order
    pub priority: u32,
    sequence: u64,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("id", self.provider.id())
            .field("kind", &self.provider.kind())
            .field("priority", &self.priority)
            .finish()
    }
}

/// Registry of available providers
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<ProviderId, ProviderEntry>,
    default_order: RwLock<Option<Vec<ProviderId>>>,
    sequence: AtomicU64,
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider
    ///
    /// # Errors
    /// Returns a configuration error if the ID is already registered
    pub fn register(
        &self,
        provider: Arc<dyn CompletionProvider>,
        priority: u32,
    ) -> Result<(), GatewayError> {
        let id = provider.id().clone();
        match self.providers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(GatewayError::configuration(
                format!("provider '{id}' is already registered"),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                info!(provider = %id, kind = %provider.kind(), priority, "Registered provider");
                slot.insert(ProviderEntry {
                    provider,
                    priority,
                    sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
                });
                Ok(())
            }
        }
    }

    /// Remove a provider
    pub fn remove(&self, id: &ProviderId) -> Option<Arc<dyn CompletionProvider>> {
        self.providers.remove(id).map(|(_, entry)| entry.provider)
    }

    /// Look up a provider
    #[must_use]
    pub fn get(&self, id: &ProviderId) -> Option<Arc<dyn CompletionProvider>> {
        self.providers.get(id).map(|entry| Arc::clone(&entry.provider))
    }

    /// Whether a provider is registered
    #[must_use]
    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    /// Pin the default order instead of deriving it from priorities
    pub fn set_default_order(&self, order: Vec<ProviderId>) {
        *self.default_order.write() = (!order.is_empty()).then_some(order);
    }

    /// Order used when a request gives no preference: the pinned order if
    /// set, else ascending priority with ties in registration order
    #[must_use]
    pub fn default_order(&self) -> Vec<ProviderId> {
        if let Some(order) = self.default_order.read().as_ref() {
            return order.clone();
        }

        let mut entries: Vec<(u32, u64, ProviderId)> = self
            .providers
            .iter()
            .map(|e| (e.priority, e.sequence, e.key().clone()))
            .collect();
        entries.sort_unstable_by_key(|(priority, sequence, _)| (*priority, *sequence));
        entries.into_iter().map(|(_, _, id)| id).collect()
    }

    /// All registered IDs, unordered
    #[must_use]
    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Build an HTTP provider for a protocol family
///
/// # Errors
/// Returns error if the HTTP client cannot be created
pub fn build_provider(
    kind: ProviderKind,
    endpoint: ProviderEndpoint,
    timeout: Duration,
) -> Result<Arc<dyn CompletionProvider>, GatewayError> {
    let provider: Arc<dyn CompletionProvider> = match kind {
        ProviderKind::OpenAI => Arc::new(HttpProvider::new(OpenAIAdapter::new(endpoint), timeout)?),
        ProviderKind::Anthropic => {
            Arc::new(HttpProvider::new(AnthropicAdapter::new(endpoint), timeout)?)
        }
        ProviderKind::FastGpt => Arc::new(HttpProvider::new(FastGptAdapter::new(endpoint), timeout)?),
        ProviderKind::Dify => Arc::new(HttpProvider::new(DifyAdapter::new(endpoint), timeout)?),
    };
    Ok(provider)
}
