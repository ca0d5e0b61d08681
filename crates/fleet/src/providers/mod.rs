//! Clients for the server providers whose inventory is mirrored locally.

pub mod hetzner;
pub mod hetzner_cloud;
mod traits;

use std::collections::HashMap;
use std::sync::Arc;

use crate::model::ProviderKind;

pub use traits::{Provider, ProviderError};

/// Providers keyed by the kind of server they manage.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own kind.
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    /// Provider for a server kind.
    #[must_use]
    pub fn get(&self, kind: ProviderKind) -> Option<&Arc<dyn Provider>> {
        self.providers.get(&kind)
    }

    /// All registered providers, dedicated first.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        let mut providers: Vec<_> = self.providers.values().cloned().collect();
        providers.sort_by_key(|p| std::cmp::Reverse(p.kind().as_str()));
        providers
    }

    /// Whether no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}
