//! Provider traits and the named registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Structured request payload handed to providers.
pub type RequestData = serde_json::Map<String, serde_json::Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Capability Tiers
// ─────────────────────────────────────────────────────────────────────────────

/// A unary compute backend.
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Process a request and return the response text.
    ///
    /// `request` is `None` when the event carried no structured payload.
    async fn execute(&self, request: Option<&RequestData>) -> Result<String>;

    /// Name of this provider.
    fn name(&self) -> &str;
}

/// A streaming compute backend.
///
/// `input` is closed by the pipeline when the client signals end-of-input;
/// the provider signals normal completion by dropping `output`.
#[async_trait]
pub trait StreamingComputeProvider: Send + Sync {
    /// Pump bytes between the client and the backend.
    async fn execute_stream(
        &self,
        attributes: &HashMap<String, String>,
        input: mpsc::Receiver<Vec<u8>>,
        output: mpsc::Sender<Vec<u8>>,
    ) -> Result<()>;

    /// Name of this provider.
    fn name(&self) -> &str;
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Coarse provider classification, taken from the policy `type` field.
///
/// RAG enrichment is attempted only for [`ProviderKind::Llm`] providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// A hosted language-model backend.
    Llm,
    /// A local inference backend.
    Local,
    /// A deterministic mock.
    Mock,
}

/// A named handle to a provider and its optional streaming capability.
#[derive(Clone)]
pub struct ProviderHandle {
    kind: ProviderKind,
    unary: Arc<dyn ComputeProvider>,
    streaming: Option<Arc<dyn StreamingComputeProvider>>,
}

impl ProviderHandle {
    /// Create a unary-only handle.
    pub fn unary(kind: ProviderKind, provider: Arc<dyn ComputeProvider>) -> Self {
        Self {
            kind,
            unary: provider,
            streaming: None,
        }
    }

    /// Add streaming capability to this handle.
    pub fn with_streaming(mut self, streaming: Arc<dyn StreamingComputeProvider>) -> Self {
        self.streaming = Some(streaming);
        self
    }

    /// The provider's classification.
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// True when this provider should receive RAG-enriched requests.
    pub fn is_llm(&self) -> bool {
        self.kind == ProviderKind::Llm
    }

    /// The unary provider.
    pub fn provider(&self) -> &Arc<dyn ComputeProvider> {
        &self.unary
    }

    /// The streaming provider, when this handle supports streaming.
    pub fn streaming(&self) -> Option<&Arc<dyn StreamingComputeProvider>> {
        self.streaming.as_ref()
    }
}

/// Named handles to compute backends.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, ProviderHandle>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under a name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handle: ProviderHandle) {
        self.providers.insert(name.into(), handle);
    }

    /// Look up a handle by name.
    pub fn get(&self, name: &str) -> Option<&ProviderHandle> {
        self.providers.get(name)
    }

    /// Number of registered providers.
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// True when no provider is registered.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Registered provider names.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockProvider, MockStreamProvider};

    #[test]
    fn test_registry_lookup_and_capability() {
        let mut registry = ProviderRegistry::new();
        registry.register(
            "mock-provider",
            ProviderHandle::unary(ProviderKind::Mock, Arc::new(MockProvider::new("mock-provider"))),
        );
        registry.register(
            "mock-stream",
            ProviderHandle::unary(ProviderKind::Mock, Arc::new(MockProvider::new("mock-stream")))
                .with_streaming(Arc::new(MockStreamProvider::new("mock-stream"))),
        );

        let unary = registry.get("mock-provider").unwrap();
        assert!(unary.streaming().is_none());
        assert!(!unary.is_llm());

        let streaming = registry.get("mock-stream").unwrap();
        assert!(streaming.streaming().is_some());

        assert!(registry.get("ghost").is_none());
        assert_eq!(registry.len(), 2);
    }
}
