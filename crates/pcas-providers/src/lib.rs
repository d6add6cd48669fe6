//! Provider backends for the PCAS event bus.
//!
//! Providers come in two capability tiers: every provider implements
//! [`ComputeProvider`] (unary execute), and streaming-capable ones also
//! implement [`StreamingComputeProvider`]. The [`ProviderRegistry`] holds
//! named handles and performs the runtime capability check during stream
//! negotiation.
//!
//! Embedding backends are a separate concern behind the [`Embedder`] trait.

pub mod embedding;
pub mod error;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod provider;

pub use embedding::{Embedder, MockEmbedder, SharedEmbedder};
pub use error::{ProviderError, Result};
pub use mock::{MockProvider, MockStreamProvider};
pub use ollama::OllamaProvider;
pub use openai::{OpenAiConfig, OpenAiEmbedder, OpenAiEmbedderConfig, OpenAiProvider};
pub use provider::{
    ComputeProvider, ProviderHandle, ProviderKind, ProviderRegistry, RequestData,
    StreamingComputeProvider,
};
