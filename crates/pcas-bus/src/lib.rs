//! The PCAS event-processing pipeline.
//!
//! [`EventBus`] ties the core together: it persists published events, routes
//! them through the policy engine to a compute provider, optionally enriches
//! LLM-bound requests with similar past events (RAG), synthesises a
//! correlated response, and fans it out to subscribers. The bidirectional
//! interact proxy negotiates a streaming session and pumps bytes between the
//! client and a streaming provider with bounded back-pressure.

pub mod bus;
pub mod interact;
pub mod rag;
pub mod singleflight;
pub mod subscribers;
pub mod vectorize;

pub use bus::{BusConfig, EventBus, RESPONSE_EVENT_TYPE};
pub use interact::{
    InteractProxy, InteractRequest, InteractResponse, STREAM_CHANNEL_CAPACITY,
};
pub use rag::{EmbeddingCache, RagEnricher, RAG_TIMEOUT, RAG_TOP_K, SCORE_THRESHOLD};
pub use singleflight::SingleFlight;
pub use subscribers::{SUBSCRIBER_QUEUE_CAPACITY, SubscriberTable, Subscription};
pub use vectorize::{Vectorizer, extract_text_content};
