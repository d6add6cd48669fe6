//! The event bus: publish pipeline, search, and shutdown sequencing.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use pcas_policy::Engine;
use pcas_providers::{ProviderRegistry, RequestData, SharedEmbedder};
use pcas_storage::{EventFilter, EventStore};
use pcas_types::{BusError, Event, EventData, Result, is_fact_event, new_event_id, now};

use crate::interact::{InteractProxy, InteractRequest, InteractResponse};
use crate::rag::{RAG_TIMEOUT, RagEnricher};
use crate::subscribers::{SubscriberTable, Subscription};
use crate::vectorize::Vectorizer;

/// Type of the synthesised response events.
pub const RESPONSE_EVENT_TYPE: &str = "pcas.response.v1";

/// Default search result count when the request leaves top-k unset.
const DEFAULT_SEARCH_TOP_K: usize = 5;

/// Bus construction options.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Logical identity stamped as the source of response events.
    pub server_source: String,
    /// Whether RAG enrichment is attempted for LLM providers.
    pub rag_enabled: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            server_source: "pcas-server".to_string(),
            rag_enabled: false,
        }
    }
}

impl BusConfig {
    /// Read the RAG toggle from `PCAS_RAG_ENABLED`.
    pub fn from_env() -> Self {
        Self {
            rag_enabled: std::env::var("PCAS_RAG_ENABLED").as_deref() == Ok("true"),
            ..Self::default()
        }
    }

    /// Override the RAG toggle.
    pub fn with_rag_enabled(mut self, enabled: bool) -> Self {
        self.rag_enabled = enabled;
        self
    }
}

/// The request/response event bus.
///
/// Owns the fan-out table and the background-vectorisation tracker; shares
/// storage, policy, and the provider registry with the transports.
pub struct EventBus {
    storage: Arc<EventStore>,
    policy: Arc<Engine>,
    registry: Arc<ProviderRegistry>,
    embedder: Option<SharedEmbedder>,
    subscribers: Arc<SubscriberTable>,
    enricher: Option<Arc<RagEnricher>>,
    vectorizer: Option<Vectorizer>,
    config: BusConfig,
}

impl EventBus {
    /// Assemble the bus.
    ///
    /// Without an embedding backend, search fails with a precondition error
    /// and RAG and background vectorisation are disabled.
    pub fn new(
        storage: Arc<EventStore>,
        policy: Arc<Engine>,
        registry: Arc<ProviderRegistry>,
        embedder: Option<SharedEmbedder>,
        config: BusConfig,
    ) -> Self {
        let enricher = embedder
            .as_ref()
            .map(|e| Arc::new(RagEnricher::new(Arc::clone(&storage), Arc::clone(e))));
        let vectorizer = embedder
            .as_ref()
            .map(|e| Vectorizer::new(Arc::clone(&storage), Arc::clone(e)));

        Self {
            storage,
            policy,
            registry,
            embedder,
            subscribers: Arc::new(SubscriberTable::new()),
            enricher,
            vectorizer,
            config,
        }
    }

    /// The underlying event store.
    pub fn storage(&self) -> &Arc<EventStore> {
        &self.storage
    }

    /// The subscriber table (used by transports for health/stats).
    pub fn subscribers(&self) -> &Arc<SubscriberTable> {
        &self.subscribers
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publish
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one event through the pipeline.
    ///
    /// Returns the synthesised response event, or `None` when no rule routes
    /// the event (which is an acknowledged drop, not an error). Storage
    /// write failures are logged and do not short-circuit; provider
    /// execution failures do.
    pub async fn publish(&self, event: Event) -> Result<Option<Event>> {
        // 1. Persist the incoming event. The pipeline continues even when
        //    the write fails, so a provider may still respond.
        if let Err(err) = self.storage.store_event(&event, None) {
            warn!(event_id = %event.id, error = %err, "Failed to store incoming event");
        }

        // 2. Fact events are embedded in the background. Response events
        //    never reach this point with a whitelisted type.
        if let Some(ref vectorizer) = self.vectorizer {
            if is_fact_event(&event.event_type) {
                debug!(event_id = %event.id, event_type = %event.event_type,
                    "Scheduling vectorisation for fact event");
                vectorizer.spawn(event.clone());
            }
        }

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            source = %event.source,
            "Event received"
        );

        // 3. Extract the structured payload; raw and empty payloads reach
        //    the provider as no request data.
        let mut request_data: Option<RequestData> = event.data.as_structured().cloned();

        // 4. Route. No matching rule acknowledges and drops.
        let Some(route) = self.policy.select_provider(&event) else {
            info!(event_type = %event.event_type, "No provider configured, dropping event");
            return Ok(None);
        };
        debug!(provider = %route.provider, "Provider selected");

        let handle = self
            .registry
            .get(&route.provider)
            .ok_or_else(|| BusError::Internal(format!("provider not found: {}", route.provider)))?;

        // 5. RAG enrichment, only for LLM-class providers and recovered on
        //    any failure, including panics inside the enrichment task.
        if handle.is_llm() && self.config.rag_enabled {
            if let Some(ref enricher) = self.enricher {
                request_data = Some(
                    self.enrich_recovered(Arc::clone(enricher), &event, request_data)
                        .await,
                );
            }
        }

        // 6. Execute. Errors propagate to the caller and no response event
        //    is synthesised.
        let response_text = handle
            .provider()
            .execute(request_data.as_ref())
            .await
            .map_err(BusError::from)?;
        debug!(provider = %route.provider, "Provider responded");

        // 7. Synthesise the correlated response.
        let mut response = Event {
            id: new_event_id(),
            event_type: RESPONSE_EVENT_TYPE.to_string(),
            source: self.config.server_source.clone(),
            subject: Some(format!("response-to-{}", event.id)),
            specversion: "1.0".to_string(),
            time: Some(now()),
            data: EventData::Empty,
            trace_id: event.trace_id.clone(),
            correlation_id: Some(event.id.clone()),
            user_id: None,
            session_id: None,
        };
        response.data = EventData::structured(json!({
            "original_event_id": event.id,
            "provider": route.provider,
            "response": response_text,
        }));

        // 8. Persist and fan out. Response events are not vectorised; the
        //    vector space holds user intent only.
        if let Err(err) = self.storage.store_event(&response, None) {
            warn!(event_id = %response.id, error = %err, "Failed to store response event");
        }
        self.subscribers.broadcast(&response);

        Ok(Some(response))
    }

    /// Run enrichment inside its own task with the RAG deadline, so
    /// panics and timeouts degrade to the unenriched request.
    async fn enrich_recovered(
        &self,
        enricher: Arc<RagEnricher>,
        event: &Event,
        request_data: Option<RequestData>,
    ) -> RequestData {
        let fallback = request_data.clone().unwrap_or_default();
        let mut map = request_data.unwrap_or_default();
        let event = event.clone();

        let task = tokio::spawn(async move {
            let timed_out = tokio::time::timeout(RAG_TIMEOUT, enricher.enrich(&event, &mut map))
                .await
                .is_err();
            if timed_out {
                warn!(event_id = %event.id, "Enrichment deadline exceeded");
            }
            map
        });

        match task.await {
            Ok(map) => map,
            Err(err) => {
                warn!(error = %err, "Enrichment task failed, continuing unenriched");
                fallback
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscribe
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a subscriber; see [`SubscriberTable::subscribe`].
    pub fn subscribe(&self, client_id: &str) -> Result<Subscription> {
        self.subscribers.subscribe(client_id)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Search
    // ─────────────────────────────────────────────────────────────────────────

    /// Semantic search over stored events.
    ///
    /// Returns events with their scores as parallel arrays, preserving
    /// recall order.
    pub async fn search(
        &self,
        query_text: &str,
        top_k: i64,
        user_id: Option<&str>,
    ) -> Result<(Vec<Event>, Vec<f32>)> {
        if query_text.is_empty() {
            return Err(BusError::InvalidArgument(
                "query_text cannot be empty".to_string(),
            ));
        }
        let top_k = if top_k <= 0 {
            DEFAULT_SEARCH_TOP_K
        } else {
            top_k as usize
        };

        let Some(ref embedder) = self.embedder else {
            return Err(BusError::FailedPrecondition(
                "vector search requires an embedding backend".to_string(),
            ));
        };

        debug!(query = %query_text, top_k, "Search starting");
        let embedding = embedder.embed(query_text).await.map_err(BusError::from)?;

        let filter = user_id.map(|id| EventFilter::new().with_user_id(id));
        let results = self
            .storage
            .query_similar(&embedding, top_k, filter.as_ref())
            .map_err(BusError::from)?;

        let mut events = Vec::with_capacity(results.len());
        let mut scores = Vec::with_capacity(results.len());
        for result in results {
            match self.storage.get_event_by_id(&result.id) {
                Ok(event) => {
                    events.push(event);
                    scores.push(result.score);
                }
                Err(err) => {
                    warn!(event_id = %result.id, error = %err, "Failed to hydrate search result");
                }
            }
        }

        info!(matches = events.len(), "Search completed");
        Ok((events, scores))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Interact
    // ─────────────────────────────────────────────────────────────────────────

    /// Drive a bidirectional interactive session; see [`InteractProxy::run`].
    pub async fn interact(
        &self,
        requests: mpsc::Receiver<InteractRequest>,
        responses: mpsc::Sender<InteractResponse>,
    ) -> Result<()> {
        InteractProxy::new(Arc::clone(&self.policy), Arc::clone(&self.registry))
            .run(requests, responses)
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Shutdown
    // ─────────────────────────────────────────────────────────────────────────

    /// Drain background work and close storage.
    ///
    /// Order matters: in-flight vectorisation tasks finish first so their
    /// writes are captured by the ANN sidecar save inside `close`.
    pub async fn shutdown(&self) {
        if let Some(ref vectorizer) = self.vectorizer {
            let pending = vectorizer.pending();
            if pending > 0 {
                info!(pending, "Waiting for background vectorisation");
            }
            vectorizer.wait().await;
        }
        if let Err(err) = self.storage.close() {
            warn!(error = %err, "Failed to close storage cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pcas_policy::Policy;
    use pcas_providers::{
        ComputeProvider, MockEmbedder, MockProvider, ProviderHandle, ProviderKind,
    };
    use pcas_types::ErrorCode;
    use serde_json::json;

    const POLICY: &str = r#"
providers:
  - name: mock-provider
    type: mock
rules:
  - name: echo
    if:
      event_type: pcas.echo.v1
    then:
      provider: mock-provider
"#;

    fn test_bus(embedder: Option<SharedEmbedder>) -> EventBus {
        let storage = Arc::new(EventStore::open_in_memory().unwrap());
        let policy = Arc::new(Engine::new(Policy::from_yaml(POLICY).unwrap()));
        let mut registry = ProviderRegistry::new();
        registry.register(
            "mock-provider",
            ProviderHandle::unary(
                ProviderKind::Mock,
                Arc::new(MockProvider::new("mock-provider")),
            ),
        );
        EventBus::new(
            storage,
            policy,
            Arc::new(registry),
            embedder,
            BusConfig::default(),
        )
    }

    fn echo_event(id: &str) -> Event {
        let mut event = Event::new("pcas.echo.v1", "test-client")
            .with_subject("test-echo")
            .with_trace_id("trace-1")
            .with_data(EventData::structured(json!({"message": "Hello"})));
        event.id = id.to_string();
        event
    }

    #[tokio::test]
    async fn test_publish_synthesises_correlated_response() {
        let bus = test_bus(None);
        let response = bus.publish(echo_event("e1")).await.unwrap().unwrap();

        assert_eq!(response.event_type, RESPONSE_EVENT_TYPE);
        assert_eq!(response.correlation_id.as_deref(), Some("e1"));
        assert_eq!(response.trace_id.as_deref(), Some("trace-1"));
        assert_eq!(response.subject.as_deref(), Some("response-to-e1"));
        assert_eq!(response.source, "pcas-server");

        let data = response.data.as_structured().unwrap();
        assert_eq!(data["original_event_id"], "e1");
        assert_eq!(data["provider"], "mock-provider");
        assert_eq!(data["response"], "Mock response from mock-provider");

        // Both the request and the response are persisted.
        assert!(bus.storage().get_event_by_id("e1").is_ok());
        let stored = bus.storage().get_event_by_id(&response.id).unwrap();
        assert_eq!(stored, response);
    }

    #[tokio::test]
    async fn test_publish_without_rule_is_acknowledged_drop() {
        let bus = test_bus(None);
        let event = Event::new("x.unrouted.v1", "test-client");
        let id = event.id.clone();

        let response = bus.publish(event).await.unwrap();
        assert!(response.is_none());
        // The event is still persisted.
        assert!(bus.storage().get_event_by_id(&id).is_ok());
    }

    #[tokio::test]
    async fn test_provider_failure_synthesises_no_response() {
        struct FailingProvider;
        #[async_trait::async_trait]
        impl ComputeProvider for FailingProvider {
            async fn execute(
                &self,
                _request: Option<&RequestData>,
            ) -> pcas_providers::Result<String> {
                Err(pcas_providers::ProviderError::Unavailable(
                    "backend down".to_string(),
                ))
            }
            fn name(&self) -> &str {
                "failing"
            }
        }

        let storage = Arc::new(EventStore::open_in_memory().unwrap());
        let policy = Arc::new(Engine::new(Policy::from_yaml(POLICY).unwrap()));
        let mut registry = ProviderRegistry::new();
        registry.register(
            "mock-provider",
            ProviderHandle::unary(ProviderKind::Mock, Arc::new(FailingProvider)),
        );
        let bus = EventBus::new(
            Arc::clone(&storage),
            policy,
            Arc::new(registry),
            None,
            BusConfig::default(),
        );

        let err = bus.publish(echo_event("e1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);

        // Exactly one event persisted: the request, no response.
        let all = storage.get_all_events(0, 10).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "e1");
    }

    #[tokio::test]
    async fn test_response_broadcast_to_subscribers() {
        let bus = test_bus(None);
        let mut sub = bus.subscribe("client-a").unwrap();

        let response = bus.publish(echo_event("e1")).await.unwrap().unwrap();
        let received = sub.recv().await.unwrap();
        assert_eq!(received.id, response.id);
        assert_eq!(received.correlation_id.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn test_fact_event_vectorised_in_background() {
        let bus = test_bus(Some(Arc::new(MockEmbedder::new(8))));

        let mut event = Event::new("user.memory.v1", "test").with_subject("my dog is named Rex");
        event.id = "fact-1".to_string();
        bus.publish(event).await.unwrap();

        bus.shutdown().await;
        assert!(bus.storage().has_embedding("fact-1").unwrap());
    }

    #[tokio::test]
    async fn test_response_events_not_vectorised() {
        let bus = test_bus(Some(Arc::new(MockEmbedder::new(8))));
        bus.publish(echo_event("e1")).await.unwrap();
        bus.shutdown().await;

        // Neither the echo request (not whitelisted) nor the response got a
        // vector.
        assert_eq!(bus.storage().vector_count(), 0);
    }

    #[tokio::test]
    async fn test_search_requires_embedder() {
        let bus = test_bus(None);
        let err = bus.search("anything", 5, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn test_search_rejects_empty_query() {
        let bus = test_bus(Some(Arc::new(MockEmbedder::new(8))));
        let err = bus.search("", 5, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_search_identity_roundtrip() {
        let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(8));
        let bus = test_bus(Some(Arc::clone(&embedder)));

        let mut fact = Event::new("user.memory.v1", "test").with_subject("my dog is named Rex");
        fact.id = "fact-1".to_string();
        let vector = embedder.embed("my dog is named Rex").await.unwrap();
        bus.storage().store_event(&fact, Some(&vector)).unwrap();

        let (events, scores) = bus.search("my dog is named Rex", 1, None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "fact-1");
        assert!(scores[0] >= 0.99);
    }

    #[tokio::test]
    async fn test_search_defaults_top_k() {
        let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(8));
        let bus = test_bus(Some(Arc::clone(&embedder)));

        for i in 0..8 {
            let mut event = Event::new("user.memory.v1", "test");
            event.id = format!("e{i}");
            let vector = embedder.embed(&format!("memory {i}")).await.unwrap();
            bus.storage().store_event(&event, Some(&vector)).unwrap();
        }

        let (events, _) = bus.search("memory 3", 0, None).await.unwrap();
        assert_eq!(events.len(), DEFAULT_SEARCH_TOP_K);
    }
}
