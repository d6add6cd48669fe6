//! End-to-end pipeline scenarios against an assembled bus.

use std::sync::{Arc, Mutex};

use serde_json::json;

use pcas_bus::{BusConfig, EventBus};
use pcas_policy::{Engine, Policy};
use pcas_providers::{
    ComputeProvider, MockEmbedder, MockProvider, ProviderHandle, ProviderKind, RequestData,
    SharedEmbedder,
};
use pcas_storage::EventStore;
use pcas_types::{Event, EventData};

const POLICY: &str = r#"
providers:
  - name: mock-provider
    type: mock
  - name: openai-gpt4
    type: openai
rules:
  - name: echo
    if:
      event_type: pcas.echo.v1
    then:
      provider: mock-provider
  - name: prompts
    if:
      event_type: pcas.user.prompt.v1
    then:
      provider: openai-gpt4
"#;

/// Records the request it was handed, so tests can inspect enrichment.
struct CapturingProvider {
    seen: Mutex<Option<RequestData>>,
}

impl CapturingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(None),
        })
    }

    fn last_request(&self) -> Option<RequestData> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ComputeProvider for CapturingProvider {
    async fn execute(&self, request: Option<&RequestData>) -> pcas_providers::Result<String> {
        *self.seen.lock().unwrap() = request.cloned();
        Ok("captured".to_string())
    }

    fn name(&self) -> &str {
        "capturing"
    }
}

fn build_bus(
    storage: Arc<EventStore>,
    embedder: Option<SharedEmbedder>,
    llm: Option<Arc<CapturingProvider>>,
    rag_enabled: bool,
) -> EventBus {
    let policy = Arc::new(Engine::new(Policy::from_yaml(POLICY).unwrap()));
    let mut registry = pcas_providers::ProviderRegistry::new();
    registry.register(
        "mock-provider",
        ProviderHandle::unary(
            ProviderKind::Mock,
            Arc::new(MockProvider::new("mock-provider")),
        ),
    );
    if let Some(llm) = llm {
        registry.register("openai-gpt4", ProviderHandle::unary(ProviderKind::Llm, llm));
    }
    EventBus::new(
        storage,
        policy,
        Arc::new(registry),
        embedder,
        BusConfig::default().with_rag_enabled(rag_enabled),
    )
}

#[tokio::test]
async fn echo_routing_produces_exactly_one_correlated_response() {
    let storage = Arc::new(EventStore::open_in_memory().unwrap());
    let bus = build_bus(Arc::clone(&storage), None, None, false);

    let mut event = Event::new("pcas.echo.v1", "pcasctl")
        .with_subject("test-echo")
        .with_data(EventData::structured(json!({"message": "Hello"})));
    event.id = "e1".to_string();

    let response = bus.publish(event).await.unwrap().unwrap();
    assert_eq!(response.correlation_id.as_deref(), Some("e1"));
    let data = response.data.as_structured().unwrap();
    assert_eq!(data["original_event_id"], "e1");
    assert_eq!(data["provider"], "mock-provider");
    assert_eq!(data["response"], "Mock response from mock-provider");

    // Exactly one response event in the log.
    let responses: Vec<Event> = storage
        .get_all_events(0, 100)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type == "pcas.response.v1")
        .collect();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].id, response.id);
}

#[tokio::test]
async fn slow_subscriber_never_blocks_publisher() {
    let storage = Arc::new(EventStore::open_in_memory().unwrap());
    let bus = build_bus(storage, None, None, false);

    let mut draining = bus.subscribe("drainer").unwrap();
    let mut stalled = bus.subscribe("staller").unwrap();

    let total = 200;
    let mut drained = 0;
    for i in 0..total {
        let mut event = Event::new("pcas.echo.v1", "test")
            .with_data(EventData::structured(json!({"n": i})));
        event.id = format!("e{i}");
        // Publisher completes regardless of the stalled subscriber.
        bus.publish(event).await.unwrap();
        while draining.try_recv().is_some() {
            drained += 1;
        }
    }
    while draining.try_recv().is_some() {
        drained += 1;
    }

    let mut stalled_received = 0;
    while stalled.try_recv().is_some() {
        stalled_received += 1;
    }

    assert_eq!(drained, total);
    assert!(stalled_received <= 100);
}

#[tokio::test]
async fn rag_enrichment_excludes_self_and_reaches_provider() {
    let storage = Arc::new(EventStore::open_in_memory().unwrap());
    let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(16));
    let llm = CapturingProvider::new();
    let bus = build_bus(
        Arc::clone(&storage),
        Some(Arc::clone(&embedder)),
        Some(Arc::clone(&llm)),
        true,
    );

    // The query the published event will synthesise.
    let query = "what did I plan for the garden";
    let query_vector = embedder.embed(query).await.unwrap();

    // Pre-seed: the event's own vector plus two neighbours at similarity 1.
    let mut current = Event::new("pcas.user.prompt.v1", "test")
        .with_data(EventData::structured(json!({"prompt": query})));
    current.id = "current".to_string();
    storage.store_event(&current, Some(&query_vector)).unwrap();

    for (id, subject) in [("n1", "plant tomatoes in May"), ("n2", "water twice a week")] {
        let mut neighbour = Event::new("user.note.v1", "test").with_subject(subject);
        neighbour.id = id.to_string();
        storage.store_event(&neighbour, Some(&query_vector)).unwrap();
    }

    bus.publish(current).await.unwrap();

    let request = llm.last_request().unwrap();
    assert_eq!(request["rag_applied"], json!(true));
    assert_eq!(request["rag_event_count"], json!(2));

    let system = request["messages"][0]["content"].as_str().unwrap();
    assert!(system.contains("plant tomatoes in May"));
    assert!(system.contains("water twice a week"));
    // The event's own content never appears in its context.
    assert!(!system.contains(query));
    assert_eq!(request["messages"][1]["content"], query);
}

#[tokio::test]
async fn rag_disabled_leaves_request_untouched() {
    let storage = Arc::new(EventStore::open_in_memory().unwrap());
    let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(16));
    let llm = CapturingProvider::new();
    let bus = build_bus(storage, Some(embedder), Some(Arc::clone(&llm)), false);

    let event = Event::new("pcas.user.prompt.v1", "test")
        .with_data(EventData::structured(json!({"prompt": "hello"})));
    bus.publish(event).await.unwrap();

    let request = llm.last_request().unwrap();
    assert_eq!(request.get("prompt").and_then(|v| v.as_str()), Some("hello"));
    assert!(request.get("messages").is_none());
    assert!(request.get("rag_applied").is_none());
}

#[tokio::test]
async fn graceful_shutdown_makes_facts_recoverable_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("pcas.db");
    let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(16));

    let subjects: Vec<String> = (0..10).map(|i| format!("durable fact number {i}")).collect();

    {
        let storage = Arc::new(EventStore::open(&db_path).unwrap());
        let bus = build_bus(Arc::clone(&storage), Some(Arc::clone(&embedder)), None, false);

        for (i, subject) in subjects.iter().enumerate() {
            let mut event = Event::new("user.memory.v1", "test").with_subject(subject.clone());
            event.id = format!("fact-{i}");
            bus.publish(event).await.unwrap();
        }

        // Immediate shutdown: waits for vectorisation, then saves the index.
        bus.shutdown().await;
    }

    let reopened = EventStore::open(&db_path).unwrap();
    assert_eq!(reopened.vector_count(), 10);
    for (i, subject) in subjects.iter().enumerate() {
        let vector = embedder.embed(subject).await.unwrap();
        let results = reopened.query_similar(&vector, 1, None).unwrap();
        assert_eq!(results[0].id, format!("fact-{i}"));
        assert!(results[0].score >= 0.99);
    }
}
