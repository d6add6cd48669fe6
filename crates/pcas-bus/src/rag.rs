//! Retrieval-augmented enrichment of LLM-bound requests.
//!
//! The enricher synthesises a query from the event, fetches its embedding
//! through a cache → single-flight → rate-limiter chain, recalls similar
//! events from storage, filters out the event itself and weak matches,
//! renders the survivors as a token-bounded markdown context, and injects it
//! into the request as a chat-message list.
//!
//! Enrichment failures never propagate: every fallible step degrades to the
//! unenriched request, annotated with a machine-readable skip reason once a
//! query embedding was obtained.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, warn};

use pcas_providers::{RequestData, SharedEmbedder};
use pcas_storage::EventStore;
use pcas_types::Event;

use crate::singleflight::SingleFlight;

/// Neighbours requested from the ANN index.
pub const RAG_TOP_K: usize = 5;

/// Minimum similarity for a candidate to be used as context.
pub const SCORE_THRESHOLD: f32 = 0.4;

/// Per-event enrichment deadline.
pub const RAG_TIMEOUT: Duration = Duration::from_secs(25);

/// Approximate context budget: 16 000 chars at ~4 chars/token ≈ 4 000 tokens.
pub const MAX_CONTEXT_CHARS: usize = 16_000;

/// Embedding cache capacity.
pub const EMBEDDING_CACHE_CAPACITY: usize = 1000;

/// Rendered payload fields are cut at this many characters.
const FIELD_TRUNCATE_CHARS: usize = 200;

/// Payload fields rendered into the context, in priority order.
const RENDER_PRIORITY_FIELDS: [&str; 8] = [
    "prompt",
    "message",
    "query",
    "text",
    "description",
    "content",
    "response",
    "result",
];

/// Payload fields contributing to query synthesis, in order.
const QUERY_FIELDS: [&str; 4] = ["query", "prompt", "message", "text"];

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

// ─────────────────────────────────────────────────────────────────────────────
// Embedding Cache
// ─────────────────────────────────────────────────────────────────────────────

struct CacheEntry {
    embedding: Vec<f32>,
    #[allow(dead_code)]
    inserted_at: Instant,
}

/// LRU cache of query fingerprint → embedding vector.
pub struct EmbeddingCache {
    inner: Mutex<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a cache holding up to `capacity` embeddings.
    pub fn new(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch an embedding, marking the entry most recently used.
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        let mut cache = self.inner.lock();
        match cache.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.embedding.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert an embedding, evicting the least-recently-used entry at
    /// capacity.
    pub fn set(&self, key: impl Into<String>, embedding: Vec<f32>) {
        self.inner.lock().put(
            key.into(),
            CacheEntry {
                embedding,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Current number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True when the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache hits since construction.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses since construction.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Enricher
// ─────────────────────────────────────────────────────────────────────────────

/// The RAG enrichment subsystem.
pub struct RagEnricher {
    storage: Arc<EventStore>,
    embedder: SharedEmbedder,
    cache: EmbeddingCache,
    limiter: DirectLimiter,
    single_flight: SingleFlight<Vec<f32>>,
}

impl RagEnricher {
    /// Create an enricher over the given storage and embedding backend.
    pub fn new(storage: Arc<EventStore>, embedder: SharedEmbedder) -> Self {
        let per_second = NonZeroU32::new(10).unwrap();
        Self {
            storage,
            embedder,
            cache: EmbeddingCache::new(EMBEDDING_CACHE_CAPACITY),
            limiter: RateLimiter::direct(Quota::per_second(per_second).allow_burst(per_second)),
            single_flight: SingleFlight::new(),
        }
    }

    /// The embedding cache, exposed for inspection.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }

    /// Enrich `request` in place with context retrieved for `event`.
    ///
    /// A response must never be enriched with itself: candidates matching
    /// the event's own identifier are removed before anything else.
    pub async fn enrich(&self, event: &Event, request: &mut RequestData) {
        let Some(query) = synthesize_query(event, request) else {
            debug!(event_id = %event.id, "No query text, skipping enrichment");
            return;
        };
        debug!(event_id = %event.id, query = %query, "Enriching request");

        let Some(embedding) = self.query_embedding(&query).await else {
            return;
        };

        let candidates = match self.storage.query_similar(&embedding, RAG_TOP_K, None) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "Similarity query failed");
                return;
            }
        };

        let cleaned: Vec<_> = candidates
            .into_iter()
            .filter(|result| result.id != event.id)
            .collect();
        if cleaned.is_empty() {
            annotate_skip(request, "no_similar_events");
            return;
        }

        let relevant: Vec<_> = cleaned
            .iter()
            .filter(|result| result.score >= SCORE_THRESHOLD)
            .collect();
        if relevant.is_empty() {
            annotate_skip(request, "low_similarity");
            return;
        }

        let ids: Vec<String> = relevant.iter().map(|r| r.id.clone()).collect();
        let mut events = match self.storage.batch_get_events(&ids) {
            Ok(events) => events,
            Err(err) => {
                warn!(event_id = %event.id, error = %err, "Context hydration failed");
                annotate_skip(request, "retrieval_error");
                return;
            }
        };

        let scores: HashMap<&str, f32> = cleaned
            .iter()
            .map(|r| (r.id.as_str(), r.score))
            .collect();
        events.sort_by(|a, b| {
            let sa = scores.get(a.id.as_str()).copied().unwrap_or(0.0);
            let sb = scores.get(b.id.as_str()).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        let Some(context) = render_context(&events, MAX_CONTEXT_CHARS) else {
            annotate_skip(request, "no_context_generated");
            return;
        };

        let original_prompt = request
            .get("prompt")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let system_message = format!(
            "You have access to the following relevant historical context. \
             Use this information to provide accurate and personalized responses:\n\n{context}"
        );

        request.insert(
            "messages".to_string(),
            json!([
                {"role": "system", "content": system_message},
                {"role": "user", "content": original_prompt},
            ]),
        );
        request.remove("prompt");
        request.insert("rag_event_count".to_string(), json!(events.len()));
        request.insert("rag_applied".to_string(), json!(true));

        debug!(
            event_id = %event.id,
            context_events = events.len(),
            "Enrichment applied"
        );
    }

    /// Fetch the query embedding through cache → single-flight → limiter.
    ///
    /// Only the caller that wins the single-flight consumes a rate-limit
    /// token; waiters share its result.
    async fn query_embedding(&self, query: &str) -> Option<Vec<f32>> {
        let cache_key = format!("rag:{query}");
        if let Some(cached) = self.cache.get(&cache_key) {
            debug!("Using cached embedding for query");
            return Some(cached);
        }

        let embedder = Arc::clone(&self.embedder);
        let query = query.to_string();
        let limiter = &self.limiter;
        let result = self
            .single_flight
            .run(&cache_key, || async move {
                limiter.until_ready().await;
                match embedder.embed(&query).await {
                    Ok(embedding) => Some(embedding),
                    Err(err) => {
                        warn!(error = %err, "Failed to create query embedding");
                        None
                    }
                }
            })
            .await;

        if let Some(ref embedding) = result {
            self.cache.set(cache_key, embedding.clone());
        }
        result
    }
}

fn annotate_skip(request: &mut RequestData, reason: &str) {
    debug!(reason, "Enrichment yielded nothing");
    request.insert("rag_applied".to_string(), json!(false));
    request.insert("rag_reason".to_string(), json!(reason));
}

// ─────────────────────────────────────────────────────────────────────────────
// Query Synthesis and Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// Build the retrieval query: event subject followed by well-known request
/// fields, joined by spaces. Returns `None` when nothing contributes.
pub fn synthesize_query(event: &Event, request: &RequestData) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();

    if let Some(subject) = event.subject.as_deref() {
        if !subject.is_empty() {
            parts.push(subject);
        }
    }
    for field in QUERY_FIELDS {
        if let Some(value) = request.get(field).and_then(|v| v.as_str()) {
            if !value.is_empty() {
                parts.push(value);
            }
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}

fn render_event(event: &Event) -> String {
    let mut out = String::new();

    if let Some(time) = event.time {
        out.push_str(&format!("**[{}]** ", time.format("%Y-%m-%d %H:%M")));
    }
    out.push_str(&event.event_type);
    if let Some(subject) = event.subject.as_deref() {
        if !subject.is_empty() {
            out.push_str(": ");
            out.push_str(subject);
        }
    }
    out.push('\n');

    if let Some(map) = event.data.as_structured() {
        let fields: Vec<String> = RENDER_PRIORITY_FIELDS
            .iter()
            .filter_map(|key| {
                let value = map.get(*key)?.as_str()?;
                if value.is_empty() {
                    return None;
                }
                Some(format!(
                    "  - {key}: {}",
                    truncate_chars(value, FIELD_TRUNCATE_CHARS)
                ))
            })
            .collect();
        if !fields.is_empty() {
            out.push_str(&fields.join("\n"));
            out.push('\n');
        }
    }

    out
}

/// Render events as compact markdown within an approximate token budget
/// (4 chars/token). Returns `None` when no entry fits.
pub fn render_context(events: &[Event], max_chars: usize) -> Option<String> {
    let max_tokens = max_chars / 4;
    let mut out = String::from("## Relevant Historical Context\n\n");
    let mut current_tokens = 40; // approximate header cost
    let mut rendered = 0;

    for (i, event) in events.iter().enumerate() {
        let entry = render_event(event);
        let entry_tokens = entry.len() / 4;

        if current_tokens + entry_tokens > max_tokens {
            out.push_str(&format!(
                "\n*... and {} more relevant events (truncated due to token limit)*\n",
                events.len() - i
            ));
            break;
        }

        out.push_str(&entry);
        out.push_str("\n---\n\n");
        current_tokens += entry_tokens + 10;
        rendered += 1;
    }

    if rendered == 0 { None } else { Some(out) }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use pcas_providers::MockEmbedder;
    use pcas_types::EventData;
    use serde_json::json;

    fn request_from(value: serde_json::Value) -> RequestData {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_cache_lru_eviction() {
        let cache = EmbeddingCache::new(2);
        cache.set("a", vec![1.0]);
        cache.set("b", vec![2.0]);
        assert!(cache.get("a").is_some()); // refresh a
        cache.set("c", vec![3.0]); // evicts b
        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_cache_hit_miss_counters() {
        let cache = EmbeddingCache::new(4);
        assert!(cache.get("x").is_none());
        cache.set("x", vec![1.0]);
        assert!(cache.get("x").is_some());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_synthesize_query_order() {
        let event = Event::new("user.note.v1", "test").with_subject("subject text");
        let request = request_from(json!({
            "prompt": "prompt text",
            "query": "query text",
            "other": "ignored"
        }));
        let query = synthesize_query(&event, &request).unwrap();
        assert_eq!(query, "subject text query text prompt text");
    }

    #[test]
    fn test_synthesize_query_empty() {
        let event = Event::new("user.note.v1", "test");
        let request = RequestData::new();
        assert!(synthesize_query(&event, &request).is_none());
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 200), "short");
        let long = "x".repeat(250);
        let cut = truncate_chars(&long, 200);
        assert_eq!(cut.chars().count(), 200);
        assert!(cut.ends_with("..."));
        // Multi-byte input must not split a character.
        let unicode = "é".repeat(250);
        let cut = truncate_chars(&unicode, 200);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn test_render_event_fields() {
        let event = Event::new("user.note.v1", "test")
            .with_subject("groceries")
            .with_data(EventData::structured(json!({
                "text": "buy milk",
                "irrelevant": "skipped",
                "response": "",
            })));
        let entry = render_event(&event);
        assert!(entry.contains("user.note.v1: groceries"));
        assert!(entry.contains("  - text: buy milk"));
        assert!(!entry.contains("irrelevant"));
        assert!(!entry.contains("response"));
    }

    #[test]
    fn test_render_context_truncates_at_budget() {
        let events: Vec<Event> = (0..20)
            .map(|i| {
                Event::new("user.note.v1", "test")
                    .with_subject(format!("note {i}"))
                    .with_data(EventData::structured(json!({"text": "y".repeat(190)})))
            })
            .collect();

        // A budget that fits only a few entries.
        let context = render_context(&events, 800).unwrap();
        assert!(context.contains("more relevant events (truncated due to token limit)"));
        assert!(context.len() < 2000);
    }

    #[test]
    fn test_render_context_empty_when_nothing_fits() {
        let events = vec![
            Event::new("user.note.v1", "test")
                .with_data(EventData::structured(json!({"text": "z".repeat(199)}))),
        ];
        assert!(render_context(&events, 160).is_none());
        assert!(render_context(&[], 16_000).is_none());
    }

    fn stored_event(store: &EventStore, id: &str, subject: &str, vector: &[f32]) {
        let mut event = Event::new("user.memory.v1", "test").with_subject(subject);
        event.id = id.to_string();
        store.store_event(&event, Some(vector)).unwrap();
    }

    #[tokio::test]
    async fn test_enrich_filters_self_reference() {
        let storage = Arc::new(EventStore::open_in_memory().unwrap());
        let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(8));

        let query_vector = embedder.embed("the current question").await.unwrap();
        // The current event's own vector at similarity 1.0, plus two other
        // events with the same vector.
        stored_event(&storage, "current", "the current question", &query_vector);
        stored_event(&storage, "other-1", "first neighbour", &query_vector);
        stored_event(&storage, "other-2", "second neighbour", &query_vector);

        let enricher = RagEnricher::new(Arc::clone(&storage), embedder);

        let mut event = Event::new("pcas.user.prompt.v1", "test");
        event.id = "current".to_string();
        let mut request = request_from(json!({"prompt": "the current question"}));

        enricher.enrich(&event, &mut request).await;

        assert_eq!(request["rag_applied"], json!(true));
        assert_eq!(request["rag_event_count"], json!(2));
        assert!(request.get("prompt").is_none());

        let system = request["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("first neighbour"));
        assert!(system.contains("second neighbour"));
        assert!(!system.contains("the current question\n"));
        assert_eq!(request["messages"][1]["content"], "the current question");
    }

    #[tokio::test]
    async fn test_enrich_low_similarity() {
        let storage = Arc::new(EventStore::open_in_memory().unwrap());
        let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(8));

        // An orthogonal vector: similarity far below the threshold.
        let mut far = embedder.embed("anything").await.unwrap();
        far.iter_mut().for_each(|v| *v = 0.0);
        far[0] = 1.0;
        let mut query = embedder.embed("unused").await.unwrap();
        query.iter_mut().for_each(|v| *v = 0.0);
        query[1] = 1.0;

        stored_event(&storage, "far-away", "unrelated", &far);

        // Embedder that returns the orthogonal query vector.
        struct Fixed(Vec<f32>);
        #[async_trait::async_trait]
        impl pcas_providers::Embedder for Fixed {
            async fn embed(&self, _text: &str) -> pcas_providers::Result<Vec<f32>> {
                Ok(self.0.clone())
            }
            fn dimensions(&self) -> usize {
                self.0.len()
            }
            fn name(&self) -> &str {
                "fixed"
            }
        }

        let enricher = RagEnricher::new(Arc::clone(&storage), Arc::new(Fixed(query)));
        let event = Event::new("pcas.user.prompt.v1", "test");
        let mut request = request_from(json!({"prompt": "hello"}));
        enricher.enrich(&event, &mut request).await;

        assert_eq!(request["rag_applied"], json!(false));
        assert_eq!(request["rag_reason"], json!("low_similarity"));
        assert!(request.get("messages").is_none());
    }

    #[tokio::test]
    async fn test_enrich_no_similar_events() {
        let storage = Arc::new(EventStore::open_in_memory().unwrap());
        let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(8));
        let vector = embedder.embed("only self").await.unwrap();
        stored_event(&storage, "self-only", "only self", &vector);

        let enricher = RagEnricher::new(Arc::clone(&storage), embedder);
        let mut event = Event::new("pcas.user.prompt.v1", "test");
        event.id = "self-only".to_string();
        let mut request = request_from(json!({"prompt": "only self"}));
        enricher.enrich(&event, &mut request).await;

        assert_eq!(request["rag_applied"], json!(false));
        assert_eq!(request["rag_reason"], json!("no_similar_events"));
    }

    #[tokio::test]
    async fn test_embedding_cached_after_first_call() {
        let storage = Arc::new(EventStore::open_in_memory().unwrap());
        let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(8));
        let enricher = RagEnricher::new(storage, embedder);

        assert!(enricher.query_embedding("repeated query").await.is_some());
        assert!(enricher.query_embedding("repeated query").await.is_some());
        assert_eq!(enricher.cache().hits(), 1);
        assert_eq!(enricher.cache().len(), 1);
    }
}
