//! Background vectorisation of fact events.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use pcas_providers::SharedEmbedder;
use pcas_storage::EventStore;
use pcas_types::{Event, EventData};

/// Fresh deadline for each background task, so vectorisation survives the
/// publishing client going away.
pub const VECTORIZE_TIMEOUT: Duration = Duration::from_secs(30);

/// Payload fields scanned for embeddable text, in order.
const TEXT_FIELDS: [&str; 6] = [
    "prompt",
    "response",
    "message",
    "text",
    "content",
    "description",
];

/// Extract the text an event should be embedded under.
///
/// Prefers the subject; otherwise the first non-empty well-known payload
/// field; otherwise the whole structured payload serialised. The event type
/// is never prefixed — the vector space holds pure content.
pub fn extract_text_content(event: &Event) -> Option<String> {
    if let Some(subject) = event.subject.as_deref() {
        if !subject.is_empty() {
            return Some(subject.to_string());
        }
    }

    match &event.data {
        EventData::Structured(map) => {
            for field in TEXT_FIELDS {
                if let Some(value) = map.get(field).and_then(|v| v.as_str()) {
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
            serde_json::to_string(map).ok()
        }
        EventData::Raw(_) | EventData::Empty => None,
    }
}

/// Schedules and tracks background embedding tasks.
///
/// Shutdown closes the tracker and waits for in-flight tasks before the
/// caller closes storage, so no embedding write races the sidecar save.
pub struct Vectorizer {
    storage: Arc<EventStore>,
    embedder: SharedEmbedder,
    tracker: TaskTracker,
}

impl Vectorizer {
    /// Create a vectoriser over the given storage and embedding backend.
    pub fn new(storage: Arc<EventStore>, embedder: SharedEmbedder) -> Self {
        Self {
            storage,
            embedder,
            tracker: TaskTracker::new(),
        }
    }

    /// Launch a background task embedding the event's textual content.
    pub fn spawn(&self, event: Event) {
        let storage = Arc::clone(&self.storage);
        let embedder = Arc::clone(&self.embedder);
        self.tracker.spawn(async move {
            let result =
                tokio::time::timeout(VECTORIZE_TIMEOUT, vectorize(storage, embedder, &event))
                    .await;
            if result.is_err() {
                warn!(event_id = %event.id, "Vectorisation timed out");
            }
        });
    }

    /// Number of tasks still tracked.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for all in-flight vectorisation tasks to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

async fn vectorize(storage: Arc<EventStore>, embedder: SharedEmbedder, event: &Event) {
    let Some(text) = extract_text_content(event) else {
        debug!(event_id = %event.id, "No text content to vectorise");
        return;
    };

    debug!(
        event_id = %event.id,
        event_type = %event.event_type,
        "Vectorising event content"
    );

    let embedding = match embedder.embed(&text).await {
        Ok(embedding) => embedding,
        Err(err) => {
            warn!(event_id = %event.id, error = %err, "Failed to create embedding");
            return;
        }
    };

    if let Err(err) = storage.add_embedding_to_event(&event.id, &embedding) {
        warn!(event_id = %event.id, error = %err, "Failed to store embedding");
        return;
    }

    debug!(event_id = %event.id, "Event vectorised");
}
