//! The unified event store: graph log + ANN index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use pcas_types::Event;

use crate::error::{Result, StorageError};
use crate::filter::EventFilter;
use crate::graph::{EDGE_LABEL_EMBEDDING_OF, GraphStore};
use crate::index::VectorIndex;

/// Filtered searches over-fetch from the ANN index by this factor and
/// post-filter, because the index itself is not filter-aware.
const FILTER_OVERFETCH: usize = 10;

/// A single similarity query result.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Event identifier.
    pub id: String,
    /// Similarity score in `[0, 1]`-ish cosine space (1.0 = identical).
    pub score: f32,
}

/// Event storage with persistent similarity search.
///
/// Owns the database connection and the ANN index exclusively. The index is
/// persisted to a sidecar file (`<db-path minus .db>.hnsw`) on [`close`] and
/// loaded — or rebuilt from the `nodes` table — on open. In-memory stores
/// skip sidecar I/O entirely.
///
/// [`close`]: EventStore::close
pub struct EventStore {
    graph: GraphStore,
    index: VectorIndex,
    index_path: Option<PathBuf>,
}

/// Derive the sidecar index path from the database path.
fn sidecar_path(db_path: &Path) -> PathBuf {
    let s = db_path.to_string_lossy();
    let stem = s.strip_suffix(".db").unwrap_or(&s);
    PathBuf::from(format!("{stem}.hnsw"))
}

impl EventStore {
    /// Open (or create) a store at the given database path.
    ///
    /// The ANN index is loaded from its sidecar file when possible; a
    /// missing or unreadable sidecar triggers a rebuild from the vector
    /// nodes, which is then saved for the next startup.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        let graph = GraphStore::open(db_path)?;
        let index_path = sidecar_path(db_path);

        let index = match VectorIndex::load_from(&index_path) {
            Ok(index) => {
                info!(
                    path = %index_path.display(),
                    vectors = index.len(),
                    "Loaded ANN index from sidecar"
                );
                index
            }
            Err(err) => {
                info!(
                    path = %index_path.display(),
                    error = %err,
                    "No usable ANN sidecar, rebuilding from database"
                );
                let entries = graph.all_vectors()?;
                let rebuilt = VectorIndex::from_entries(entries)?;
                info!(vectors = rebuilt.len(), "Rebuilt ANN index");
                if !rebuilt.is_empty() {
                    if let Err(err) = rebuilt.save_to(&index_path) {
                        warn!(error = %err, "Failed to save rebuilt ANN index");
                    }
                }
                rebuilt
            }
        };

        Ok(Self {
            graph,
            index,
            index_path: Some(index_path),
        })
    }

    /// Open an in-memory store with no sidecar persistence.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            graph: GraphStore::open_in_memory()?,
            index: VectorIndex::new(),
            index_path: None,
        })
    }

    /// Persist an event, optionally together with an embedding.
    pub fn store_event(&self, event: &Event, embedding: Option<&[f32]>) -> Result<()> {
        self.graph.insert_event(event)?;
        if let Some(embedding) = embedding {
            if !embedding.is_empty() {
                self.attach_embedding(&event.id, embedding)?;
            }
        }
        Ok(())
    }

    /// Attach a new embedding to an already-persisted event.
    ///
    /// Re-embedding is additive: every call creates a fresh vector node and
    /// edge, never an in-place update.
    pub fn add_embedding_to_event(&self, event_id: &str, embedding: &[f32]) -> Result<()> {
        if !self.graph.event_exists(event_id)? {
            return Err(StorageError::NotFound(format!("event {event_id}")));
        }
        self.attach_embedding(event_id, embedding)
    }

    fn attach_embedding(&self, event_id: &str, embedding: &[f32]) -> Result<()> {
        let vector_id = self.graph.insert_vector(embedding)?;
        self.graph
            .insert_edge(&vector_id, event_id, EDGE_LABEL_EMBEDDING_OF)?;
        self.index.insert(vector_id, embedding)?;
        Ok(())
    }

    /// Rehydrate a single event.
    pub fn get_event_by_id(&self, event_id: &str) -> Result<Event> {
        self.graph.get_event(event_id)
    }

    /// Fetch multiple events; missing ids are silently omitted and output
    /// order is unspecified.
    pub fn batch_get_events(&self, ids: &[String]) -> Result<Vec<Event>> {
        self.graph.batch_get_events(ids)
    }

    /// Paginated scan of all events in insertion order.
    pub fn get_all_events(&self, offset: usize, limit: usize) -> Result<Vec<Event>> {
        self.graph.get_all_events(offset, limit)
    }

    /// Whether an event already has at least one embedding.
    pub fn has_embedding(&self, event_id: &str) -> Result<bool> {
        self.graph.has_embedding(event_id)
    }

    /// Number of vectors currently indexed.
    pub fn vector_count(&self) -> usize {
        self.index.len()
    }

    /// Return up to `top_k` events ranked by descending cosine similarity.
    ///
    /// With a filter, eligible events are resolved first; an empty eligible
    /// set short-circuits without touching the ANN index. When an event has
    /// several embeddings the highest-scoring one wins.
    pub fn query_similar(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&EventFilter>,
    ) -> Result<Vec<QueryResult>> {
        if query.is_empty() {
            return Err(StorageError::Index("query vector is empty".to_string()));
        }
        if top_k == 0 {
            return Err(StorageError::Index("top_k must be positive".to_string()));
        }

        let active_filter = filter.filter(|f| !f.is_empty());

        let candidates = match active_filter {
            Some(filter) => {
                let eligible_events = self.graph.filtered_event_ids(filter)?;
                if eligible_events.is_empty() {
                    return Ok(Vec::new());
                }
                let eligible_vectors = self.graph.vector_ids_for_events(&eligible_events)?;
                if eligible_vectors.is_empty() {
                    return Ok(Vec::new());
                }

                self.index
                    .search(query, top_k * FILTER_OVERFETCH)?
                    .into_iter()
                    .filter(|(vector_id, _)| eligible_vectors.contains(vector_id))
                    .collect::<Vec<_>>()
            }
            None => self.index.search(query, top_k)?,
        };

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let vector_ids: Vec<String> = candidates.iter().map(|(id, _)| id.clone()).collect();
        let vector_to_event = self.graph.events_for_vectors(&vector_ids)?;

        // Best score per event; candidates arrive in descending score order.
        let mut best: HashMap<String, f32> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for (vector_id, score) in candidates {
            let Some(event_id) = vector_to_event.get(&vector_id) else {
                continue;
            };
            match best.get(event_id) {
                Some(existing) if *existing >= score => {}
                Some(_) => {
                    best.insert(event_id.clone(), score);
                }
                None => {
                    best.insert(event_id.clone(), score);
                    order.push(event_id.clone());
                }
            }
        }

        let mut results: Vec<QueryResult> = order
            .into_iter()
            .map(|id| {
                let score = best[&id];
                QueryResult { id, score }
            })
            .collect();
        results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        results.truncate(top_k);
        Ok(results)
    }

    /// Persist the ANN index sidecar. The database connection itself closes
    /// when the store is dropped.
    pub fn close(&self) -> Result<()> {
        if let Some(ref path) = self.index_path {
            self.index.save_to(path)?;
            info!(path = %path.display(), "Saved ANN index on close");
        }
        Ok(())
    }
}
