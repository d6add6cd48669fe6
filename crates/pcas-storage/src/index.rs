//! In-process ANN index over embedding vectors.
//!
//! Wraps a HNSW graph (`hora`) for approximate ranking. Raw vectors are kept
//! alongside the graph so result scores are computed exactly as
//! `1 - cosine_distance`: identical vectors score 1.0, orthogonal 0.0. The
//! graph itself holds unit-normalised copies and ranks with Euclidean
//! distance, which orders identically to cosine on normalised vectors.
//!
//! Inserts mark the index dirty; the graph is (re)built lazily on the next
//! search. The whole structure is guarded by a read/write lock — searches
//! take the read lock, inserts the write lock.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use hora::core::ann_index::ANNIndex;
use hora::core::metrics::Metric;
use hora::index::hnsw_idx::HNSWIndex;
use hora::index::hnsw_params::HNSWParams;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StorageError};

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a > 0.0 && norm_b > 0.0 {
        dot / (norm_a * norm_b)
    } else {
        0.0
    }
}

fn normalized(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Serialised form of the index, written to the sidecar file.
#[derive(Debug, Serialize, Deserialize)]
struct IndexSnapshot {
    dimension: usize,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    vector: Vec<f32>,
}

struct IndexInner {
    graph: HNSWIndex<f32, usize>,
    dimension: usize,
    /// Slot → vector node id.
    keys: Vec<String>,
    /// Vector node id → slot.
    slots: HashMap<String, usize>,
    /// Slot → raw (un-normalised) vector.
    vectors: Vec<Vec<f32>>,
    dirty: bool,
}

impl IndexInner {
    fn empty() -> Self {
        Self {
            graph: HNSWIndex::<f32, usize>::new(0, &HNSWParams::<f32>::default()),
            dimension: 0,
            keys: Vec::new(),
            slots: HashMap::new(),
            vectors: Vec::new(),
            dirty: false,
        }
    }

    fn insert(&mut self, id: String, vector: Vec<f32>) -> Result<()> {
        if vector.is_empty() {
            return Err(StorageError::Index("empty vector".to_string()));
        }
        if self.slots.contains_key(&id) {
            debug!(vector_id = %id, "Vector already indexed, skipping");
            return Ok(());
        }
        if self.dimension == 0 {
            self.dimension = vector.len();
            self.graph = HNSWIndex::<f32, usize>::new(self.dimension, &HNSWParams::<f32>::default());
        } else if vector.len() != self.dimension {
            return Err(StorageError::Index(format!(
                "dimension mismatch: index holds {}-d vectors, got {}-d",
                self.dimension,
                vector.len()
            )));
        }

        let slot = self.keys.len();
        self.graph
            .add(&normalized(&vector), slot)
            .map_err(|e| StorageError::Index(e.to_string()))?;
        self.keys.push(id.clone());
        self.slots.insert(id, slot);
        self.vectors.push(vector);
        self.dirty = true;
        Ok(())
    }

    fn ensure_built(&mut self) -> Result<()> {
        if self.dirty && !self.keys.is_empty() {
            self.graph
                .build(Metric::Euclidean)
                .map_err(|e| StorageError::Index(e.to_string()))?;
            self.dirty = false;
        }
        Ok(())
    }

    fn search(&self, query: &[f32], top_k: usize) -> Vec<(String, f32)> {
        if self.keys.is_empty() || top_k == 0 {
            return Vec::new();
        }
        let slots = self.graph.search(&normalized(query), top_k);
        let mut results: Vec<(String, f32)> = slots
            .into_iter()
            .filter_map(|slot| {
                let id = self.keys.get(slot)?.clone();
                let score = cosine_similarity(query, &self.vectors[slot]);
                Some((id, score))
            })
            .collect();
        results.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        results
    }
}

/// Thread-safe ANN index over `(vector-node-id, vector)` entries.
pub struct VectorIndex {
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner::empty()),
        }
    }

    /// Build an index from existing entries (sidecar load or table rebuild).
    ///
    /// Entries that cannot be indexed (wrong dimension, empty) are skipped
    /// so one bad vector never blocks startup.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Vec<f32>)>) -> Result<Self> {
        let index = Self::new();
        {
            let mut inner = index.inner.write();
            for (id, vector) in entries {
                if let Err(err) = inner.insert(id, vector) {
                    warn!(error = %err, "Skipping unindexable vector");
                }
            }
            inner.ensure_built()?;
        }
        Ok(index)
    }

    /// Add a vector under the given node id.
    pub fn insert(&self, id: impl Into<String>, vector: &[f32]) -> Result<()> {
        self.inner.write().insert(id.into(), vector.to_vec())
    }

    /// Return up to `top_k` entries ranked by descending cosine similarity.
    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<(String, f32)>> {
        {
            let inner = self.inner.read();
            if !inner.dirty {
                return Ok(inner.search(query, top_k));
            }
        }
        // Pending inserts: take the write lock once to build, search under it.
        let mut inner = self.inner.write();
        inner.ensure_built()?;
        Ok(inner.search(query, top_k))
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.inner.read().keys.len()
    }

    /// True when the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the index to a sidecar file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let inner = self.inner.read();
        let snapshot = IndexSnapshot {
            dimension: inner.dimension,
            entries: inner
                .keys
                .iter()
                .zip(inner.vectors.iter())
                .map(|(id, vector)| IndexEntry {
                    id: id.clone(),
                    vector: vector.clone(),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&snapshot)?;
        fs::write(path.as_ref(), bytes)?;
        debug!(
            path = %path.as_ref().display(),
            vectors = snapshot.entries.len(),
            "Saved ANN index sidecar"
        );
        Ok(())
    }

    /// Load an index from a sidecar file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = fs::read(path.as_ref())?;
        let snapshot: IndexSnapshot = serde_json::from_slice(&bytes)?;
        Self::from_entries(snapshot.entries.into_iter().map(|e| (e.id, e.vector)))
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}
