//! Unified storage layer for the PCAS event bus.
//!
//! Events and their embeddings live in a single graph-structured SQLite
//! database: events are `event` nodes whose content is the JSON-serialised
//! record, embeddings are `vector` nodes holding little-endian packed f32
//! bytes, and an `embedding_of` edge links each vector to its event.
//!
//! Similarity search runs against an in-process HNSW index that is persisted
//! to a sidecar file on close and rebuilt from the `nodes` table when the
//! sidecar is missing or unreadable.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  EventStore                                                  │
//! │  ├─ GraphStore      nodes/edges tables (rusqlite)            │
//! │  └─ VectorIndex     HNSW over vectors (hora), RwLock-guarded │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod filter;
pub mod graph;
pub mod index;
pub mod store;

pub use error::{Result, StorageError};
pub use filter::EventFilter;
pub use graph::{EDGE_LABEL_EMBEDDING_OF, GraphStore, NODE_TYPE_EVENT, NODE_TYPE_VECTOR};
pub use index::{VectorIndex, cosine_similarity};
pub use store::{EventStore, QueryResult};
