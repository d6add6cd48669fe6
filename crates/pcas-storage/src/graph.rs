//! Graph-structured event log backed by SQLite.
//!
//! Two tables hold everything: `nodes` (events and vectors) and `edges`
//! (relationships between them). Event nodes store the JSON-serialised
//! record; vector nodes store little-endian packed f32 bytes. The only edge
//! label the core writes is `embedding_of`, from a vector node to the event
//! it embeds.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::debug;
use uuid::Uuid;

use pcas_types::Event;

use crate::error::{Result, StorageError};
use crate::filter::EventFilter;

/// Node type tag for events.
pub const NODE_TYPE_EVENT: &str = "event";
/// Node type tag for embedding vectors.
pub const NODE_TYPE_VECTOR: &str = "vector";
/// Edge label linking a vector node to the event it embeds.
pub const EDGE_LABEL_EMBEDDING_OF: &str = "embedding_of";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    content BLOB,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY,
    source_node_id TEXT NOT NULL,
    target_node_id TEXT NOT NULL,
    label TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (source_node_id) REFERENCES nodes(id),
    FOREIGN KEY (target_node_id) REFERENCES nodes(id)
);

CREATE INDEX IF NOT EXISTS idx_nodes_type ON nodes(type);
CREATE INDEX IF NOT EXISTS idx_edges_source_label ON edges(source_node_id, label);
CREATE INDEX IF NOT EXISTS idx_edges_target_label ON edges(target_node_id, label);
"#;

/// Encode a vector as little-endian packed f32 bytes.
pub(crate) fn encode_vector(vector: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Decode little-endian packed f32 bytes back into a vector.
///
/// Returns `None` for content that is not a whole number of floats.
pub(crate) fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// The node/edge log.
///
/// Owns the database connection exclusively; callers share the store behind
/// an `Arc`. Uses WAL mode for concurrent readers.
pub struct GraphStore {
    conn: Mutex<Connection>,
}

impl GraphStore {
    /// Open (or create) a graph store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory graph store, used by tests and ephemeral servers.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Persist an event as an `event` node.
    ///
    /// Event content is stored as JSON text (not a blob) so SQLite's
    /// `json_extract` can filter on it.
    pub fn insert_event(&self, event: &Event) -> Result<()> {
        let content = serde_json::to_string(event)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO nodes (id, type, content) VALUES (?1, ?2, ?3)",
            params![event.id, NODE_TYPE_EVENT, content],
        )?;
        debug!(event_id = %event.id, event_type = %event.event_type, "Stored event node");
        Ok(())
    }

    /// Persist an embedding as a `vector` node and return its id.
    pub fn insert_vector(&self, vector: &[f32]) -> Result<String> {
        let vector_id = format!("vec_{}", Uuid::new_v4());
        let content = encode_vector(vector);
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO nodes (id, type, content) VALUES (?1, ?2, ?3)",
            params![vector_id, NODE_TYPE_VECTOR, content],
        )?;
        Ok(vector_id)
    }

    /// Create an edge between two existing nodes.
    pub fn insert_edge(&self, source_id: &str, target_id: &str, label: &str) -> Result<String> {
        let edge_id = format!("edge_{}", Uuid::new_v4());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO edges (id, source_node_id, target_node_id, label) VALUES (?1, ?2, ?3, ?4)",
            params![edge_id, source_id, target_id, label],
        )?;
        Ok(edge_id)
    }

    /// Whether an event node with this id exists.
    pub fn event_exists(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM nodes WHERE id = ?1 AND type = ?2",
            params![event_id, NODE_TYPE_EVENT],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Rehydrate a single event from its stored JSON.
    pub fn get_event(&self, event_id: &str) -> Result<Event> {
        let conn = self.conn.lock().unwrap();
        let content: Option<String> = conn
            .query_row(
                "SELECT content FROM nodes WHERE id = ?1 AND type = ?2",
                params![event_id, NODE_TYPE_EVENT],
                |row| row.get(0),
            )
            .optional()?;

        match content {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(StorageError::NotFound(format!("event {event_id}"))),
        }
    }

    /// Fetch multiple events in one query.
    ///
    /// Output order is not guaranteed to match input order, and missing ids
    /// are silently omitted; callers needing a strict mapping must re-index
    /// by identifier.
    pub fn batch_get_events(&self, ids: &[String]) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT content FROM nodes WHERE id IN ({placeholders}) AND type = '{NODE_TYPE_EVENT}'"
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut events = Vec::with_capacity(ids.len());
        for row in rows {
            let json = row?;
            // Malformed nodes are skipped, not fatal.
            match serde_json::from_str::<Event>(&json) {
                Ok(event) => events.push(event),
                Err(err) => debug!(error = %err, "Skipping malformed event node"),
            }
        }
        Ok(events)
    }

    /// Paginated scan of all events in insertion order.
    pub fn get_all_events(&self, offset: usize, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT content FROM nodes WHERE type = ?1 ORDER BY rowid ASC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(
            params![NODE_TYPE_EVENT, limit as i64, offset as i64],
            |row| row.get::<_, String>(0),
        )?;

        let mut events = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str::<Event>(&json) {
                Ok(event) => events.push(event),
                Err(err) => debug!(error = %err, "Skipping malformed event node"),
            }
        }
        Ok(events)
    }

    /// Whether an event already has at least one `embedding_of` edge.
    pub fn has_embedding(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM edges WHERE target_node_id = ?1 AND label = ?2",
            params![event_id, EDGE_LABEL_EMBEDDING_OF],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Scan every vector node, used to rebuild the ANN index.
    pub fn all_vectors(&self) -> Result<Vec<(String, Vec<f32>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id, content FROM nodes WHERE type = ?1")?;
        let rows = stmt.query_map(params![NODE_TYPE_VECTOR], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;

        let mut vectors = Vec::new();
        for row in rows {
            let (id, bytes) = row?;
            if let Some(vector) = decode_vector(&bytes) {
                vectors.push((id, vector));
            }
        }
        Ok(vectors)
    }

    /// Event node ids satisfying every condition of the filter.
    pub fn filtered_event_ids(&self, filter: &EventFilter) -> Result<HashSet<String>> {
        let mut conditions: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();

        if let Some(ref user_id) = filter.user_id {
            conditions.push("json_extract(content, '$.user_id') = ?".to_string());
            args.push(user_id.clone());
        }
        if let Some(ref session_id) = filter.session_id {
            conditions.push("json_extract(content, '$.session_id') = ?".to_string());
            args.push(session_id.clone());
        }
        if !filter.event_types.is_empty() {
            let placeholders = vec!["?"; filter.event_types.len()].join(",");
            conditions.push(format!(
                "json_extract(content, '$.type') IN ({placeholders})"
            ));
            args.extend(filter.event_types.iter().cloned());
        }
        if let Some(from) = filter.time_from {
            conditions.push("datetime(json_extract(content, '$.time')) >= datetime(?)".to_string());
            args.push(from.to_rfc3339());
        }
        if let Some(to) = filter.time_to {
            conditions.push("datetime(json_extract(content, '$.time')) <= datetime(?)".to_string());
            args.push(to.to_rfc3339());
        }
        for (key, value) in &filter.attributes {
            // Structured payloads are stored under the envelope's value field.
            conditions.push(format!(
                "json_extract(content, '$.data.value.\"{key}\"') = ?"
            ));
            args.push(value.clone());
        }

        let mut sql = format!("SELECT id FROM nodes WHERE type = '{NODE_TYPE_EVENT}'");
        if !conditions.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(&conditions.join(" AND "));
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    /// Map vector node ids to the event each one embeds.
    pub fn events_for_vectors(&self, vector_ids: &[String]) -> Result<HashMap<String, String>> {
        if vector_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; vector_ids.len()].join(",");
        let sql = format!(
            "SELECT source_node_id, target_node_id FROM edges \
             WHERE source_node_id IN ({placeholders}) AND label = '{EDGE_LABEL_EMBEDDING_OF}'"
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(vector_ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut mapping = HashMap::new();
        for row in rows {
            let (vector_id, event_id) = row?;
            mapping.insert(vector_id, event_id);
        }
        Ok(mapping)
    }

    /// Vector node ids whose `embedding_of` edge targets one of the events.
    pub fn vector_ids_for_events(&self, event_ids: &HashSet<String>) -> Result<HashSet<String>> {
        if event_ids.is_empty() {
            return Ok(HashSet::new());
        }

        let ids: Vec<&String> = event_ids.iter().collect();
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!(
            "SELECT source_node_id FROM edges \
             WHERE target_node_id IN ({placeholders}) AND label = '{EDGE_LABEL_EMBEDDING_OF}'"
        );

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut vector_ids = HashSet::new();
        for row in rows {
            vector_ids.insert(row?);
        }
        Ok(vector_ids)
    }
}
