//! The event record and its typed data envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Timestamp, new_event_id, now};

// ─────────────────────────────────────────────────────────────────────────────
// Data Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Payload carried by an event.
///
/// The wire representation keeps a `kind`-tagged envelope for forward
/// compatibility; inside the core the variants make payload extraction total:
/// callers match instead of probing an opaque blob.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EventData {
    /// No payload.
    #[default]
    Empty,
    /// A structured JSON object.
    Structured(Map<String, Value>),
    /// Arbitrary bytes the core does not interpret.
    Raw(Vec<u8>),
}

impl EventData {
    /// Build a structured payload from a JSON value.
    ///
    /// Non-object values are wrapped under a `"value"` key so the result is
    /// always a map.
    pub fn structured(value: Value) -> Self {
        match value {
            Value::Object(map) => Self::Structured(map),
            Value::Null => Self::Empty,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                Self::Structured(map)
            }
        }
    }

    /// True when no payload is present.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Borrow the structured map, if this is a structured payload.
    pub fn as_structured(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Structured(map) => Some(map),
            _ => None,
        }
    }

    /// Take ownership of the structured map, if this is a structured payload.
    pub fn into_structured(self) -> Option<Map<String, Value>> {
        match self {
            Self::Structured(map) => Some(map),
            _ => None,
        }
    }

    /// Fetch a string field from a structured payload.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.as_structured()
            .and_then(|map| map.get(key))
            .and_then(Value::as_str)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Event
// ─────────────────────────────────────────────────────────────────────────────

/// The primary record flowing through the bus.
///
/// Identifiers are globally unique strings. A response event carries
/// `correlation_id` equal to the causing request's id and inherits its
/// `trace_id`. Payloads are immutable after persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique identifier.
    pub id: String,
    /// Dotted, versioned type name, e.g. `user.memory.v1`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Logical origin of the event.
    pub source: String,
    /// Optional human-readable subject.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Event specification version.
    pub specversion: String,
    /// Wall-clock timestamp at the publisher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<Timestamp>,
    /// Typed payload envelope.
    #[serde(default, skip_serializing_if = "EventData::is_empty")]
    pub data: EventData,
    /// Trace identifier propagated across caused events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    /// For responses, the id of the causing request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Optional tenant user identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Optional session identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Event {
    /// Create a new event with a fresh id and the current timestamp.
    pub fn new(event_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: new_event_id(),
            event_type: event_type.into(),
            source: source.into(),
            subject: None,
            specversion: "1.0".to_string(),
            time: Some(now()),
            data: EventData::Empty,
            trace_id: None,
            correlation_id: None,
            user_id: None,
            session_id: None,
        }
    }

    /// Set the subject.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Set the payload.
    pub fn with_data(mut self, data: EventData) -> Self {
        self.data = data;
        self
    }

    /// Set the trace identifier.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Set the correlation identifier.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the user identifier.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the session identifier.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fact Events
// ─────────────────────────────────────────────────────────────────────────────

/// Event types that represent facts or memories eligible for background
/// vectorisation. Response events are never vectorised.
pub const FACT_EVENT_TYPES: &[&str] = &[
    "pcas.memory.create.v1",
    "user.note.v1",
    "user.reminder.v1",
    "user.task.v1",
    "user.memory.v1",
];

/// Whether an event type belongs to the fact whitelist.
pub fn is_fact_event(event_type: &str) -> bool {
    FACT_EVENT_TYPES.contains(&event_type)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
