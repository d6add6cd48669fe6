//! Shared types for the PCAS event bus.
//!
//! This crate defines the event model that flows through the bus, the typed
//! data envelope carried by events, and the error taxonomy every other crate
//! reports through.

pub mod error;
pub mod event;

pub use error::{BusError, ErrorCode, Result};
pub use event::{Event, EventData, FACT_EVENT_TYPES, is_fact_event};

use chrono::{DateTime, Utc};

/// Timestamp type used throughout the system.
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Generate a new unique event identifier.
pub fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
