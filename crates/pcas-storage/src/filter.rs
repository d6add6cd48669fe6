//! Event-level filtering for similarity queries.

use std::collections::HashMap;

use pcas_types::Timestamp;

/// Restricts which events a similarity query may return.
///
/// All conditions are AND-combined. Filtering happens at the event level;
/// the ANN index itself is not filter-aware, so filtered searches over-fetch
/// and post-filter.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Only events with this user identifier.
    pub user_id: Option<String>,
    /// Only events with this session identifier.
    pub session_id: Option<String>,
    /// Only events whose type is in this set (empty = any type).
    pub event_types: Vec<String>,
    /// Inclusive lower bound on the event timestamp.
    pub time_from: Option<Timestamp>,
    /// Inclusive upper bound on the event timestamp.
    pub time_to: Option<Timestamp>,
    /// Equality conditions over structured payload keys.
    pub attributes: HashMap<String, String>,
}

impl EventFilter {
    /// An empty filter that matches every event.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to a user identifier.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Restrict to a session identifier.
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Restrict to a set of event types.
    pub fn with_event_types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to events at or after the given instant.
    pub fn with_time_from(mut self, from: Timestamp) -> Self {
        self.time_from = Some(from);
        self
    }

    /// Restrict to events at or before the given instant.
    pub fn with_time_to(mut self, to: Timestamp) -> Self {
        self.time_to = Some(to);
        self
    }

    /// Require a structured payload key to equal a value.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// True when no condition is set.
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.session_id.is_none()
            && self.event_types.is_empty()
            && self.time_from.is_none()
            && self.time_to.is_none()
            && self.attributes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter() {
        assert!(EventFilter::new().is_empty());
        assert!(!EventFilter::new().with_user_id("alice").is_empty());
        assert!(!EventFilter::new().with_attribute("course", "rust").is_empty());
    }
}
