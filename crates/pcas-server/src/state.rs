//! Application state shared across handlers.

use std::sync::Arc;

use pcas_bus::EventBus;

use crate::config::ServerConfig;

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// The event bus core.
    pub bus: Arc<EventBus>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Create application state over a bus.
    pub fn new(bus: Arc<EventBus>, config: ServerConfig) -> Self {
        Self {
            bus,
            config: Arc::new(config),
        }
    }
}
