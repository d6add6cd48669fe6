//! HTTP and WebSocket route handlers.

mod events;
mod interact;

pub use events::{
    PublishAck, SearchRequest, SearchResponse, health_handler, publish_handler, search_handler,
    subscribe_handler,
};
pub use interact::interact_handler;
