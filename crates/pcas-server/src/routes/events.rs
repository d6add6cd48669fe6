//! Unary and server-streaming endpoints: publish, search, subscribe.

use axum::Json;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use pcas_types::{BusError, Event};

use crate::error::Result;
use crate::state::AppState;

/// Liveness probe.
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Acknowledgement returned by publish.
#[derive(Debug, Serialize)]
pub struct PublishAck {}

/// Publish an event onto the bus.
///
/// The response event, when one is synthesised, reaches clients through
/// their subscriptions; the publish call itself only acknowledges.
pub async fn publish_handler(
    State(state): State<AppState>,
    Json(event): Json<Event>,
) -> Result<Json<PublishAck>> {
    if event.id.is_empty() {
        return Err(BusError::InvalidArgument("event id is required".to_string()).into());
    }
    if event.event_type.is_empty() {
        return Err(BusError::InvalidArgument("event type is required".to_string()).into());
    }

    state.bus.publish(event).await?;
    Ok(Json(PublishAck {}))
}

/// Semantic search request.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    /// Query text to embed and match.
    pub query_text: String,
    /// Result count; non-positive values fall back to the default.
    #[serde(default)]
    pub top_k: i64,
    /// Optional user filter.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Semantic search response: parallel arrays in recall order.
#[derive(Debug, Serialize)]
pub struct SearchResponse {
    /// Matching events.
    pub events: Vec<Event>,
    /// Similarity score per event.
    pub scores: Vec<f32>,
}

/// Semantic search over stored events.
pub async fn search_handler(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    let (events, scores) = state
        .bus
        .search(
            &request.query_text,
            request.top_k,
            request.user_id.as_deref(),
        )
        .await?;
    Ok(Json(SearchResponse { events, scores }))
}

/// Subscribe query parameters.
#[derive(Debug, Deserialize)]
pub struct SubscribeParams {
    /// Unique identifier for this client connection.
    pub client_id: String,
}

/// Server-streaming subscription as newline-delimited JSON.
///
/// The subscription guard rides inside the body stream, so client
/// disconnect tears it down and frees the identifier.
pub async fn subscribe_handler(
    State(state): State<AppState>,
    Query(params): Query<SubscribeParams>,
) -> Result<Response> {
    let subscription = state.bus.subscribe(&params.client_id)?;

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let mut line = serde_json::to_vec(&event).ok()?;
        line.push(b'\n');
        Some((Ok::<Vec<u8>, std::convert::Infallible>(line), subscription))
    });

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response())
}
