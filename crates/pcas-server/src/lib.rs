//! HTTP and WebSocket transport for the PCAS event bus.
//!
//! Exposes the four bus calls over axum:
//!
//! - `POST /v1/events` - publish, returns an acknowledgement
//! - `POST /v1/search` - semantic search
//! - `GET /v1/subscribe?client_id=…` - server-streamed events as NDJSON
//! - `GET /v1/interact` - bidirectional streaming over WebSocket
//!
//! Shutdown follows the bus contract: stop accepting connections, let
//! in-flight handlers finish, wait for background vectorisation, then close
//! storage (which persists the ANN index).

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::ServerConfig;
pub use error::{ApiError, ErrorResponse, Result};
pub use routes::{PublishAck, SearchRequest, SearchResponse};
pub use state::AppState;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use pcas_bus::EventBus;
use pcas_types::BusError;

/// The PCAS transport server.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a server over a bus.
    pub fn new(bus: Arc<EventBus>, config: ServerConfig) -> Self {
        Self {
            state: AppState::new(bus, config),
        }
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(routes::health_handler))
            .route("/v1/events", post(routes::publish_handler))
            .route("/v1/search", post(routes::search_handler))
            .route("/v1/subscribe", get(routes::subscribe_handler))
            .route("/v1/interact", get(routes::interact_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// The configured bind address.
    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }

    /// Run until interrupted (ctrl-c), then shut down gracefully.
    pub async fn run(self) -> pcas_types::Result<()> {
        self.run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Run until `shutdown` resolves, then drain and close.
    pub async fn run_until(self, shutdown: impl Future<Output = ()> + Send + 'static) -> pcas_types::Result<()> {
        let addr = self.state.config.bind_address;
        let router = self.router();

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BusError::Unavailable(format!("failed to bind {addr}: {e}")))?;
        info!(addr = %addr, "Server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| BusError::Internal(format!("server error: {e}")))?;

        info!("Listener stopped, draining background work");
        self.state.bus.shutdown().await;
        info!("Shutdown complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use pcas_bus::BusConfig;
    use pcas_policy::{Engine, Policy};
    use pcas_providers::{
        MockEmbedder, MockProvider, ProviderHandle, ProviderKind, ProviderRegistry,
        SharedEmbedder,
    };
    use pcas_storage::EventStore;

    const POLICY: &str = r#"
providers:
  - name: mock-provider
    type: mock
rules:
  - name: echo
    if:
      event_type: pcas.echo.v1
    then:
      provider: mock-provider
"#;

    fn test_server(embedder: Option<SharedEmbedder>) -> Server {
        let storage = Arc::new(EventStore::open_in_memory().unwrap());
        let policy = Arc::new(Engine::new(Policy::from_yaml(POLICY).unwrap()));
        let mut registry = ProviderRegistry::new();
        registry.register(
            "mock-provider",
            ProviderHandle::unary(
                ProviderKind::Mock,
                Arc::new(MockProvider::new("mock-provider")),
            ),
        );
        let bus = Arc::new(EventBus::new(
            storage,
            policy,
            Arc::new(registry),
            embedder,
            BusConfig::default(),
        ));
        Server::new(bus, ServerConfig::new())
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = test_server(None).router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_publish_acknowledges() {
        let app = test_server(None).router();
        let event = json!({
            "id": "e1",
            "type": "pcas.echo.v1",
            "source": "test",
            "specversion": "1.0",
            "data": {"kind": "structured", "value": {"message": "Hello"}}
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/events")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(event.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_publish_rejects_missing_id() {
        let app = test_server(None).router();
        let event = json!({
            "id": "",
            "type": "pcas.echo.v1",
            "source": "test",
            "specversion": "1.0"
        });

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/events")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(event.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn test_search_without_embedder_is_precondition_failure() {
        let app = test_server(None).router();
        let request = json!({"query_text": "anything", "top_k": 3});

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/search")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "failed_precondition");
    }

    #[tokio::test]
    async fn test_search_roundtrip_with_embedder() {
        let embedder: SharedEmbedder = Arc::new(MockEmbedder::new(8));
        let server = test_server(Some(Arc::clone(&embedder)));

        // Seed one searchable event directly through the bus storage.
        let vector = embedder.embed("the stored fact").await.unwrap();
        let mut event = pcas_types::Event::new("user.memory.v1", "test")
            .with_subject("the stored fact");
        event.id = "fact-1".to_string();
        server
            .state
            .bus
            .storage()
            .store_event(&event, Some(&vector))
            .unwrap();

        let request = json!({"query_text": "the stored fact", "top_k": 1});
        let response = server
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/search")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(request.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["events"][0]["id"], "fact-1");
        assert!(body["scores"][0].as_f64().unwrap() >= 0.99);
    }

    #[tokio::test]
    async fn test_subscribe_requires_client_id() {
        let app = test_server(None).router();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/subscribe")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        // Missing query parameter fails extraction.
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
