//! Bidirectional streaming proxy between a client and a streaming provider.
//!
//! The proxy is transport-agnostic: it consumes [`InteractRequest`] frames
//! from a channel and emits [`InteractResponse`] frames to another. The
//! server's WebSocket handler adapts JSON text frames onto these channels.
//!
//! ```text
//! AwaitConfig ──config──▶ Routing ──ready──▶ Pumping
//!      │                     │
//!      └─ other frame        └─ no provider      → NotFound
//!         → InvalidArgument     unary provider   → FailedPrecondition
//! ```
//!
//! During pumping, byte channels are bounded: a stalled provider slows the
//! reader through channel fullness, which in turn slows the client through
//! transport flow control.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use pcas_policy::Engine;
use pcas_providers::{ProviderRegistry, StreamingComputeProvider};
use pcas_types::{BusError, ErrorCode, Result};

/// Capacity of the client→provider and provider→client byte channels.
pub const STREAM_CHANNEL_CAPACITY: usize = 10;

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Frames from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractRequest {
    /// Session negotiation; must be the first frame.
    Config {
        /// Event type used for policy routing.
        event_type: String,
        /// Opaque attributes handed to the provider.
        #[serde(default)]
        attributes: HashMap<String, String>,
    },
    /// A chunk of client input.
    Data {
        /// Payload bytes, base64 on the wire.
        #[serde(with = "b64")]
        content: Vec<u8>,
    },
    /// The client is done sending input.
    ClientEnd,
}

/// Frames from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractResponse {
    /// Negotiation succeeded; data may flow.
    Ready {
        /// Server-assigned stream identifier.
        stream_id: String,
    },
    /// A chunk of provider output.
    Data {
        /// Payload bytes, base64 on the wire.
        #[serde(with = "b64")]
        content: Vec<u8>,
    },
    /// The provider finished normally.
    ServerEnd,
    /// The stream failed after `Ready`.
    Error {
        /// Status code of the failure.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
}

/// The streaming proxy: handshake, provider lookup, bidirectional pump.
pub struct InteractProxy {
    policy: Arc<Engine>,
    registry: Arc<ProviderRegistry>,
}

impl InteractProxy {
    /// Create a proxy over the given policy and registry.
    pub fn new(policy: Arc<Engine>, registry: Arc<ProviderRegistry>) -> Self {
        Self { policy, registry }
    }

    /// Drive one interactive session to completion.
    ///
    /// Every failure is reported to the client as an
    /// [`InteractResponse::Error`] frame before the matching status is
    /// returned — the frame is the client's only status channel on a framed
    /// transport. A closed `responses` channel means the client went away
    /// and yields `Canceled` without a frame.
    pub async fn run(
        &self,
        mut requests: mpsc::Receiver<InteractRequest>,
        responses: mpsc::Sender<InteractResponse>,
    ) -> Result<()> {
        match self.negotiate(&mut requests).await {
            Ok((attributes, streaming)) => {
                self.pump(requests, responses, attributes, streaming).await
            }
            Err(err) => {
                let _ = responses
                    .send(InteractResponse::Error {
                        code: err.code(),
                        message: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    /// AwaitConfig and Routing states: validate the handshake and resolve a
    /// streaming-capable provider.
    async fn negotiate(
        &self,
        requests: &mut mpsc::Receiver<InteractRequest>,
    ) -> Result<(HashMap<String, String>, Arc<dyn StreamingComputeProvider>)> {
        let (event_type, attributes) = match requests.recv().await {
            Some(InteractRequest::Config {
                event_type,
                attributes,
            }) => {
                if event_type.is_empty() {
                    return Err(BusError::InvalidArgument(
                        "event_type cannot be empty in stream config".to_string(),
                    ));
                }
                (event_type, attributes)
            }
            Some(_) => {
                return Err(BusError::InvalidArgument(
                    "first request must be a stream config".to_string(),
                ));
            }
            None => {
                return Err(BusError::InvalidArgument(
                    "stream closed before receiving config".to_string(),
                ));
            }
        };

        let route = self
            .policy
            .select_provider_for_stream(&event_type)
            .ok_or_else(|| {
                BusError::NotFound(format!(
                    "no provider configured for event type: {event_type}"
                ))
            })?;
        debug!(event_type = %event_type, provider = %route.provider, "Stream routed");

        let handle = self.registry.get(&route.provider).ok_or_else(|| {
            BusError::Internal(format!("provider not found: {}", route.provider))
        })?;
        let streaming = handle
            .streaming()
            .ok_or_else(|| {
                BusError::FailedPrecondition(format!(
                    "selected provider '{}' does not support streaming",
                    route.provider
                ))
            })?
            .clone();

        Ok((attributes, streaming))
    }

    /// Pumping state: spawn the reader and provider tasks and forward
    /// provider output until completion, error, or client cancellation.
    async fn pump(
        &self,
        mut requests: mpsc::Receiver<InteractRequest>,
        responses: mpsc::Sender<InteractResponse>,
        attributes: HashMap<String, String>,
        streaming: Arc<dyn StreamingComputeProvider>,
    ) -> Result<()> {
        let stream_id = Uuid::new_v4().to_string();
        if responses
            .send(InteractResponse::Ready {
                stream_id: stream_id.clone(),
            })
            .await
            .is_err()
        {
            return Err(BusError::Canceled("client went away".to_string()));
        }

        // Pumping: reader and provider tasks feed the main select loop.
        let (client_tx, client_rx) = mpsc::channel::<Vec<u8>>(STREAM_CHANNEL_CAPACITY);
        let (server_tx, mut server_rx) = mpsc::channel::<Vec<u8>>(STREAM_CHANNEL_CAPACITY);
        let (err_tx, mut err_rx) = mpsc::channel::<BusError>(2);

        let reader_err = err_tx.clone();
        let reader = tokio::spawn(async move {
            loop {
                match requests.recv().await {
                    Some(InteractRequest::Data { content }) => {
                        if client_tx.send(content).await.is_err() {
                            // Provider stopped consuming input.
                            break;
                        }
                    }
                    Some(InteractRequest::ClientEnd) | None => break,
                    Some(InteractRequest::Config { .. }) => {
                        let _ = reader_err
                            .send(BusError::Internal(
                                "unexpected config frame after negotiation".to_string(),
                            ))
                            .await;
                        break;
                    }
                }
            }
            // Dropping client_tx closes the provider's input channel.
        });

        let provider_err = err_tx;
        let provider_task = tokio::spawn(async move {
            if let Err(err) = streaming.execute_stream(&attributes, client_rx, server_tx).await {
                let _ = provider_err
                    .send(BusError::from(err))
                    .await;
            }
            // Dropping server_tx (inside execute_stream) signals completion.
        });

        let mut errors_open = true;
        let result = loop {
            tokio::select! {
                chunk = server_rx.recv() => match chunk {
                    Some(content) => {
                        if responses
                            .send(InteractResponse::Data { content })
                            .await
                            .is_err()
                        {
                            break Err(BusError::Canceled("client went away".to_string()));
                        }
                    }
                    None => {
                        if responses.send(InteractResponse::ServerEnd).await.is_err() {
                            break Err(BusError::Canceled("client went away".to_string()));
                        }
                        debug!(stream_id = %stream_id, "Stream completed");
                        break Ok(());
                    }
                },
                err = err_rx.recv(), if errors_open => match err {
                    Some(err) => {
                        warn!(stream_id = %stream_id, error = %err, "Stream error");
                        let _ = responses
                            .send(InteractResponse::Error {
                                code: err.code(),
                                message: err.to_string(),
                            })
                            .await;
                        break Err(BusError::Internal(format!("stream error: {err}")));
                    }
                    None => errors_open = false,
                }
            }
        };

        reader.abort();
        provider_task.abort();
        result
    }
}
