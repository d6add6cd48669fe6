//! Bidirectional interact stream over WebSocket.
//!
//! The handler adapts JSON text frames onto the bus's transport-agnostic
//! channel pair; the proxy core owns negotiation, pumping, and error
//! reporting.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use pcas_bus::{InteractRequest, InteractResponse};

use crate::state::AppState;

/// Channel depth between the socket tasks and the proxy core.
const FRAME_CHANNEL_CAPACITY: usize = 16;

/// Upgrade to a WebSocket and run an interactive session.
pub async fn interact_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_interact(socket, state))
}

async fn handle_interact(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (req_tx, req_rx) = mpsc::channel::<InteractRequest>(FRAME_CHANNEL_CAPACITY);
    let (resp_tx, mut resp_rx) = mpsc::channel::<InteractResponse>(FRAME_CHANNEL_CAPACITY);

    // Socket → proxy. Text frames carry JSON; binary frames are accepted
    // when they hold UTF-8 JSON.
    let reader = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    debug!(error = %err, "WebSocket receive error");
                    break;
                }
            };

            let text = match message {
                Message::Text(text) => text.to_string(),
                Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("Dropping non-UTF-8 binary frame");
                        continue;
                    }
                },
                Message::Close(_) => break,
                _ => continue,
            };

            match serde_json::from_str::<InteractRequest>(&text) {
                Ok(frame) => {
                    if req_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Malformed interact frame, closing stream");
                    break;
                }
            }
        }
        // Dropping req_tx signals end-of-input to the proxy.
    });

    // Proxy → socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = resp_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    if let Err(err) = state.bus.interact(req_rx, resp_tx).await {
        debug!(error = %err, "Interact session ended with error");
    }

    // The proxy dropped its response sender; the writer drains what is left
    // and closes the socket.
    let _ = writer.await;
    reader.abort();
}
