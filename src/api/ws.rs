//! WebSocket event stream for connected dashboards.
//!
//! A single broadcast channel fans frames out to every connected client.
//! Producers (trigger engine, watchdog) never block: a slow client only
//! lags its own receiver.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt as _, StreamExt as _};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Frames buffered per client before it starts lagging.
const FRAME_CAPACITY: usize = 256;

/// Fan-out handle for pushing `{type, payload}` frames to every connected
/// dashboard. Cheap to clone.
#[derive(Clone)]
pub struct Broadcaster {
    frames: broadcast::Sender<String>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            frames: broadcast::channel(FRAME_CAPACITY).0,
        }
    }

    /// Push one event frame to all connected clients.
    pub fn broadcast(&self, event: &str, payload: serde_json::Value) {
        let frame = json!({ "type": event, "payload": payload }).to_string();
        let _ = self.frames.send(frame);
    }

    /// Subscribe to the raw frame stream. Used by the socket handler and by
    /// tests asserting on broadcast traffic.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.frames.subscribe()
    }

    /// Number of connected receivers.
    pub fn receiver_count(&self) -> usize {
        self.frames.receiver_count()
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<crate::api::ApiState>>,
) -> impl IntoResponse {
    let broadcaster = state.broadcaster.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, broadcaster))
}

/// Forward broadcast frames to one client until either side drops.
async fn handle_socket(socket: WebSocket, broadcaster: Broadcaster) {
    let (mut sender, mut receiver) = socket.split();
    let mut frames = broadcaster.subscribe();

    let mut send_task = tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "websocket client lagged; frames dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Inbound traffic is ignored; the stream is one-way. Draining keeps
    // ping/pong alive and detects the client going away.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if let Message::Close(_) = message {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }
}
