//! Per-session WebSocket fan-out.
//!
//! Each created session gets a pump task that drains the runtime's response
//! stream and hands every frame, serialized once, to the connections
//! registered for that session at that moment. Delivery is fire-and-forget:
//! a connection whose queue is full misses the frame. Late joiners see only
//! what is emitted after they register.

use super::types::{PromptRequest, WsMessage};
use super::AppState;
use crate::runtime::ResponseStream;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-connection send queue.
const CONNECTION_QUEUE: usize = 64;

type Connection = (u64, mpsc::Sender<String>);

#[derive(Default)]
pub struct WsHub {
    next_id: AtomicU64,
    connections: Mutex<HashMap<String, Vec<Connection>>>,
}

impl WsHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; frames for `session_id` arrive on the receiver.
    pub fn register(&self, session_id: &str) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(session_id.to_string())
            .or_default()
            .push((conn_id, tx));
        info!(session = %session_id, conn_id, "WebSocket connected");
        (conn_id, rx)
    }

    pub fn unregister(&self, session_id: &str, conn_id: u64) {
        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(conns) = connections.get_mut(session_id) {
            conns.retain(|(id, _)| *id != conn_id);
            if conns.is_empty() {
                connections.remove(session_id);
            }
        }
        info!(session = %session_id, conn_id, "WebSocket disconnected");
    }

    pub fn connection_count(&self, session_id: &str) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// Serialize once and offer to every current connection. Returns how
    /// many accepted the frame.
    pub fn broadcast(&self, session_id: &str, message: &WsMessage) -> usize {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Failed to serialize frame");
                return 0;
            }
        };

        let targets: Vec<Connection> = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for (conn_id, tx) in targets {
            match tx.try_send(text.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(session = %session_id, conn_id, "Connection queue full, frame dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}

/// Republish a session's responses to its WebSocket observers until the
/// stream ends.
pub fn spawn_pump(hub: Arc<WsHub>, session_id: String, mut stream: ResponseStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(response) = stream.next().await {
            hub.broadcast(&session_id, &WsMessage::from(&response));
        }
        debug!(session = %session_id, "Response pump finished");
    })
}

/// GET /sessions/{id}/ws
pub async fn ws_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let (mut sender, mut receiver) = socket.split();
    let (conn_id, mut frames) = state.hub.register(&session_id);

    let writer = tokio::spawn(async move {
        while let Some(text) = frames.recv().await {
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => handle_frame(&state, &session_id, text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session = %session_id, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    state.hub.unregister(&session_id, conn_id);
    writer.abort();
}

async fn handle_frame(state: &AppState, session_id: &str, text: &str) {
    let request: PromptRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(session = %session_id, error = %e, "Ignoring malformed frame");
            return;
        }
    };
    if request.prompt.is_empty() {
        return;
    }

    let result = match state.registry.active() {
        Ok(runtime) => runtime.send_prompt(session_id, &request.prompt).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(session = %session_id, error = %e, "Prompt from WebSocket failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Response as RuntimeResponse;

    #[test]
    fn test_broadcast_reaches_current_connections_only() {
        let hub = WsHub::new();
        let (a, mut rx_a) = hub.register("gt-r1-w1");
        let (_b, mut rx_b) = hub.register("gt-r1-w1");
        let (_c, mut rx_other) = hub.register("gt-r1-w2");
        assert_eq!(hub.connection_count("gt-r1-w1"), 2);

        let delivered = hub.broadcast("gt-r1-w1", &WsMessage::from(&RuntimeResponse::text("hi")));
        assert_eq!(delivered, 2);
        let frame_a = rx_a.try_recv().unwrap();
        assert_eq!(frame_a, rx_b.try_recv().unwrap());
        assert!(rx_other.try_recv().is_err());

        hub.unregister("gt-r1-w1", a);
        assert_eq!(hub.connection_count("gt-r1-w1"), 1);
        hub.broadcast("gt-r1-w1", &WsMessage::from(&RuntimeResponse::complete()));
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let hub = WsHub::new();
        let (_id, _rx) = hub.register("hq-mayor");
        let frame = WsMessage::from(&RuntimeResponse::text("x"));
        for _ in 0..CONNECTION_QUEUE {
            assert_eq!(hub.broadcast("hq-mayor", &frame), 1);
        }
        assert_eq!(hub.broadcast("hq-mayor", &frame), 0);
    }

    #[test]
    fn test_unregister_last_connection_clears_entry() {
        let hub = WsHub::new();
        let (id, _rx) = hub.register("hq-deacon");
        hub.unregister("hq-deacon", id);
        assert_eq!(hub.connection_count("hq-deacon"), 0);
        assert!(hub.connections.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pump_forwards_until_stream_ends() {
        let hub = Arc::new(WsHub::new());
        let (_id, mut rx) = hub.register("gt-r1-w1");
        let stream = futures::stream::iter(vec![RuntimeResponse::text("one"), RuntimeResponse::complete()]).boxed();

        spawn_pump(Arc::clone(&hub), "gt-r1-w1".to_string(), stream).await.unwrap();

        let first: WsMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.content.as_deref(), Some("one"));
        let second: WsMessage = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second.kind, "complete");
    }
}
