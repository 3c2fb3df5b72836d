//! Per-session response broadcast.
//!
//! Every subscriber gets its own bounded queue and a full copy of each
//! response published after it subscribed. Publishing waits for queue space,
//! so nothing is dropped for a subscriber that keeps reading. The wait gives
//! up once the publisher's cancellation token fires.

use super::types::Response;
use super::ResponseStream;
use futures::StreamExt;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

pub const SUBSCRIBER_QUEUE: usize = 100;

pub struct Broadcaster {
    subscribers: Mutex<Option<Vec<mpsc::Sender<Response>>>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Some(Vec::new())),
        }
    }

    /// Add a subscriber. After `close` the returned stream is already ended.
    pub fn subscribe(&self) -> ResponseStream {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = subscribers.as_mut() {
            list.push(tx);
        }
        ReceiverStream::new(rx).boxed()
    }

    /// Deliver to every current subscriber, pruning ones that went away.
    /// Returns `false` if `cancel` fired before every subscriber was served.
    pub async fn publish(&self, response: Response, cancel: &CancellationToken) -> bool {
        let targets = {
            let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            match subscribers.as_ref() {
                Some(list) => list.clone(),
                None => return true,
            }
        };

        let mut gone = Vec::new();
        let mut delivered = true;
        for tx in &targets {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    delivered = false;
                    break;
                }
                sent = tx.send(response.clone()) => {
                    if sent.is_err() {
                        gone.push(tx.clone());
                    }
                }
            }
        }

        if !gone.is_empty() {
            let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = subscribers.as_mut() {
                list.retain(|tx| !gone.iter().any(|g| g.same_channel(tx)));
            }
        }
        delivered
    }

    /// End every stream. Later subscribers get an empty stream.
    pub fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(0, Vec::len)
    }
}
