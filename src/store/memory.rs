//! In-process store
//!
//! Broadcasts never leave the process, so every node has its own
//! namespace fan-out. Suitable for a single server or for tests.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::warn;

use super::{MessageCallback, PubSub};

/// Published messages kept for a listener that falls behind
const DEFAULT_BUFFER_SIZE: usize = 1024;

#[derive(Debug, Clone)]
struct Delivery {
    stream: String,
    payload: Vec<u8>,
}

/// Store backed by a single `tokio::sync::broadcast` channel
///
/// A listener that falls more than the buffer size behind skips the
/// missed broadcasts and keeps going.
pub struct MemoryPubSub {
    deliveries: broadcast::Sender<Delivery>,
    streams: RwLock<HashSet<String>>,
    buffer_size: usize,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (deliveries, _) = broadcast::channel(buffer_size);
        Self {
            deliveries,
            streams: RwLock::new(HashSet::new()),
            buffer_size,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn is_subscribed(&self, stream: &str) -> bool {
        self.streams.read().contains(stream)
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryPubSub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPubSub")
            .field("streams", &*self.streams.read())
            .field("buffer_size", &self.buffer_size)
            .finish()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, stream: &str, payload: &[u8]) -> anyhow::Result<()> {
        // no listener yet means nobody to deliver to
        let _ = self.deliveries.send(Delivery {
            stream: stream.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn subscribe(&self, stream: &str) -> anyhow::Result<()> {
        self.streams.write().insert(stream.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, stream: &str) -> anyhow::Result<()> {
        self.streams.write().remove(stream);
        Ok(())
    }

    async fn listen(&self, callback: MessageCallback) -> anyhow::Result<()> {
        let mut rx = self.deliveries.subscribe();

        loop {
            match rx.recv().await {
                Ok(delivery) if self.is_subscribed(&delivery.stream) => {
                    callback(delivery.stream, delivery.payload);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "in-process store listener fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn collector() -> (MessageCallback, Arc<Mutex<Vec<(String, Vec<u8>)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: MessageCallback = Arc::new(move |stream, payload| {
            sink.lock().push((stream, payload));
        });
        (callback, seen)
    }

    #[tokio::test]
    async fn test_only_subscribed_streams_are_delivered() {
        let store = Arc::new(MemoryPubSub::new());
        store.subscribe("routecast/chat").await.unwrap();

        let (callback, seen) = collector();
        let listener = store.clone();
        let handle = tokio::spawn(async move { listener.listen(callback).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.publish("routecast/chat", b"one").await.unwrap();
        store.publish("routecast/lobby", b"elsewhere").await.unwrap();
        store.publish("routecast/chat", b"two").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            *seen.lock(),
            vec![
                ("routecast/chat".to_string(), b"one".to_vec()),
                ("routecast/chat".to_string(), b"two".to_vec()),
            ]
        );
        handle.abort();
    }

    #[tokio::test]
    async fn test_unsubscribed_stream_goes_quiet() {
        let store = Arc::new(MemoryPubSub::new());
        store.subscribe("routecast/").await.unwrap();
        assert!(store.is_subscribed("routecast/"));

        store.unsubscribe("routecast/").await.unwrap();
        assert!(!store.is_subscribed("routecast/"));

        let (callback, seen) = collector();
        let listener = store.clone();
        let handle = tokio::spawn(async move { listener.listen(callback).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.publish("routecast/", b"dropped").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().is_empty());
        handle.abort();
    }

    #[tokio::test]
    async fn test_publish_without_listener_succeeds() {
        let store = MemoryPubSub::with_buffer_size(4);
        assert_eq!(store.buffer_size(), 4);
        assert!(store.publish("routecast/", b"nobody").await.is_ok());
        assert_eq!(store.kind(), "memory");
    }
}
