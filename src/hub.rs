//! Connection Hub
//!
//! Keeps every live connection and one broadcast channel per namespace.
//! Uses tokio::sync::broadcast for O(1) fan-out; each connection has a
//! forwarding task from its namespace channel into its outgoing queue.
//!
//! Broadcasts enter through the pub/sub store ([`Broadcaster`]) and come
//! back through [`relay`], so every node sharing the store delivers them.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::protocol::ServerFrame;
use crate::session::ConnectionRef;
use crate::store::{MessageCallback, PubSub};

/// Broadcast channel capacity per namespace
const NAMESPACE_CAPACITY: usize = 256;

/// Prefix of the store stream carrying a namespace's broadcasts
const STREAM_PREFIX: &str = "routecast";

/// Store stream for a namespace, e.g. `routecast/chat`
pub fn namespace_stream(namespace: &str) -> String {
    format!("{STREAM_PREFIX}{namespace}")
}

/// Broadcast sender of one namespace
///
/// `members` only changes under the map's entry lock, so a namespace
/// losing its last member cannot race a connection joining it.
struct NamespaceChannel {
    sender: broadcast::Sender<String>,
    members: usize,
}

impl NamespaceChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(NAMESPACE_CAPACITY);
        Self { sender, members: 0 }
    }
}

/// Hub manages all connections and namespace fan-out
pub struct Hub {
    /// All connections by id
    connections: DashMap<u64, ConnectionRef>,

    /// Namespace fan-out channels with their member counts
    namespaces: DashMap<String, NamespaceChannel>,

    /// Forwarding tasks: conn_id -> AbortHandle
    forwarders: DashMap<u64, AbortHandle>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            namespaces: DashMap::new(),
            forwarders: DashMap::new(),
        }
    }

    /// Register a connection and start forwarding its namespace broadcasts
    pub fn add_connection(&self, connection: ConnectionRef) {
        let conn_id = connection.id;

        let mut rx = {
            let mut channel = self
                .namespaces
                .entry(connection.namespace.clone())
                .or_insert_with(NamespaceChannel::new);
            channel.members += 1;
            channel.sender.subscribe()
        };
        let outgoing = connection.outgoing();
        let namespace = connection.namespace.clone();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if outgoing.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(conn_id, namespace, lagged = n, "receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        });

        self.forwarders.insert(conn_id, handle.abort_handle());
        debug!(conn_id, namespace = %connection.namespace, "connection registered");
        self.connections.insert(conn_id, connection);
    }

    /// Remove a connection; returns it if it was registered
    pub fn remove_connection(&self, conn_id: u64) -> Option<ConnectionRef> {
        if let Some((_, handle)) = self.forwarders.remove(&conn_id) {
            handle.abort();
        }

        let (_, connection) = self.connections.remove(&conn_id)?;

        if let Entry::Occupied(mut channel) = self.namespaces.entry(connection.namespace.clone()) {
            let members = &mut channel.get_mut().members;
            *members = members.saturating_sub(1);
            if *members == 0 {
                channel.remove();
                debug!(namespace = %connection.namespace, "removed empty namespace channel");
            }
        }

        debug!(conn_id, "connection removed");
        Some(connection)
    }

    pub fn connection(&self, conn_id: u64) -> Option<ConnectionRef> {
        self.connections.get(&conn_id).map(|entry| entry.value().clone())
    }

    /// Broadcast an encoded frame to every connection of a namespace
    ///
    /// Returns the number of receivers.
    pub fn broadcast(&self, namespace: &str, frame: String) -> usize {
        let Some(channel) = self.namespaces.get(namespace) else {
            debug!(namespace, "no connections for broadcast");
            return 0;
        };

        match channel.sender.send(frame) {
            Ok(n) => {
                debug!(namespace, receivers = n, "broadcast sent");
                n
            }
            Err(_) => {
                debug!(namespace, "no receivers for broadcast");
                0
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Connections currently joined to a namespace
    pub fn namespace_connection_count(&self, namespace: &str) -> usize {
        self.namespaces
            .get(namespace)
            .map(|channel| channel.members)
            .unwrap_or(0)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.connections.len())
            .field("namespaces", &self.namespaces.len())
            .finish()
    }
}

/// Broadcast as it travels through the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Broadcast {
    namespace: String,
    event: String,
    data: Value,
}

/// Emits namespace-wide events through the pub/sub store
#[derive(Clone)]
pub struct Broadcaster {
    store: Arc<dyn PubSub>,
}

impl Broadcaster {
    pub fn new(store: Arc<dyn PubSub>) -> Self {
        Self { store }
    }

    /// Publish `event` to every connection of `namespace`, on every node
    pub async fn emit(&self, namespace: &str, event: &str, data: Value) -> anyhow::Result<()> {
        let broadcast = Broadcast {
            namespace: namespace.to_string(),
            event: event.to_string(),
            data,
        };
        let payload = serde_json::to_vec(&broadcast)?;
        self.store
            .publish(&namespace_stream(namespace), &payload)
            .await?;
        debug!(namespace, event, store = self.store.kind(), "broadcast published");
        Ok(())
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("store", &self.store.kind())
            .finish()
    }
}

/// Store callback delivering published broadcasts to local connections
pub fn relay(hub: Arc<Hub>) -> MessageCallback {
    Arc::new(move |stream: String, payload: Vec<u8>| {
        let broadcast: Broadcast = match serde_json::from_slice(&payload) {
            Ok(broadcast) => broadcast,
            Err(e) => {
                warn!(stream, error = %e, "dropping undecodable broadcast");
                return;
            }
        };

        let frame = ServerFrame::Event {
            event: broadcast.event,
            data: broadcast.data,
        };
        hub.broadcast(&broadcast.namespace, frame.encode());
    })
}

/// Subscribe the namespaces' streams and run the store listener
pub async fn spawn_relay(
    hub: Arc<Hub>,
    store: Arc<dyn PubSub>,
    namespaces: &[String],
) -> anyhow::Result<JoinHandle<()>> {
    for namespace in namespaces {
        store.subscribe(&namespace_stream(namespace)).await?;
    }

    let callback = relay(hub);
    Ok(tokio::spawn(async move {
        info!(store = store.kind(), "Starting pub/sub listener");
        if let Err(e) = store.listen(callback).await {
            error!(error = %e, "Pub/sub listener error");
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Connection;
    use crate::store::MemoryPubSub;
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connection(id: u64, namespace: &str) -> (ConnectionRef, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Connection::new(id, namespace, "127.0.0.1:1".to_string(), HashMap::new(), tx);
        (Arc::new(conn), rx)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_namespace_only() {
        let hub = Hub::new();
        let (chat, mut chat_rx) = connection(1, "/chat");
        let (root, mut root_rx) = connection(2, "/");
        hub.add_connection(chat);
        hub.add_connection(root);

        assert_eq!(hub.broadcast("/chat", "hello".to_string()), 1);

        let frame = tokio::time::timeout(Duration::from_secs(1), chat_rx.recv())
            .await
            .unwrap();
        assert_eq!(frame.as_deref(), Some("hello"));
        assert!(root_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_connection() {
        let hub = Hub::new();
        let (conn, _rx) = connection(1, "/chat");
        hub.add_connection(conn);

        assert_eq!(hub.connection_count(), 1);
        assert_eq!(hub.namespace_connection_count("/chat"), 1);
        assert!(hub.connection(1).is_some());

        let removed = hub.remove_connection(1).unwrap();
        assert_eq!(removed.id, 1);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.namespace_connection_count("/chat"), 0);
        assert_eq!(hub.broadcast("/chat", "gone".to_string()), 0);
        assert!(hub.remove_connection(1).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_member_leaving_does_not_orphan_a_joiner() {
        for _ in 0..500 {
            let hub = Arc::new(Hub::new());
            let (leaving, _leaving_rx) = connection(1, "/chat");
            let (joining, mut joining_rx) = connection(2, "/chat");
            hub.add_connection(leaving);

            let remover = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.remove_connection(1) })
            };
            let adder = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.add_connection(joining) })
            };
            remover.await.unwrap();
            adder.await.unwrap();

            assert_eq!(hub.namespace_connection_count("/chat"), 1);
            hub.broadcast("/chat", "still here".to_string());
            let frame = tokio::time::timeout(Duration::from_secs(1), joining_rx.recv())
                .await
                .unwrap();
            assert_eq!(frame.as_deref(), Some("still here"));
        }
    }

    #[test]
    fn test_namespace_stream() {
        assert_eq!(namespace_stream("/"), "routecast/");
        assert_eq!(namespace_stream("/chat"), "routecast/chat");
    }

    #[tokio::test]
    async fn test_emit_through_memory_store() {
        let hub = Arc::new(Hub::new());
        let (conn, mut rx) = connection(1, "/chat");
        hub.add_connection(conn);

        let store: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
        let handle = spawn_relay(hub.clone(), store.clone(), &["/chat".to_string()])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let broadcaster = Broadcaster::new(store);
        broadcaster
            .emit("/chat", "said", json!({"text": "hi"}))
            .await
            .unwrap();
        broadcaster
            .emit("/elsewhere", "said", json!({"text": "unsubscribed"}))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            ServerFrame::decode(&frame).unwrap(),
            ServerFrame::Event {
                event: "said".to_string(),
                data: json!({"text": "hi"}),
            }
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        handle.abort();
    }

    #[test]
    fn test_relay_drops_garbage() {
        let hub = Arc::new(Hub::new());
        let callback = relay(hub);
        callback("routecast/chat".to_string(), b"not json".to_vec());
    }
}
