//! WebSocket transport
//!
//! One TCP listener serves every subscribed namespace; the request path
//! picks the namespace (`ws://host/chat` joins `/chat`). Handshakes for a
//! path with no subscribed namespace are refused with 404.
//!
//! Per connection:
//! - a writer task drains the connection's outgoing queue into the socket
//! - each inbound text frame is dispatched in its own task
//! - the connect event is dispatched without holding up inbound frames
//! - closing the socket fires the namespace's disconnect event once, after
//!   the connect listeners have finished

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::info;

use crate::bridge::{Ack, Bridge, Namespace};
use crate::hub::Hub;
use crate::log::{LogSink, TracingSink};
use crate::protocol::{ServerFrame, parse_frame};
use crate::session::{Connection, ConnectionRef};

/// Outgoing frames buffered per connection
const OUTGOING_CAPACITY: usize = 256;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Resolves the authenticated user from handshake headers
///
/// Header names are lowercase.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HashMap<String, String>) -> Option<Value>;
}

/// WebSocket server over the subscribed namespaces
pub struct Server {
    namespaces: HashMap<String, Namespace>,
    hub: Arc<Hub>,
    identity: Option<Arc<dyn IdentityResolver>>,
    log: Arc<dyn LogSink>,
    next_conn_id: AtomicU64,
}

impl Server {
    /// Subscribe every namespace the bridge has not subscribed yet
    pub fn new(bridge: &Bridge, hub: Arc<Hub>) -> Self {
        let namespaces = bridge
            .subscribe_all()
            .into_iter()
            .map(|ns| (ns.name().to_string(), ns))
            .collect();

        Self {
            namespaces,
            hub,
            identity: None,
            log: Arc::new(TracingSink),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn with_identity(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(resolver);
        self
    }

    pub fn with_log_sink(mut self, log: Arc<dyn LogSink>) -> Self {
        self.log = log;
        self
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn serves(&self, namespace: &str) -> bool {
        self.namespaces.contains_key(namespace)
    }

    /// Bind `addr` and serve in a background task
    ///
    /// Returns the bound address, so `127.0.0.1:0` picks a free port.
    pub async fn bind(self: Arc<Self>, addr: &str) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local = listener.local_addr()?;

        let mut namespaces: Vec<&str> = self.namespaces.keys().map(String::as_str).collect();
        namespaces.sort_unstable();
        info!(addr = %local, namespaces = ?namespaces, "Listening for WebSocket connections");

        Ok((local, tokio::spawn(self.serve(listener))))
    }

    /// Accept loop
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        self.log.debug(&format!("set_nodelay failed for {peer}: {e}"));
                    }
                    tokio::spawn(self.clone().handle_connection(stream, peer));
                }
                Err(e) => {
                    self.log.error(&format!("accept failed: {e}"));
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let mut path = None;
        let mut headers = HashMap::new();

        let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let requested = req.uri().path();
            if !self.namespaces.contains_key(requested) {
                let mut error = ErrorResponse::new(Some(format!("unknown namespace {requested}")));
                *error.status_mut() = StatusCode::NOT_FOUND;
                return Err(error);
            }

            for (name, value) in req.headers() {
                if let Ok(value) = value.to_str() {
                    headers.insert(name.as_str().to_string(), value.to_string());
                }
            }
            path = Some(requested.to_string());
            Ok(response)
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                self.log.debug(&format!("handshake with {peer} failed: {e}"));
                return;
            }
        };

        let Some(namespace) = path.and_then(|path| self.namespaces.get(&path).cloned()) else {
            return;
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let user = self
            .identity
            .as_ref()
            .and_then(|resolver| resolver.resolve(&headers));
        let (tx, mut rx) = mpsc::channel::<String>(OUTGOING_CAPACITY);
        let mut connection = Connection::new(conn_id, namespace.name(), peer.to_string(), headers, tx);
        if let Some(user) = user {
            connection = connection.with_user(user);
        }
        let connection = Arc::new(connection);

        let (mut sink, mut inbound) = ws.split();
        let log = self.log.clone();
        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = sink.send(Message::text(text)).await {
                    log.debug(&format!("conn {conn_id}: write failed: {e}"));
                    break;
                }
            }
            let _ = sink.close().await;
        });

        self.hub.add_connection(connection.clone());
        // frames are read while connect listeners run
        let connected = {
            let (namespace, connection) = (namespace.clone(), connection.clone());
            tokio::spawn(async move { namespace.on_connect(connection).await })
        };

        while let Some(frame) = inbound.next().await {
            match frame {
                Ok(Message::Text(text)) => self.dispatch(&namespace, &connection, text.as_str()),
                Ok(Message::Binary(_)) => {
                    let connection = connection.clone();
                    tokio::spawn(async move {
                        let frame = ServerFrame::Error {
                            message: "binary frames are not supported".to_string(),
                        };
                        connection.send_frame(&frame).await;
                    });
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    self.log.debug(&format!("conn {conn_id}: read failed: {e}"));
                    break;
                }
            }
        }

        self.hub.remove_connection(conn_id);
        if let Err(e) = connected.await {
            self.log.error(&format!("conn {conn_id}: connect dispatch failed: {e}"));
        }
        namespace.on_disconnect(connection).await;
        writer.abort();
    }

    /// Decode one transport frame and run its exchange in a new task
    fn dispatch(&self, namespace: &Namespace, connection: &ConnectionRef, text: &str) {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                self.log.warn(&format!("conn {}: {e}", connection.id));
                // answer through the ack when the frame still names one
                let ack = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|value| value.get("ack")?.as_u64());
                let reply = match ack {
                    Some(ack) => ServerFrame::Ack {
                        ack,
                        data: e.to_reply(),
                    },
                    None => ServerFrame::Error {
                        message: e.to_string(),
                    },
                };
                let connection = connection.clone();
                tokio::spawn(async move {
                    connection.send_frame(&reply).await;
                });
                return;
            }
        };

        let ack = match frame.ack {
            Some(id) => {
                let connection = connection.clone();
                Ack::new(move |data| async move {
                    connection.send_frame(&ServerFrame::Ack { ack: id, data }).await;
                })
            }
            None => Ack::none(),
        };

        let namespace = namespace.clone();
        let connection = connection.clone();
        tokio::spawn(async move {
            namespace
                .on_message(connection, &frame.event, &frame.data, ack)
                .await;
        });
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .field("hub", &self.hub)
            .finish()
    }
}
