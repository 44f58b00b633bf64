//! WebSocket client for routecast servers
//!
//! Joins one namespace and sends routed requests over it. A background
//! handler owns the socket; requests are correlated with their
//! acknowledgements by ack id, server-pushed events are queued for
//! [`Client::next_event`].

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

use crate::protocol::{Envelope, ServerFrame, reply_error_code};
use crate::router::{DEFAULT_EVENT, DEFAULT_NAMESPACE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default time to wait for an acknowledgement
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-pushed events buffered before [`Client::next_event`] reads them
const EVENT_CAPACITY: usize = 256;

/// A server-pushed event
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    pub event: String,
    pub data: Value,
}

/// Frame queued for the handler
struct Outbound {
    event: String,
    data: String,
    reply_tx: Option<oneshot::Sender<Value>>,
}

/// Connection to one namespace
pub struct Client {
    namespace: String,
    cmd_tx: mpsc::Sender<Outbound>,
    events: Mutex<mpsc::Receiver<ServerEvent>>,
    request_timeout: Duration,
    _handler: JoinHandle<()>,
}

impl Client {
    /// Connect to `namespace` (default `/`) on a server at `base_url`
    ///
    /// # Example
    /// ```ignore
    /// let client = Client::connect("ws://127.0.0.1:3000", Some("/chat")).await?;
    /// let reply = client.request("chat.say", json!({"text": "hi"})).await?;
    /// ```
    pub async fn connect(base_url: &str, namespace: Option<&str>) -> Result<Self, ClientError> {
        let namespace = namespace.unwrap_or(DEFAULT_NAMESPACE).to_string();
        let url = format!("{}{}", base_url.trim_end_matches('/'), namespace);

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|source| ClientError::Connect {
                url: url.clone(),
                source: Box::new(source),
            })?;
        debug!(url, "connected");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let handler = tokio::spawn(handler_loop(ws, cmd_rx, events_tx));

        Ok(Self {
            namespace,
            cmd_tx,
            events: Mutex::new(events_rx),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            _handler: handler,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Invoke `route` with `params` and wait for the acknowledged reply
    ///
    /// Error replies (`{"error": {"code", "message"}}`) come back as
    /// [`ClientError::Rejected`].
    pub async fn request(&self, route: &str, params: Value) -> Result<Value, ClientError> {
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => return Err(ClientError::InvalidParams(other)),
        };
        let envelope = Envelope::new(route, params).to_json();

        let reply = self.send_with_ack(DEFAULT_EVENT, envelope, route).await?;
        if let Some(code) = reply_error_code(&reply) {
            return Err(ClientError::Rejected {
                code: code.to_string(),
                message: reply["error"]["message"].as_str().unwrap_or_default().to_string(),
            });
        }
        Ok(reply)
    }

    /// Send raw frame data on `event` and wait for the acknowledgement
    pub async fn send_with_ack(
        &self,
        event: &str,
        data: String,
        context: &str,
    ) -> Result<Value, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Outbound {
                event: event.to_string(),
                data,
                reply_tx: Some(tx),
            })
            .await
            .map_err(|_| ClientError::Closed)?;

        tokio::time::timeout(self.request_timeout, rx)
            .await
            .map_err(|_| ClientError::Timeout {
                timeout_ms: self.request_timeout.as_millis() as u64,
                context: context.to_string(),
            })?
            .map_err(|_| ClientError::Closed)
    }

    /// Send raw frame data on `event` without asking for a reply
    pub async fn emit(&self, event: &str, data: String) -> Result<(), ClientError> {
        self.cmd_tx
            .send(Outbound {
                event: event.to_string(),
                data,
                reply_tx: None,
            })
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Next server-pushed event; `None` once the connection is closed
    pub async fn next_event(&self) -> Option<ServerEvent> {
        self.events.lock().await.recv().await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("namespace", &self.namespace)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Acknowledgements still awaited, by ack id
///
/// Requests that timed out drop their receiver; their entries are pruned
/// whenever a new request is registered.
#[derive(Default)]
struct PendingAcks {
    next_id: u64,
    waiting: HashMap<u64, oneshot::Sender<Value>>,
}

impl PendingAcks {
    fn register(&mut self, reply_tx: oneshot::Sender<Value>) -> u64 {
        self.waiting.retain(|_, tx| !tx.is_closed());
        self.next_id += 1;
        self.waiting.insert(self.next_id, reply_tx);
        self.next_id
    }

    fn resolve(&mut self, ack: u64, data: Value) {
        if let Some(tx) = self.waiting.remove(&ack) {
            let _ = tx.send(data);
        }
    }

    fn len(&self) -> usize {
        self.waiting.len()
    }
}

async fn handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<Outbound>,
    events_tx: mpsc::Sender<ServerEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending = PendingAcks::default();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let mut frame = json!({ "event": cmd.event, "data": cmd.data });
                if let Some(reply_tx) = cmd.reply_tx {
                    frame["ack"] = json!(pending.register(reply_tx));
                    trace!(waiting = pending.len(), "ack registered");
                }
                if ws_tx.send(Message::text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                match ServerFrame::decode(text.as_str()) {
                    Ok(ServerFrame::Ack { ack, data }) => pending.resolve(ack, data),
                    Ok(ServerFrame::Event { event, data }) => {
                        if events_tx.send(ServerEvent { event, data }).await.is_err() {
                            debug!("event receiver dropped");
                        }
                    }
                    Ok(ServerFrame::Error { message }) => {
                        warn!(message, "server reported a transport error");
                    }
                    Err(e) => warn!(error = %e, "undecodable server frame"),
                }
            }
        }
    }

    let _ = ws_tx.close().await;
}

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },
    #[error("connection closed")]
    Closed,
    #[error("no reply for {context} within {timeout_ms}ms")]
    Timeout { timeout_ms: u64, context: String },
    #[error("request rejected ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("params must be a JSON object, got {0}")]
    InvalidParams(Value),
}

impl ClientError {
    /// HTTP status of a refused handshake
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ClientError::Connect { source, .. } => match &**source {
                tungstenite::Error::Http(response) => Some(response.status().as_u16()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Error code of a rejected request
    pub fn code(&self) -> Option<&str> {
        match self {
            ClientError::Rejected { code, .. } => Some(code),
            _ => None,
        }
    }
}
