//! Connection sessions
//!
//! A connection is one physical WebSocket session joined to exactly one
//! namespace. The transport owns it; dispatch code only borrows a shared
//! handle for the duration of an event.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::protocol::ServerFrame;

/// Shared connection handle passed to listeners, filters and actions
pub type ConnectionRef = Arc<Connection>;

/// One transport session
#[derive(Debug)]
pub struct Connection {
    /// Unique connection ID (per process)
    pub id: u64,
    /// Namespace this connection joined (e.g. "/chat")
    pub namespace: String,
    /// Remote address
    pub remote_addr: String,
    /// Handshake headers (lowercased names)
    pub headers: HashMap<String, String>,
    /// Authenticated identity attached at handshake
    user: Option<Value>,
    /// Outgoing text frames for this connection
    outgoing: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(
        id: u64,
        namespace: &str,
        remote_addr: String,
        headers: HashMap<String, String>,
        outgoing: mpsc::Sender<String>,
    ) -> Self {
        Self {
            id,
            namespace: namespace.to_string(),
            remote_addr,
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            user: None,
            outgoing,
        }
    }

    /// Attach the authenticated identity resolved at handshake
    pub fn with_user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    pub fn user(&self) -> Option<&Value> {
        self.user.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.user.is_some()
    }

    /// Handshake header by name, ignoring case
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Push an event frame to this connection only
    pub async fn emit(&self, event: &str, data: Value) -> bool {
        let frame = ServerFrame::Event {
            event: event.to_string(),
            data,
        };
        self.send_frame(&frame).await
    }

    /// Queue a server frame; false once the connection is gone
    pub async fn send_frame(&self, frame: &ServerFrame) -> bool {
        if self.outgoing.send(frame.encode()).await.is_err() {
            warn!(conn_id = self.id, "connection closed, frame dropped");
            return false;
        }
        true
    }

    pub(crate) fn outgoing(&self) -> mpsc::Sender<String> {
        self.outgoing.clone()
    }
}
