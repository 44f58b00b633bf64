//! Per-call request and response contexts
//!
//! Both are built fresh for every inbound message and dropped once the
//! exchange is acknowledged. They are cheap to clone; clones share state.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::router::Route;
use crate::session::ConnectionRef;

/// Parameter map shared between the `query` and `body` views of a request
///
/// Append-only: existing keys are never overwritten, so the aliasing
/// between both views cannot surprise a later reader.
#[derive(Debug, Clone, Default)]
pub struct Params(Arc<RwLock<Map<String, Value>>>);

impl Params {
    pub fn new(map: Map<String, Value>) -> Self {
        Self(Arc::new(RwLock::new(map)))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.0.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.read().contains_key(key)
    }

    /// Add a parameter; returns false if the key already exists
    pub fn insert(&self, key: &str, value: Value) -> bool {
        let mut map = self.0.write();
        if map.contains_key(key) {
            return false;
        }
        map.insert(key.to_string(), value);
        true
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    /// Copy of the current parameters
    pub fn to_map(&self) -> Map<String, Value> {
        self.0.read().clone()
    }

    /// Whether both handles point at the same underlying map
    pub fn ptr_eq(&self, other: &Params) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Request context handed to filters, listeners and actions
#[derive(Debug, Clone)]
pub struct Request {
    connection: ConnectionRef,
    query: Params,
    body: Params,
    user: Option<Value>,
    route: Option<Arc<Route>>,
}

impl Request {
    pub fn connection(&self) -> &ConnectionRef {
        &self.connection
    }

    pub fn query(&self) -> &Params {
        &self.query
    }

    pub fn body(&self) -> &Params {
        &self.body
    }

    pub fn user(&self) -> Option<&Value> {
        self.user.as_ref()
    }

    /// Route that resolved this request
    pub fn route(&self) -> Option<&Route> {
        self.route.as_deref()
    }

    pub fn with_route(mut self, route: Arc<Route>) -> Self {
        self.route = Some(route);
        self
    }
}

/// Build a request from a connection and the message parameters
///
/// `query` and `body` share one parameter map; the connection's
/// authenticated user, if any, is attached.
pub fn build_request(connection: ConnectionRef, params: Map<String, Value>) -> Request {
    let params = Params::new(params);
    let user = connection.user().cloned();

    Request {
        connection,
        query: params.clone(),
        body: params,
        user,
        route: None,
    }
}

/// Response context
///
/// Holds the outgoing body and exposes one terminal operation,
/// [`Response::reply`]. The reply target is installed by the dispatcher,
/// not by [`build_response`].
#[derive(Debug, Clone, Default)]
pub struct Response {
    inner: Arc<ResponseInner>,
}

#[derive(Debug, Default)]
struct ResponseInner {
    body: Mutex<Option<Value>>,
    reply_tx: Mutex<Option<oneshot::Sender<Value>>>,
    state: Mutex<ReplyState>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    #[default]
    Bare,
    Installed,
    Replied,
}

impl Response {
    /// Install the reply target; the receiver yields the replied data
    pub fn install_reply(&self) -> oneshot::Receiver<Value> {
        let (tx, rx) = oneshot::channel();
        *self.inner.reply_tx.lock() = Some(tx);
        *self.inner.state.lock() = ReplyState::Installed;
        rx
    }

    /// Finalize the exchange with `data`
    ///
    /// Post filters run and the caller is acknowledged after this returns.
    /// Only the first call succeeds.
    pub fn reply(&self, data: Value) -> Result<(), ReplyError> {
        let mut state = self.inner.state.lock();
        match *state {
            ReplyState::Bare => return Err(ReplyError::NotInstalled),
            ReplyState::Replied => return Err(ReplyError::AlreadyReplied),
            ReplyState::Installed => {}
        }
        *state = ReplyState::Replied;
        drop(state);

        *self.inner.body.lock() = Some(data.clone());
        if let Some(tx) = self.inner.reply_tx.lock().take() {
            // receiver gone means the exchange was already finalized
            let _ = tx.send(data);
        }
        Ok(())
    }

    pub fn is_replied(&self) -> bool {
        *self.inner.state.lock() == ReplyState::Replied
    }

    /// Current outgoing body
    pub fn body(&self) -> Option<Value> {
        self.inner.body.lock().clone()
    }

    /// Rewrite the outgoing body (post filters)
    pub fn set_body(&self, body: Value) {
        *self.inner.body.lock() = Some(body);
    }
}

/// Build a bare response
pub fn build_response() -> Response {
    Response::default()
}

/// Reply errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    #[error("response has no reply target installed")]
    NotInstalled,
    #[error("response already replied")]
    AlreadyReplied,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Connection;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::mpsc;

    fn connection(user: Option<Value>) -> ConnectionRef {
        let (tx, _rx) = mpsc::channel(1);
        let conn = Connection::new(7, "/", "127.0.0.1:1".to_string(), HashMap::new(), tx);
        Arc::new(match user {
            Some(user) => conn.with_user(user),
            None => conn,
        })
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_query_and_body_share_one_map() {
        let request = build_request(connection(None), params(json!({"a": 1})));

        assert!(request.query().ptr_eq(request.body()));
        assert_eq!(request.body().get("a"), Some(json!(1)));

        assert!(!request.body().contains("b"));
        assert!(request.query().insert("b", json!(2)));
        assert!(request.body().contains("b"));
        assert_eq!(request.body().get("b"), Some(json!(2)));
    }

    #[test]
    fn test_params_are_append_only() {
        let request = build_request(connection(None), params(json!({"a": 1})));

        assert!(!request.body().insert("a", json!(99)));
        assert_eq!(request.query().get("a"), Some(json!(1)));
        assert_eq!(request.query().len(), 1);
    }

    #[test]
    fn test_user_attached_from_connection() {
        let request = build_request(connection(Some(json!({"id": 5}))), Map::new());
        assert_eq!(request.user().unwrap()["id"], 5);

        let anonymous = build_request(connection(None), Map::new());
        assert!(anonymous.user().is_none());
    }

    #[test]
    fn test_route_metadata() {
        let route = Arc::new(Route::new("echo", "EchoController", "handle"));
        let request = build_request(connection(None), Map::new()).with_route(route);
        assert_eq!(request.route().unwrap().name, "echo");
    }

    #[test]
    fn test_bare_response_cannot_reply() {
        let response = build_response();
        assert_eq!(response.reply(json!(1)), Err(ReplyError::NotInstalled));
        assert!(!response.is_replied());
    }

    #[tokio::test]
    async fn test_reply_delivers_once() {
        let response = build_response();
        let rx = response.install_reply();

        response.reply(json!({"y": 2})).unwrap();
        assert_eq!(response.reply(json!({"y": 3})), Err(ReplyError::AlreadyReplied));

        assert_eq!(rx.await.unwrap(), json!({"y": 2}));
        assert_eq!(response.body(), Some(json!({"y": 2})));
        assert!(response.is_replied());
    }

    #[test]
    fn test_clones_share_reply_state() {
        let response = build_response();
        let _rx = response.install_reply();
        let clone = response.clone();

        clone.reply(json!("done")).unwrap();
        assert!(response.is_replied());

        response.set_body(json!("rewritten"));
        assert_eq!(clone.body(), Some(json!("rewritten")));
    }
}
