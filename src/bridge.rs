//! Namespace connection manager
//!
//! Wires transport events to the dispatch core. Each namespace in the
//! kernel's registry is subscribed once; the resulting [`Namespace`]
//! handles connect, message and disconnect events for its connections.
//!
//! A routed message runs through:
//! 1. envelope parsing and route resolution
//! 2. request/response construction, reply target installed
//! 3. the framework-wide `kernel.pre_controller` event
//! 4. the pre filter chain, then the controller action in its own task
//! 5. the action's reply, then the post filter chain
//! 6. the acknowledgement, delivered exactly once
//!
//! A configured reply timeout covers steps 3 to 5 up to the reply only.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::context::{Request, Response, build_request, build_response};
use crate::events::{
    CLIENT_CONNECT, CLIENT_DISCONNECT, EventPayload, PRE_CONTROLLER, PreController, namespaced,
};
use crate::filter::{ChainOutcome, Phase};
use crate::kernel::{BoundRoute, Kernel};
use crate::protocol::{ProtocolError, error_reply, parse_envelope};
use crate::session::ConnectionRef;

/// Error code sent when an action fails before replying
pub const ACTION_FAILED: &str = "action_failed";

/// Error code sent when no reply arrives within the configured timeout
pub const REPLY_TIMEOUT: &str = "reply_timeout";

/// Error code sent when the response is gone without a reply
pub const NO_REPLY: &str = "no_reply";

type AckFn = Box<dyn FnOnce(Value) -> BoxFuture<'static, ()> + Send>;

/// Transport acknowledgement callback
///
/// Consumed by [`Ack::send`], so a reply reaches the caller at most once.
pub struct Ack(Option<AckFn>);

impl Ack {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self(Some(Box::new(move |data| f(data).boxed())))
    }

    /// The caller did not ask for a reply
    pub fn none() -> Self {
        Self(None)
    }

    /// Ack whose reply is readable from the returned receiver
    pub fn channel() -> (Self, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let ack = Self::new(move |data| async move {
            let _ = tx.send(data);
        });
        (ack, rx)
    }

    pub fn is_requested(&self) -> bool {
        self.0.is_some()
    }

    pub async fn send(self, data: Value) {
        if let Some(f) = self.0 {
            f(data).await;
        }
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ack").field(&self.is_requested()).finish()
    }
}

/// Subscribes namespaces against a booted kernel
#[derive(Debug)]
pub struct Bridge {
    kernel: Arc<Kernel>,
    subscribed: Mutex<HashSet<String>>,
}

impl Bridge {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            subscribed: Mutex::new(HashSet::new()),
        }
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Subscribe one namespace from the registry
    pub fn subscribe(&self, name: &str) -> Result<Namespace, BridgeError> {
        if !self.kernel.namespaces().iter().any(|ns| ns == name) {
            return Err(BridgeError::UnknownNamespace(name.to_string()));
        }
        if !self.subscribed.lock().insert(name.to_string()) {
            return Err(BridgeError::AlreadySubscribed(name.to_string()));
        }

        info!(namespace = name, "namespace subscribed");
        Ok(Namespace {
            name: name.to_string(),
            kernel: self.kernel.clone(),
        })
    }

    /// Subscribe every namespace not subscribed yet, in registry order
    pub fn subscribe_all(&self) -> Vec<Namespace> {
        self.kernel
            .namespaces()
            .iter()
            .filter_map(|name| self.subscribe(name).ok())
            .collect()
    }

    pub fn is_subscribed(&self, name: &str) -> bool {
        self.subscribed.lock().contains(name)
    }
}

/// Event handlers of one subscribed namespace
#[derive(Debug, Clone)]
pub struct Namespace {
    name: String,
    kernel: Arc<Kernel>,
}

impl Namespace {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn on_connect(&self, connection: ConnectionRef) {
        let event = namespaced(&self.name, CLIENT_CONNECT);
        let conn_id = connection.id;
        let report = self
            .kernel
            .events()
            .dispatch(&event, EventPayload::Connection(connection))
            .await;
        info!(conn_id, namespace = %self.name, handled = report.handled, failed = report.failed, "client connected");
    }

    pub async fn on_disconnect(&self, connection: ConnectionRef) {
        let event = namespaced(&self.name, CLIENT_DISCONNECT);
        let conn_id = connection.id;
        let report = self
            .kernel
            .events()
            .dispatch(&event, EventPayload::Connection(connection))
            .await;
        info!(conn_id, namespace = %self.name, handled = report.handled, failed = report.failed, "client disconnected");
    }

    /// Handle one inbound frame and acknowledge the outcome
    ///
    /// Protocol errors are acknowledged as error payloads. With a reply
    /// timeout configured, an exchange that has not produced a reply in
    /// time is acknowledged with a `reply_timeout` error.
    pub async fn on_message(&self, connection: ConnectionRef, event: &str, data: &str, ack: Ack) {
        let reply = self.exchange(connection, event, data).await;
        ack.send(reply).await;
    }

    async fn exchange(&self, connection: ConnectionRef, event: &str, data: &str) -> Value {
        let conn_id = connection.id;
        let (bound, params) = match self.resolve(event, data) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(conn_id, namespace = %self.name, error = %e, "rejected message");
                return e.to_reply();
            }
        };

        let route = &bound.route;
        debug!(conn_id, namespace = %self.name, route = %route.name, "dispatching");

        let request = build_request(connection, params).with_route(route.clone());
        let response = build_response();
        let reply_rx = response.install_reply();

        let settling = self.settle(bound, &request, &response, reply_rx);
        let settled = match self.kernel.reply_timeout() {
            Some(limit) => match tokio::time::timeout(limit, settling).await {
                Ok(settled) => settled,
                Err(_) => {
                    warn!(conn_id, route = %route.name, timeout_ms = limit.as_millis() as u64, "reply timed out");
                    return error_reply(
                        REPLY_TIMEOUT,
                        &format!("no reply within {}ms", limit.as_millis()),
                    );
                }
            },
            None => settling.await,
        };

        let data = match settled {
            Settled::Replied(data) => data,
            Settled::Finished(payload) => return payload,
        };

        let finished = self
            .kernel
            .filters()
            .run(&route.controller, &route.action, Phase::Post, &request, &response, || async {})
            .await;

        match finished {
            ChainOutcome::Halted(payload) => payload,
            ChainOutcome::Completed(()) => response.body().unwrap_or(data),
        }
    }

    /// Run up to the reply: pre_controller event, pre chain, action
    ///
    /// The action runs in its own task and the exchange moves on as soon as
    /// it replies; whatever the action does afterwards does not hold up the
    /// acknowledgement.
    async fn settle(
        &self,
        bound: &BoundRoute,
        request: &Request,
        response: &Response,
        mut reply_rx: oneshot::Receiver<Value>,
    ) -> Settled {
        let route = &bound.route;
        let (controller, action) = (route.controller.as_str(), route.action.as_str());

        self.kernel
            .events()
            .dispatch(
                PRE_CONTROLLER,
                EventPayload::PreController(PreController {
                    request: request.clone(),
                    response: response.clone(),
                    controller: controller.to_string(),
                    action: action.to_string(),
                }),
            )
            .await;

        let gate = self
            .kernel
            .filters()
            .run(controller, action, Phase::Pre, request, response, || async {})
            .await;
        if let ChainOutcome::Halted(payload) = gate {
            return Settled::Finished(payload);
        }

        let handler = bound.action.clone();
        let (req, res) = (request.clone(), response.clone());
        let mut task = tokio::spawn(async move { handler.call(req, res).await });

        let outcome = tokio::select! {
            biased;
            replied = &mut reply_rx => return Settled::received(replied),
            joined = &mut task => joined,
        };

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(e) => Some(format!("action aborted: {e}")),
        };
        if let Some(message) = failure {
            let conn_id = request.connection().id;
            let failure = error_reply(ACTION_FAILED, &message);
            // claim the reply so a late reply from the action is refused
            if response.reply(failure.clone()).is_ok() {
                warn!(conn_id, route = %route.name, error = %message, "action failed");
                return Settled::Finished(failure);
            }
            warn!(conn_id, route = %route.name, error = %message, "action failed after replying");
        }

        Settled::received(reply_rx.await)
    }

    fn resolve(
        &self,
        event: &str,
        data: &str,
    ) -> Result<(&BoundRoute, Map<String, Value>), ProtocolError> {
        let unrouted = || ProtocolError::UnroutedEvent {
            event: event.to_string(),
            namespace: self.name.clone(),
        };

        if !self.kernel.routes_event(&self.name, event) {
            return Err(unrouted());
        }

        let envelope = parse_envelope(data)?;
        let bound = self
            .kernel
            .bound_route(&envelope.route)
            .map_err(|_| ProtocolError::RouteNotFound(envelope.route.clone()))?;

        if bound.route.namespace != self.name {
            return Err(ProtocolError::NamespaceMismatch {
                route: envelope.route,
                namespace: self.name.clone(),
            });
        }
        if bound.route.event != event {
            return Err(unrouted());
        }

        Ok((bound, envelope.params))
    }
}

/// How an exchange got past the action
enum Settled {
    /// The action replied; post filters still run
    Replied(Value),
    /// The exchange is over with this payload
    Finished(Value),
}

impl Settled {
    fn received(reply: Result<Value, oneshot::error::RecvError>) -> Self {
        match reply {
            Ok(data) => Settled::Replied(data),
            Err(_) => Settled::Finished(error_reply(NO_REPLY, "response dropped without a reply")),
        }
    }
}

/// Subscription errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("namespace {0} is not in the registry")]
    UnknownNamespace(String),
    #[error("namespace {0} is already subscribed")]
    AlreadySubscribed(String),
}
