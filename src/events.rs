//! Lifecycle event dispatcher
//!
//! Listeners are registered by event name at boot. A dispatch runs every
//! listener for the name and resolves only once all of them have finished,
//! whatever their own suspension points are.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{Request, Response};
use crate::router::DEFAULT_NAMESPACE;
use crate::session::ConnectionRef;

/// Fired on a namespace when a connection joins (`<namespace>:client.connect`)
pub const CLIENT_CONNECT: &str = "client.connect";

/// Fired on a namespace when a connection leaves (`<namespace>:client.disconnect`)
pub const CLIENT_DISCONNECT: &str = "client.disconnect";

/// Fired framework-wide, unqualified, before the pre filters of every
/// routed message
pub const PRE_CONTROLLER: &str = "kernel.pre_controller";

/// Namespace-qualified event name, e.g. `/chat:client.connect`
pub fn namespaced(namespace: &str, event: &str) -> String {
    format!("{namespace}:{event}")
}

/// Payload of the pre-controller event
#[derive(Debug, Clone)]
pub struct PreController {
    pub request: Request,
    pub response: Response,
    pub controller: String,
    pub action: String,
}

#[derive(Debug, Clone)]
pub enum EventPayload {
    Connection(ConnectionRef),
    PreController(PreController),
}

/// A dispatched event
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn connection(&self) -> Option<&ConnectionRef> {
        match &self.payload {
            EventPayload::Connection(conn) => Some(conn),
            EventPayload::PreController(pre) => Some(pre.request.connection()),
        }
    }
}

#[async_trait]
pub trait Listener: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

struct ListenerFn<F>(F);

#[async_trait]
impl<F, Fut> Listener for ListenerFn<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a listener
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn Listener>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(ListenerFn(f))
}

/// Declarative listener binding (a `websocket.event` tag)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBinding {
    #[serde(default)]
    pub namespace: Option<String>,
    pub event: String,
    pub listener: String,
}

impl EventBinding {
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }
}

/// Framework-wide listener binding (a `kernel.event` tag)
///
/// The listener is registered under the bare event name, so it sees the
/// event whichever namespace fired it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerBinding {
    pub event: String,
    pub listener: String,
}

/// Outcome of one dispatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub handled: usize,
    pub failed: usize,
}

/// Event dispatcher
#[derive(Default)]
pub struct EventDispatcher {
    listeners: HashMap<String, Vec<Arc<dyn Listener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, event: &str, listener: Arc<dyn Listener>) {
        self.listeners
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.get(event).map(Vec::len).unwrap_or(0)
    }

    /// Run every listener for `name`; resolves after all have completed
    ///
    /// Listeners start in registration order and run concurrently. A
    /// failing listener is logged and counted, it does not stop the others.
    pub async fn dispatch(&self, name: &str, payload: EventPayload) -> DispatchReport {
        let Some(listeners) = self.listeners.get(name) else {
            return DispatchReport::default();
        };

        let event = Event {
            name: name.to_string(),
            payload,
        };

        let results = join_all(listeners.iter().map(|listener| listener.handle(&event))).await;

        let mut report = DispatchReport::default();
        for result in results {
            match result {
                Ok(()) => report.handled += 1,
                Err(e) => {
                    warn!(event = name, error = %e, "listener failed");
                    report.failed += 1;
                }
            }
        }

        debug!(event = name, handled = report.handled, failed = report.failed, "event dispatched");
        report
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("events", &self.listeners.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Connection;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn connection() -> ConnectionRef {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(Connection::new(3, "/ns", "127.0.0.1:1".to_string(), Default::default(), tx))
    }

    #[test]
    fn test_namespaced_names() {
        assert_eq!(namespaced("/ns", CLIENT_DISCONNECT), "/ns:client.disconnect");
        assert_eq!(namespaced("/", CLIENT_CONNECT), "/:client.connect");
    }

    #[tokio::test]
    async fn test_dispatch_without_listeners() {
        let dispatcher = EventDispatcher::new();
        let report = dispatcher
            .dispatch("/:client.connect", EventPayload::Connection(connection()))
            .await;
        assert_eq!(report, DispatchReport::default());
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_async_listener() {
        let finished = Arc::new(Mutex::new(Vec::new()));
        let mut dispatcher = EventDispatcher::new();

        let slow = finished.clone();
        dispatcher.add_listener(
            "e",
            listener_fn(move |_event| {
                let slow = slow.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    tokio::task::yield_now().await;
                    slow.lock().push("async");
                    Ok(())
                }
            }),
        );

        let quick = finished.clone();
        dispatcher.add_listener(
            "e",
            listener_fn(move |_event| {
                let quick = quick.clone();
                async move {
                    quick.lock().push("sync");
                    Ok(())
                }
            }),
        );

        let report = dispatcher
            .dispatch("e", EventPayload::Connection(connection()))
            .await;

        // both listeners signalled completion before dispatch resolved
        assert_eq!(report.handled, 2);
        assert_eq!(*finished.lock(), vec!["sync", "async"]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = EventDispatcher::new();

        dispatcher.add_listener("e", listener_fn(|_event| async { anyhow::bail!("boom") }));
        let counter = calls.clone();
        dispatcher.add_listener(
            "e",
            listener_fn(move |_event| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let report = dispatcher
            .dispatch("e", EventPayload::Connection(connection()))
            .await;

        assert_eq!(report, DispatchReport { handled: 1, failed: 1 });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listener_sees_event_payload() {
        let seen = Arc::new(Mutex::new(None));
        let mut dispatcher = EventDispatcher::new();
        let slot = seen.clone();
        dispatcher.add_listener(
            "/ns:client.connect",
            listener_fn(move |event| {
                let slot = slot.clone();
                async move {
                    let conn_id = event.connection().map(|c| c.id);
                    *slot.lock() = Some((event.name, conn_id));
                    Ok(())
                }
            }),
        );

        dispatcher
            .dispatch("/ns:client.connect", EventPayload::Connection(connection()))
            .await;

        assert_eq!(
            *seen.lock(),
            Some(("/ns:client.connect".to_string(), Some(3)))
        );
    }

    #[test]
    fn test_binding_default_namespace() {
        let binding: EventBinding =
            serde_json::from_str(r#"{"event":"client.connect","listener":"greeter"}"#).unwrap();
        assert_eq!(binding.namespace(), "/");
        assert_eq!(dispatcher_name(&binding), "/:client.connect");
    }

    fn dispatcher_name(binding: &EventBinding) -> String {
        namespaced(binding.namespace(), &binding.event)
    }
}
