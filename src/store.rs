//! Pub/sub store selection and backends
//!
//! The store carries namespace broadcasts between processes. Which backend
//! runs is a configuration-time decision:
//!
//! - `postgres` - PostgreSQL LISTEN/NOTIFY over three connections
//!   (publish, subscribe, command) for multi-node deployments
//! - `memory` - in-process broadcast for single-node/development
//!
//! Any other type is reported as unspecified and the server falls back to
//! the in-process store.

mod memory;
mod postgres;

pub use memory::MemoryPubSub;
pub use postgres::PostgresPubSub;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Callback invoked for each message received on a subscribed stream
pub type MessageCallback = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Transport for namespace broadcasts between server processes
///
/// Streams are opaque names; the hub uses one stream per namespace.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, stream: &str, payload: &[u8]) -> anyhow::Result<()>;

    /// Start delivering `stream` to the listener
    async fn subscribe(&self, stream: &str) -> anyhow::Result<()>;

    async fn unsubscribe(&self, stream: &str) -> anyhow::Result<()>;

    /// Deliver every message on a subscribed stream to `callback`
    ///
    /// Runs until the backend shuts down; callers spawn it.
    async fn listen(&self, callback: MessageCallback) -> anyhow::Result<()>;

    /// Backend name for logs
    fn kind(&self) -> &'static str;
}

/// Store section of the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreOptions {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_kind() -> String {
    "memory".to_string()
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            url: None,
        }
    }
}

/// Outcome of store selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSelection {
    /// Distributed store reachable at `url`
    Distributed { url: String },
    /// In-process store; nothing to configure
    InProcess,
    /// Unrecognized store type
    Unspecified(String),
}

/// Decide which store the options describe
pub fn select_store(options: &StoreOptions) -> Result<StoreSelection, StoreError> {
    match options.kind.as_str() {
        "postgres" | "postgresql" => match options.url {
            Some(ref url) if !url.is_empty() => Ok(StoreSelection::Distributed { url: url.clone() }),
            _ => Err(StoreError::MissingUrl(options.kind.clone())),
        },
        "memory" => Ok(StoreSelection::InProcess),
        other => Ok(StoreSelection::Unspecified(other.to_string())),
    }
}

/// Build the backend for a selection
pub async fn connect_store(selection: &StoreSelection) -> anyhow::Result<Arc<dyn PubSub>> {
    match selection {
        StoreSelection::Distributed { url } => {
            let store = PostgresPubSub::connect(url).await?;
            info!(store = "postgres", "Broadcast store connected");
            Ok(Arc::new(store))
        }
        StoreSelection::InProcess => {
            info!(store = "memory", "Broadcast store ready (single node)");
            Ok(Arc::new(MemoryPubSub::new()))
        }
        StoreSelection::Unspecified(kind) => {
            warn!(store = %kind, "unsupported store type, falling back to memory pub/sub");
            Ok(Arc::new(MemoryPubSub::new()))
        }
    }
}

/// Store selection errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store type {0} requires a url")]
    MissingUrl(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(kind: &str, url: Option<&str>) -> StoreOptions {
        StoreOptions {
            kind: kind.to_string(),
            url: url.map(str::to_string),
        }
    }

    #[test]
    fn test_select_memory() {
        assert_eq!(
            select_store(&StoreOptions::default()),
            Ok(StoreSelection::InProcess)
        );
    }

    #[test]
    fn test_select_postgres() {
        assert_eq!(
            select_store(&options("postgres", Some("postgres://localhost/app"))),
            Ok(StoreSelection::Distributed {
                url: "postgres://localhost/app".to_string()
            })
        );
    }

    #[test]
    fn test_select_postgres_without_url() {
        assert_eq!(
            select_store(&options("postgres", None)),
            Err(StoreError::MissingUrl("postgres".to_string()))
        );
    }

    #[test]
    fn test_select_unknown_type() {
        assert_eq!(
            select_store(&options("redis", None)),
            Ok(StoreSelection::Unspecified("redis".to_string()))
        );
    }

    #[test]
    fn test_options_from_json() {
        let parsed: StoreOptions = serde_json::from_str(r#"{"type":"postgres","url":"u"}"#).unwrap();
        assert_eq!(parsed, options("postgres", Some("u")));

        let parsed: StoreOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, StoreOptions::default());
    }

    #[tokio::test]
    async fn test_unspecified_falls_back_to_memory() {
        let store = connect_store(&StoreSelection::Unspecified("redis".to_string()))
            .await
            .unwrap();
        assert_eq!(store.kind(), "memory");
    }
}
