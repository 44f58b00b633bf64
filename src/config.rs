//! routecast configuration
//!
//! Configuration comes from:
//! 1. A JSON file (`--config`), or built-in defaults
//! 2. Environment overrides (ROUTECAST_LISTEN, ROUTECAST_STORE,
//!    ROUTECAST_DATABASE_URL, ROUTECAST_REPLY_TIMEOUT_MS)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::events::{EventBinding, ListenerBinding};
use crate::filter::FilterChainConfig;
use crate::router::Route;
use crate::store::StoreOptions;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "ROUTECAST_";

/// routecast configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address for the WebSocket server
    pub listen: String,
    /// Pub/sub store selection
    pub store: StoreOptions,
    /// Reply timeout in milliseconds; unset waits forever
    pub reply_timeout_ms: Option<u64>,
    /// Routes served by this process
    pub routes: Vec<Route>,
    /// Filter chains per (controller, action)
    pub filters: Vec<FilterChainConfig>,
    /// Listener bindings to namespaced lifecycle events
    pub events: Vec<EventBinding>,
    /// Listener bindings to framework-wide events
    pub listeners: Vec<ListenerBinding>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_string(),
            store: StoreOptions::default(),
            reply_timeout_ms: None,
            routes: Vec::new(),
            filters: Vec::new(),
            events: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

impl Config {
    /// Load from an optional file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(&env_overrides());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Apply string overrides (lowercased keys without prefix)
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, String>) {
        if let Some(listen) = overrides.get("listen")
            && !listen.is_empty()
        {
            self.listen = listen.clone();
        }

        if let Some(store) = overrides.get("store")
            && !store.is_empty()
        {
            self.store.kind = store.trim().to_lowercase();
        }

        if let Some(url) = overrides.get("database_url")
            && !url.is_empty()
        {
            self.store.url = Some(url.clone());
        }

        if let Some(timeout) = overrides.get("reply_timeout_ms")
            && let Ok(ms) = timeout.trim().parse::<u64>()
        {
            self.reply_timeout_ms = if ms == 0 { None } else { Some(ms) };
        }
    }
}

/// Collect ROUTECAST_* environment variables
fn env_overrides() -> HashMap<String, String> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(ENV_PREFIX)
                .map(|name| (name.to_lowercase(), value))
        })
        .collect()
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.listen, "127.0.0.1:3000");
        assert_eq!(config.store.kind, "memory");
        assert!(config.reply_timeout_ms.is_none());
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_from_json() {
        let config = Config::from_json(
            r#"{
                "listen": "0.0.0.0:9000",
                "store": {"type": "postgres", "url": "postgres://localhost/app"},
                "routes": [
                    {"name": "echo", "controller": "EchoController", "action": "handle"},
                    {"name": "chat.say", "controller": "ChatController", "action": "say", "namespace": "/chat"}
                ],
                "filters": [
                    {"controller": "ChatController", "action": "say", "pre": ["auth"]}
                ],
                "events": [
                    {"namespace": "/chat", "event": "client.connect", "listener": "greeter"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.store.kind, "postgres");
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].namespace, "/");
        assert_eq!(config.routes[1].namespace, "/chat");
        assert_eq!(config.filters[0].pre, vec!["auth".to_string()]);
        assert!(config.filters[0].post.is_empty());
        assert_eq!(config.events[0].listener, "greeter");
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::default();
        config.apply_overrides(&overrides(&[
            ("listen", "0.0.0.0:4000"),
            ("store", " Postgres "),
            ("database_url", "postgres://db/app"),
            ("reply_timeout_ms", "2500"),
        ]));

        assert_eq!(config.listen, "0.0.0.0:4000");
        assert_eq!(config.store.kind, "postgres");
        assert_eq!(config.store.url.as_deref(), Some("postgres://db/app"));
        assert_eq!(config.reply_timeout_ms, Some(2500));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let mut config = Config {
            reply_timeout_ms: Some(100),
            ..Config::default()
        };
        config.apply_overrides(&overrides(&[("reply_timeout_ms", "0")]));
        assert!(config.reply_timeout_ms.is_none());
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/routecast.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
