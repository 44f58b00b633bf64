//! Route table
//!
//! Maps a route name carried by an inbound message to the controller action
//! that serves it. The table is filled once at boot and read-only afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Namespace used when a route or event binding does not name one
pub const DEFAULT_NAMESPACE: &str = "/";

/// Transport event routed to controllers when a route does not name one
pub const DEFAULT_EVENT: &str = "message";

/// Static binding from a route name to a controller action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    pub controller: String,
    pub action: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_event")]
    pub event: String,
}

impl Route {
    /// Build a route on the default namespace and event
    pub fn new(name: &str, controller: &str, action: &str) -> Self {
        Self {
            name: name.to_string(),
            controller: controller.to_string(),
            action: action.to_string(),
            namespace: default_namespace(),
            event: default_event(),
        }
    }

    pub fn in_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    pub fn on_event(mut self, event: &str) -> Self {
        self.event = event.to_string();
        self
    }
}

pub(crate) fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

pub(crate) fn default_event() -> String {
    DEFAULT_EVENT.to_string()
}

/// Route table keyed by route name
///
/// Registration order is preserved so namespaces are discovered in the
/// order routes were declared.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: Vec<Route>,
    by_name: HashMap<String, usize>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole route set
    ///
    /// Duplicate names are rejected and leave the previous set in place.
    pub fn set_routes(&mut self, routes: Vec<Route>) -> Result<(), RouteError> {
        let mut by_name = HashMap::with_capacity(routes.len());
        for (idx, route) in routes.iter().enumerate() {
            if by_name.insert(route.name.clone(), idx).is_some() {
                return Err(RouteError::Duplicate(route.name.clone()));
            }
        }

        self.routes = routes;
        self.by_name = by_name;
        Ok(())
    }

    /// Look up a route by name
    pub fn route_by_name(&self, name: &str) -> Result<&Route, RouteError> {
        self.by_name
            .get(name)
            .map(|&idx| &self.routes[idx])
            .ok_or_else(|| RouteError::NotFound(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Route table errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("route not found: {0}")]
    NotFound(String),
    #[error("duplicate route name: {0}")]
    Duplicate(String),
}
