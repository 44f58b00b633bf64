//! Kernel boot
//!
//! Reads the container once and produces the immutable snapshot every
//! dispatch works from: resolved routes, filter chains, event listeners
//! and the namespace registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::container::{
    Container, EVENT_TAG, FILTERS_PARAMETER, KERNEL_EVENT_TAG, REPLY_TIMEOUT_PARAMETER,
    ROUTES_PARAMETER, Tag,
};
use crate::controller::Action;
use crate::events::{EventDispatcher, Listener, namespaced};
use crate::filter::{Filter, FilterChain, FilterChainConfig, FilterRunner};
use crate::router::{DEFAULT_NAMESPACE, Route, RouteError, RouteTable};

/// A route with its action resolved
#[derive(Clone)]
pub struct BoundRoute {
    pub route: Arc<Route>,
    pub action: Arc<dyn Action>,
}

impl std::fmt::Debug for BoundRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundRoute")
            .field("route", &self.route)
            .finish()
    }
}

/// Immutable configuration snapshot
#[derive(Debug)]
pub struct Kernel {
    routes: RouteTable,
    bound: HashMap<String, BoundRoute>,
    filters: FilterRunner,
    events: EventDispatcher,
    namespaces: Vec<String>,
    routed_events: HashMap<String, HashSet<String>>,
    reply_timeout: Option<Duration>,
}

impl Kernel {
    /// Build the snapshot from a filled container
    pub fn boot(container: &Container) -> Result<Arc<Self>, BootError> {
        let routes: Vec<Route> = parameter(container, ROUTES_PARAMETER)?.unwrap_or_default();
        let chains: Vec<FilterChainConfig> =
            parameter(container, FILTERS_PARAMETER)?.unwrap_or_default();
        let reply_timeout = parameter::<u64>(container, REPLY_TIMEOUT_PARAMETER)?
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis);

        let mut table = RouteTable::new();
        table.set_routes(routes)?;

        let mut bound = HashMap::with_capacity(table.len());
        let mut namespaces = Vec::new();
        let mut routed_events: HashMap<String, HashSet<String>> = HashMap::new();

        for route in table.iter() {
            let action = container
                .get_action(&route.controller, &route.action)
                .ok_or_else(|| BootError::UnknownAction {
                    route: route.name.clone(),
                    controller: route.controller.clone(),
                    action: route.action.clone(),
                })?;

            bound.insert(
                route.name.clone(),
                BoundRoute {
                    route: Arc::new(route.clone()),
                    action,
                },
            );

            push_unique(&mut namespaces, &route.namespace);
            routed_events
                .entry(route.namespace.clone())
                .or_default()
                .insert(route.event.clone());
        }

        let mut filters = FilterRunner::new();
        for chain in &chains {
            let resolve = |ids: &[String]| -> Result<Vec<Arc<dyn Filter>>, BootError> {
                ids.iter()
                    .map(|id| {
                        container.get_filter(id).ok_or_else(|| BootError::UnknownFilter {
                            filter: id.clone(),
                            controller: chain.controller.clone(),
                            action: chain.action.clone(),
                        })
                    })
                    .collect()
            };

            filters.set_chain(
                &chain.controller,
                &chain.action,
                FilterChain {
                    pre: resolve(&chain.pre)?,
                    post: resolve(&chain.post)?,
                },
            );
        }

        let mut events = EventDispatcher::new();
        for tag in container.tags_by_name(EVENT_TAG) {
            let namespace = tag.get_parameter("namespace").unwrap_or(DEFAULT_NAMESPACE);
            let (event, listener) = tagged_listener(container, tag)?;

            let name = namespaced(namespace, event);
            debug!(event = %name, listener = %tag.service_id, "listener registered");
            events.add_listener(&name, listener);
            push_unique(&mut namespaces, namespace);
        }
        for tag in container.tags_by_name(KERNEL_EVENT_TAG) {
            let (event, listener) = tagged_listener(container, tag)?;
            debug!(event, listener = %tag.service_id, "framework listener registered");
            events.add_listener(event, listener);
        }

        info!(
            routes = table.len(),
            filter_chains = chains.len(),
            namespaces = ?namespaces,
            "kernel booted"
        );

        Ok(Arc::new(Self {
            routes: table,
            bound,
            filters,
            events,
            namespaces,
            routed_events,
            reply_timeout,
        }))
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Resolved route by name
    pub fn bound_route(&self, name: &str) -> Result<&BoundRoute, RouteError> {
        self.bound
            .get(name)
            .ok_or_else(|| RouteError::NotFound(name.to_string()))
    }

    pub fn filters(&self) -> &FilterRunner {
        &self.filters
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Namespace registry, in discovery order
    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    /// Whether `event` carries routed messages on `namespace`
    pub fn routes_event(&self, namespace: &str, event: &str) -> bool {
        self.routed_events
            .get(namespace)
            .is_some_and(|events| events.contains(event))
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        self.reply_timeout
    }
}

fn parameter<T: serde::de::DeserializeOwned>(
    container: &Container,
    name: &'static str,
) -> Result<Option<T>, BootError> {
    container
        .parameter_as(name)
        .map_err(|source| BootError::Parameter { name, source })
}

/// Event name and listener service of a listener tag
fn tagged_listener<'a>(
    container: &Container,
    tag: &'a Tag,
) -> Result<(&'a str, Arc<dyn Listener>), BootError> {
    let event = tag
        .get_parameter("event")
        .ok_or_else(|| BootError::MissingTagParameter {
            service: tag.service_id.clone(),
            parameter: "event",
        })?;
    let listener = container
        .get_listener(&tag.service_id)
        .ok_or_else(|| BootError::UnknownListener(tag.service_id.clone()))?;
    Ok((event, listener))
}

fn push_unique(namespaces: &mut Vec<String>, namespace: &str) {
    if !namespaces.iter().any(|ns| ns == namespace) {
        namespaces.push(namespace.to_string());
    }
}

/// Boot errors
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error(transparent)]
    Route(#[from] RouteError),
    #[error("invalid parameter {name}: {source}")]
    Parameter {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("route {route} points at unknown action {controller}::{action}")]
    UnknownAction {
        route: String,
        controller: String,
        action: String,
    },
    #[error("unknown filter {filter} in chain for {controller}::{action}")]
    UnknownFilter {
        filter: String,
        controller: String,
        action: String,
    },
    #[error("unknown listener service {0}")]
    UnknownListener(String),
    #[error("event tag on {service} is missing parameter {parameter}")]
    MissingTagParameter {
        service: String,
        parameter: &'static str,
    },
}
