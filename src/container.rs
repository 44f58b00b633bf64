//! Service container
//!
//! The registry the host application fills before boot: named actions,
//! filters and listeners, free-form parameters, and tags that bind
//! listeners to namespaced events. The kernel reads it once.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::Config;
use crate::controller::{Action, ActionId};
use crate::events::Listener;
use crate::filter::Filter;

/// Parameter holding the route list
pub const ROUTES_PARAMETER: &str = "websocket.routes";

/// Parameter holding the filter chain declarations
pub const FILTERS_PARAMETER: &str = "websocket.filters";

/// Parameter holding the reply timeout in milliseconds
pub const REPLY_TIMEOUT_PARAMETER: &str = "websocket.reply_timeout_ms";

/// Tag binding a listener service to a namespaced event
pub const EVENT_TAG: &str = "websocket.event";

/// Tag binding a listener service to a framework-wide event
pub const KERNEL_EVENT_TAG: &str = "kernel.event";

/// Declarative metadata attached to a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub name: String,
    pub service_id: String,
    pub params: HashMap<String, String>,
}

impl Tag {
    pub fn new(name: &str, service_id: &str) -> Self {
        Self {
            name: name.to_string(),
            service_id: service_id.to_string(),
            params: HashMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get_parameter(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

#[derive(Default)]
pub struct Container {
    actions: HashMap<ActionId, Arc<dyn Action>>,
    filters: HashMap<String, Arc<dyn Filter>>,
    listeners: HashMap<String, Arc<dyn Listener>>,
    parameters: HashMap<String, Value>,
    tags: Vec<Tag>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_action(&mut self, controller: &str, action: &str, handler: Arc<dyn Action>) {
        self.actions.insert(ActionId::new(controller, action), handler);
    }

    pub fn register_filter(&mut self, id: &str, filter: Arc<dyn Filter>) {
        self.filters.insert(id.to_string(), filter);
    }

    pub fn register_listener(&mut self, id: &str, listener: Arc<dyn Listener>) {
        self.listeners.insert(id.to_string(), listener);
    }

    pub fn set_parameter(&mut self, name: &str, value: Value) {
        self.parameters.insert(name.to_string(), value);
    }

    pub fn add_tag(&mut self, tag: Tag) {
        self.tags.push(tag);
    }

    pub fn get_action(&self, controller: &str, action: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(&ActionId::new(controller, action)).cloned()
    }

    pub fn get_filter(&self, id: &str) -> Option<Arc<dyn Filter>> {
        self.filters.get(id).cloned()
    }

    pub fn get_listener(&self, id: &str) -> Option<Arc<dyn Listener>> {
        self.listeners.get(id).cloned()
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    /// Deserialize a parameter; `Ok(None)` when it is unset
    pub fn parameter_as<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        self.parameters
            .get(name)
            .map(|value| T::deserialize(value))
            .transpose()
    }

    /// Tags with the given name, in insertion order
    pub fn tags_by_name(&self, name: &str) -> Vec<&Tag> {
        self.tags.iter().filter(|tag| tag.name == name).collect()
    }

    /// Load routes, filter chains, reply timeout and listener bindings
    pub fn load_config(&mut self, config: &Config) -> Result<(), serde_json::Error> {
        self.set_parameter(ROUTES_PARAMETER, serde_json::to_value(&config.routes)?);
        self.set_parameter(FILTERS_PARAMETER, serde_json::to_value(&config.filters)?);
        if let Some(ms) = config.reply_timeout_ms {
            self.set_parameter(REPLY_TIMEOUT_PARAMETER, Value::from(ms));
        }

        for binding in &config.events {
            let mut tag = Tag::new(EVENT_TAG, &binding.listener).with_param("event", &binding.event);
            if let Some(ref namespace) = binding.namespace {
                tag = tag.with_param("namespace", namespace);
            }
            self.add_tag(tag);
        }
        for binding in &config.listeners {
            self.add_tag(Tag::new(KERNEL_EVENT_TAG, &binding.listener).with_param("event", &binding.event));
        }

        Ok(())
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("actions", &self.actions.len())
            .field("filters", &self.filters.len())
            .field("listeners", &self.listeners.len())
            .field("parameters", &self.parameters.keys().collect::<Vec<_>>())
            .field("tags", &self.tags.len())
            .finish()
    }
}
