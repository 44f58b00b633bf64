//! Pre/post filter chains around controller actions
//!
//! Chains are keyed by (controller, action) and run sequentially. A filter
//! either lets the chain continue or halts it with the payload the caller
//! should receive instead.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::{Request, Response};

/// Which side of the action a chain runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pre,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => f.write_str("pre"),
            Phase::Post => f.write_str("post"),
        }
    }
}

/// Result of a single filter
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOutcome {
    Continue,
    Halt(Value),
}

/// Result of a whole chain
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome<T> {
    /// Every filter continued and `next` ran
    Completed(T),
    /// A filter halted; `next` never ran
    Halted(Value),
}

#[async_trait]
pub trait Filter: Send + Sync {
    async fn apply(&self, request: &Request, response: &Response) -> FilterOutcome;
}

struct FilterFn<F>(F);

#[async_trait]
impl<F, Fut> Filter for FilterFn<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FilterOutcome> + Send + 'static,
{
    async fn apply(&self, request: &Request, response: &Response) -> FilterOutcome {
        (self.0)(request.clone(), response.clone()).await
    }
}

/// Wrap an async closure as a filter
pub fn filter_fn<F, Fut>(f: F) -> Arc<dyn Filter>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FilterOutcome> + Send + 'static,
{
    Arc::new(FilterFn(f))
}

/// Ordered filters for one (controller, action)
#[derive(Clone, Default)]
pub struct FilterChain {
    pub pre: Vec<Arc<dyn Filter>>,
    pub post: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    fn phase(&self, phase: Phase) -> &[Arc<dyn Filter>] {
        match phase {
            Phase::Pre => &self.pre,
            Phase::Post => &self.post,
        }
    }
}

/// Filter chain declaration as it appears in configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterChainConfig {
    pub controller: String,
    pub action: String,
    #[serde(default)]
    pub pre: Vec<String>,
    #[serde(default)]
    pub post: Vec<String>,
}

/// Runs filter chains; read-only after boot
#[derive(Clone, Default)]
pub struct FilterRunner {
    chains: HashMap<(String, String), FilterChain>,
}

impl FilterRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_chain(&mut self, controller: &str, action: &str, chain: FilterChain) {
        self.chains
            .insert((controller.to_string(), action.to_string()), chain);
    }

    /// Number of filters configured for one phase
    pub fn chain_len(&self, controller: &str, action: &str, phase: Phase) -> usize {
        self.chains
            .get(&(controller.to_string(), action.to_string()))
            .map(|chain| chain.phase(phase).len())
            .unwrap_or(0)
    }

    /// Run the chain for (controller, action, phase), then `next`
    ///
    /// An empty chain calls `next` straight away.
    pub async fn run<F, Fut, T>(
        &self,
        controller: &str,
        action: &str,
        phase: Phase,
        request: &Request,
        response: &Response,
        next: F,
    ) -> ChainOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(chain) = self
            .chains
            .get(&(controller.to_string(), action.to_string()))
        {
            for (idx, filter) in chain.phase(phase).iter().enumerate() {
                if let FilterOutcome::Halt(payload) = filter.apply(request, response).await {
                    debug!(controller, action, %phase, filter = idx, "filter chain halted");
                    return ChainOutcome::Halted(payload);
                }
            }
        }

        ChainOutcome::Completed(next().await)
    }
}

impl fmt::Debug for FilterRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRunner")
            .field("chains", &self.chains.len())
            .finish()
    }
}
