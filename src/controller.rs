//! Controller actions
//!
//! An action is the typed callable a route resolves to. Resolution happens
//! once at boot, so a route naming a missing action fails before any
//! connection is accepted.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::{Request, Response};

/// A controller action
///
/// The action finishes the exchange by calling [`Response::reply`], now or
/// later from a task that holds the response. Returning `Err` without
/// having replied answers the caller with an `action_failed` error.
#[async_trait]
pub trait Action: Send + Sync {
    async fn call(&self, request: Request, response: Response) -> anyhow::Result<()>;
}

struct ActionFn<F>(F);

#[async_trait]
impl<F, Fut> Action for ActionFn<F>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, request: Request, response: Response) -> anyhow::Result<()> {
        (self.0)(request, response).await
    }
}

/// Wrap an async closure as an action
pub fn action_fn<F, Fut>(f: F) -> Arc<dyn Action>
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(ActionFn(f))
}

/// Identifies an action inside the container
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionId {
    pub controller: String,
    pub action: String,
}

impl ActionId {
    pub fn new(controller: &str, action: &str) -> Self {
        Self {
            controller: controller.to_string(),
            action: action.to_string(),
        }
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.controller, self.action)
    }
}
