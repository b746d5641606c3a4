//! In-process tool catalogue.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::action::Params;
use crate::dispatch::{ToolCatalogue, ToolContext, ToolOutcome};

/// A single callable capability.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Parameter hint shown next to the description, e.g. `query: string`.
    fn parameters(&self) -> &str {
        ""
    }

    async fn call(&self, params: &Params, context: &ToolContext) -> anyhow::Result<ToolOutcome>;
}

/// Concurrent name → handler map implementing [`ToolCatalogue`].
///
/// Handlers may be registered while dispatchers hold the registry; dispatchers
/// pick new names up on their next cache refresh.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: Arc<DashMap<String, Arc<dyn ToolHandler>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&self, handler: Arc<dyn ToolHandler>) {
        let name = handler.name().to_string();
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::debug!(tool = %name, "replaced tool handler");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[async_trait]
impl ToolCatalogue for ToolRegistry {
    fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    fn describe_all(&self) -> String {
        self.list_names()
            .iter()
            .filter_map(|name| self.handlers.get(name).map(|h| h.value().clone()))
            .map(|handler| {
                if handler.parameters().is_empty() {
                    format!("- {}: {}", handler.name(), handler.description())
                } else {
                    format!(
                        "- {}({}): {}",
                        handler.name(),
                        handler.parameters(),
                        handler.description()
                    )
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn invoke(
        &self,
        name: &str,
        params: &Params,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutcome> {
        // Clone the Arc out so the shard lock is not held across the await.
        let handler = self
            .handlers
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("tool '{name}' is not registered"))?;
        handler.call(params, context).await
    }
}

/// Handler backed by an async closure; convenient for hosts and tests.
pub struct FnTool<F> {
    name: String,
    description: String,
    func: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<ToolOutcome>> + Send,
{
    pub fn new(name: impl Into<String>, description: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Params) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = anyhow::Result<ToolOutcome>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn call(&self, params: &Params, _context: &ToolContext) -> anyhow::Result<ToolOutcome> {
        (self.func)(params.clone()).await
    }
}
