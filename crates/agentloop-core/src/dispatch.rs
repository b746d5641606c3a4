//! Tool dispatch: name resolution against the live catalogue and safe fan-out.
//!
//! Model output frequently misspells tool names, so [`ToolDispatcher::resolve`]
//! tries an exact match, then a case-insensitive one, then the single nearest
//! name by matching-character ratio. Invocation never fails: errors, unknown
//! tools and panicking handlers all come back as a failed [`ToolOutcome`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::action::{Params, ToolCall};
use crate::config::DispatcherConfig;
use crate::events::{EventCollector, Outcome, Stage};
use crate::metrics;

/// Per-run context handed to every tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolContext {
    pub conversation_id: String,
    /// Opaque host data (database handles are resolved by the host from this).
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl ToolContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Result of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub data: Option<Value>,
}

impl ToolOutcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
            data: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// File attachment requested by a successful tool through `data.send_file`.
    pub fn file_attachment(&self) -> Option<FileAttachment> {
        if !self.success {
            return None;
        }
        let data = self.data.as_ref()?.as_object()?;
        if !data.get("send_file").and_then(Value::as_bool).unwrap_or(false) {
            return None;
        }
        let field = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Some(FileAttachment {
            path: field("filepath"),
            name: field("filename"),
        })
    }

    /// Text fed back to the model for this outcome.
    pub fn render(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            match (&self.error, self.output.is_empty()) {
                (Some(error), true) => format!("error: {error}"),
                (Some(error), false) => format!("error: {error}\n{}", self.output),
                (None, _) => self.output.clone(),
            }
        }
    }
}

/// A file produced by a tool for the delivery layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub path: String,
    pub name: String,
}

/// The set of capabilities the agent may call.
#[async_trait]
pub trait ToolCatalogue: Send + Sync {
    fn list_names(&self) -> Vec<String>;

    /// Human-readable capability list injected into the model context.
    fn describe_all(&self) -> String;

    async fn invoke(
        &self,
        name: &str,
        params: &Params,
        context: &ToolContext,
    ) -> anyhow::Result<ToolOutcome>;
}

/// One dispatched call, in the form the loop and the DAG consume.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub requested: String,
    pub resolved: Option<String>,
    pub outcome: ToolOutcome,
    pub duration_ms: u64,
}

impl Invocation {
    /// Name shown to the model: the canonical one if resolution succeeded.
    pub fn display_name(&self) -> &str {
        self.resolved.as_deref().unwrap_or(&self.requested)
    }

    pub fn observation(&self) -> String {
        let marker = if self.outcome.success { "ok" } else { "failed" };
        format!("[{}] {marker}: {}", self.display_name(), self.outcome.render())
    }
}

/// Render parallel results as one observation, one entry per call in request order.
pub fn render_parallel(invocations: &[Invocation]) -> String {
    invocations
        .iter()
        .map(Invocation::observation)
        .collect::<Vec<_>>()
        .join("\n")
}

struct NameCache {
    names: Vec<String>,
    refreshed_at: Instant,
}

pub struct ToolDispatcher {
    catalogue: Arc<dyn ToolCatalogue>,
    cache: RwLock<Option<NameCache>>,
    similarity_cutoff: f64,
    cache_ttl: Duration,
    events: Option<EventCollector>,
}

impl ToolDispatcher {
    pub fn new(catalogue: Arc<dyn ToolCatalogue>) -> Self {
        Self::with_config(catalogue, &DispatcherConfig::default())
    }

    pub fn with_config(catalogue: Arc<dyn ToolCatalogue>, config: &DispatcherConfig) -> Self {
        Self {
            catalogue,
            cache: RwLock::new(None),
            similarity_cutoff: config.similarity_cutoff,
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    pub fn catalogue(&self) -> &Arc<dyn ToolCatalogue> {
        &self.catalogue
    }

    pub fn describe_all(&self) -> String {
        self.catalogue.describe_all()
    }

    /// Catalogue names, refreshed at most once per TTL.
    pub async fn names(&self) -> Vec<String> {
        {
            let cache = self.cache.read().await;
            if let Some(cache) = cache.as_ref() {
                if cache.refreshed_at.elapsed() < self.cache_ttl {
                    return cache.names.clone();
                }
            }
        }

        let names = self.catalogue.list_names();
        tracing::debug!(count = names.len(), "refreshed tool name cache");
        *self.cache.write().await = Some(NameCache {
            names: names.clone(),
            refreshed_at: Instant::now(),
        });
        names
    }

    /// Drop the cached names so the next lookup hits the catalogue.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    pub async fn resolve(&self, name: &str) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let names = self.names().await;
        resolve_among(name, &names, self.similarity_cutoff)
    }

    /// Resolve and invoke one call. Never fails.
    pub async fn invoke(&self, call: &ToolCall, context: &ToolContext) -> Invocation {
        let started = Instant::now();
        let resolved = self.resolve(&call.name).await;

        if let Some(canonical) = resolved.as_deref() {
            if canonical != call.name {
                tracing::info!(requested = %call.name, resolved = %canonical, "fuzzy matched tool name");
            }
        }

        let outcome = match resolved.as_deref() {
            Some(canonical) => self.invoke_resolved(canonical, &call.params, context).await,
            None => {
                tracing::warn!(requested = %call.name, "tool not found");
                ToolOutcome::failed(format!("tool '{}' not found", call.name))
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        metrics::record_tool_call(
            resolved.as_deref().unwrap_or("unresolved"),
            outcome.success,
        );

        Invocation {
            requested: call.name.clone(),
            resolved,
            outcome,
            duration_ms,
        }
    }

    /// Invoke all calls concurrently. The result vector matches request order.
    pub async fn invoke_all(&self, calls: &[ToolCall], context: &ToolContext) -> Vec<Invocation> {
        let futures = calls.iter().map(|call| self.invoke(call, context));
        join_all(futures).await
    }

    async fn invoke_resolved(
        &self,
        name: &str,
        params: &Params,
        context: &ToolContext,
    ) -> ToolOutcome {
        let started = Instant::now();
        if let Some(events) = &self.events {
            events.emit_start(name, Stage::Tool, format!("invoke {name}"));
        }

        let result = AssertUnwindSafe(self.catalogue.invoke(name, params, context))
            .catch_unwind()
            .await;

        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => {
                tracing::warn!(tool = %name, error = %err, "tool invocation failed");
                ToolOutcome::failed(format!("{err:#}"))
            }
            Err(_) => {
                tracing::error!(tool = %name, "tool handler panicked");
                ToolOutcome::failed(format!("tool '{name}' panicked"))
            }
        };

        if let Some(events) = &self.events {
            let status = if outcome.success {
                Outcome::Success
            } else {
                Outcome::failure(outcome.error.clone().unwrap_or_default())
            };
            events.emit_finish(name, Stage::Tool, status, started.elapsed().as_millis() as u64);
        }
        outcome
    }
}

/// Exact, then case-insensitive, then the single nearest name above `cutoff`.
pub fn resolve_among(name: &str, names: &[String], cutoff: f64) -> Option<String> {
    if let Some(exact) = names.iter().find(|candidate| candidate.as_str() == name) {
        return Some(exact.clone());
    }

    let lowered = name.to_lowercase();
    if let Some(folded) = names
        .iter()
        .find(|candidate| candidate.to_lowercase() == lowered)
    {
        return Some(folded.clone());
    }

    names
        .iter()
        .map(|candidate| {
            let folded = candidate.to_lowercase();
            let score = name_ratio(&lowered, &folded);
            let tie_break = strsim::jaro_winkler(&lowered, &folded);
            (candidate, score, tie_break)
        })
        .filter(|(_, score, _)| *score >= cutoff)
        .max_by(|a, b| a.1.total_cmp(&b.1).then(a.2.total_cmp(&b.2)))
        .map(|(candidate, _, _)| candidate.clone())
}

/// `2 * common / total` over the longest common subsequence of characters.
///
/// Abbreviations keep a usable score: "calc" against "calculate" is 0.62.
fn name_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }

    let mut row = vec![0usize; b.len() + 1];
    for ca in &a {
        let mut diagonal = 0;
        for (j, cb) in b.iter().enumerate() {
            let above = row[j + 1];
            row[j + 1] = if ca == cb {
                diagonal + 1
            } else {
                above.max(row[j])
            };
            diagonal = above;
        }
    }
    2.0 * row[b.len()] as f64 / total as f64
}
