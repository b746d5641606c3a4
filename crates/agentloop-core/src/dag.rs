//! Wave-by-wave execution of a [`TaskGraph`].
//!
//! Every node whose dependencies have completed runs concurrently with its
//! wave siblings, bounded by a semaphore. A node failure can trigger a single
//! revision round with the planning collaborator; once all waves finish the
//! per-node results are compiled into one answer.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::action::ToolCall;
use crate::config::DagConfig;
use crate::dispatch::{FileAttachment, ToolContext, ToolDispatcher};
use crate::error::{AgentLoopError, TaskError};
use crate::events::{EventCollector, Outcome, Stage};
use crate::llm::{CompletionClient, CompletionRequest, DynCompletionClient};
use crate::planner::{NodeId, PlanNode, Planner, TaskGraph};

/// What a node produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    pub text: String,
    pub tool_used: Option<String>,
    pub files: Vec<FileAttachment>,
}

impl NodeOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// Runs a single plan node. `upstream` holds the outputs of its dependencies.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node: &PlanNode, upstream: &str) -> anyhow::Result<NodeOutput>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub node_id: NodeId,
    pub description: String,
    pub success: bool,
    pub output: String,
    pub error: Option<TaskError>,
    pub duration_ms: u64,
    pub tool_used: Option<String>,
    pub files: Vec<FileAttachment>,
    /// Set when this result comes from re-running the node after a plan revision.
    pub revised: bool,
}

/// Results of one graph execution, in wave order.
#[derive(Debug, Clone, Default)]
pub struct DagRun {
    pub results: Vec<NodeResult>,
    pub waves: usize,
    pub revision_attempted: bool,
    pub duration_ms: u64,
}

impl DagRun {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Canonical tool names used by successful nodes, first use first.
    pub fn tools_used(&self) -> Vec<String> {
        let mut tools: Vec<String> = Vec::new();
        for name in self.results.iter().filter(|r| r.success).filter_map(|r| r.tool_used.as_ref()) {
            if !tools.contains(name) {
                tools.push(name.clone());
            }
        }
        tools
    }

    pub fn files(&self) -> Vec<FileAttachment> {
        self.results
            .iter()
            .flat_map(|r| r.files.iter().cloned())
            .collect()
    }

    /// Plain concatenation of node outputs; used when synthesis is unavailable.
    pub fn concatenate(&self) -> String {
        let sections: Vec<String> = self
            .results
            .iter()
            .filter(|r| r.success && !r.output.trim().is_empty())
            .map(|r| format!("**{}**\n{}", r.description, r.output.trim()))
            .collect();
        if sections.is_empty() {
            let failures: Vec<String> = self
                .results
                .iter()
                .filter_map(|r| r.error.as_ref().map(|e| format!("- {}: {}", r.node_id, e.reason)))
                .collect();
            return format!("No plan step produced a result.\n{}", failures.join("\n"));
        }
        sections.join("\n\n")
    }
}

pub struct DagExecutor {
    config: DagConfig,
    semaphore: Arc<Semaphore>,
    planner: Option<Arc<dyn Planner>>,
    events: Option<EventCollector>,
}

impl DagExecutor {
    pub fn new(config: DagConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_nodes.max(1)));
        Self {
            config,
            semaphore,
            planner: None,
            events: None,
        }
    }

    /// Planner consulted for a one-shot revision when a node fails.
    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    /// Execute every node of `graph` wave by wave.
    ///
    /// Only an invalid graph is an error; node failures are recorded in the
    /// returned results. Dependents of a failed node still run and see the
    /// failure in their upstream context.
    #[tracing::instrument(skip_all, fields(goal = %graph.goal(), nodes = graph.len()))]
    pub async fn execute(
        &self,
        graph: &TaskGraph,
        executor: &dyn NodeExecutor,
    ) -> Result<DagRun, AgentLoopError> {
        let started = Instant::now();
        let waves = graph.waves()?;
        tracing::info!(waves = waves.len(), "starting plan execution");

        let mut results: Vec<NodeResult> = Vec::with_capacity(graph.len());
        let mut index: HashMap<NodeId, usize> = HashMap::new();
        let mut revision_attempted = false;

        for (wave_no, wave) in waves.iter().enumerate() {
            tracing::debug!(wave = wave_no + 1, nodes = ?wave, "executing wave");
            let nodes: Vec<&PlanNode> = wave.iter().filter_map(|id| graph.get_node(id)).collect();

            let futures = nodes.iter().map(|node| {
                let upstream = upstream_context(node, &results, &index);
                async move { self.run_node(node, &upstream, executor, false).await }
            });
            let wave_results = join_all(futures).await;

            for result in wave_results {
                index.insert(result.node_id.clone(), results.len());
                results.push(result);
            }

            let failed: Vec<(NodeId, String)> = wave
                .iter()
                .filter_map(|id| index.get(id).map(|&i| &results[i]))
                .filter(|r| !r.success)
                .map(|r| {
                    let reason = r.error.as_ref().map(|e| e.reason.clone()).unwrap_or_default();
                    (r.node_id.clone(), reason)
                })
                .collect();

            if failed.is_empty() || revision_attempted || !self.config.revise_on_failure {
                continue;
            }
            let Some(planner) = &self.planner else {
                continue;
            };

            revision_attempted = true;
            let (failed_id, error) = &failed[0];
            tracing::info!(node = %failed_id, error = %error, "requesting plan revision");
            let revised = match planner.revise_plan(graph, failed_id, error).await {
                Ok(revised) => revised,
                Err(err) => {
                    tracing::warn!(error = %err, "plan revision failed; keeping original results");
                    continue;
                }
            };

            for (node_id, _) in &failed {
                let Some(node) = revised.get_node(node_id) else {
                    continue;
                };
                let upstream = upstream_context(node, &results, &index);
                let retried = self.run_node(node, &upstream, executor, true).await;
                if let Some(&i) = index.get(node_id) {
                    results[i] = retried;
                }
            }
        }

        let run = DagRun {
            results,
            waves: waves.len(),
            revision_attempted,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            succeeded = run.succeeded(),
            failed = run.failed(),
            duration_ms = run.duration_ms,
            "plan execution complete"
        );
        Ok(run)
    }

    async fn run_node(
        &self,
        node: &PlanNode,
        upstream: &str,
        executor: &dyn NodeExecutor,
        revised: bool,
    ) -> NodeResult {
        let started = Instant::now();
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return NodeResult::failed(node, TaskError::new("node limiter closed", false), 0, revised);
            }
        };

        if let Some(events) = &self.events {
            events.emit_start(node.id.clone(), Stage::PlanNode, node.description.clone());
        }

        let result = AssertUnwindSafe(executor.execute(node, upstream))
            .catch_unwind()
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = match result {
            Ok(Ok(output)) => NodeResult {
                node_id: node.id.clone(),
                description: node.description.clone(),
                success: true,
                output: output.text,
                error: None,
                duration_ms,
                tool_used: output.tool_used,
                files: output.files,
                revised,
            },
            Ok(Err(err)) => {
                tracing::warn!(node = %node.id, error = %err, "plan node failed");
                NodeResult::failed(node, TaskError::new(format!("{err:#}"), true), duration_ms, revised)
            }
            Err(_) => {
                tracing::error!(node = %node.id, "plan node panicked");
                NodeResult::failed(node, TaskError::new("node executor panicked", false), duration_ms, revised)
            }
        };

        if let Some(events) = &self.events {
            let outcome = match &result.error {
                None => Outcome::Success,
                Some(error) => Outcome::Failure {
                    reason: error.reason.clone(),
                    retryable: error.retryable,
                },
            };
            events.emit_finish(node.id.clone(), Stage::PlanNode, outcome, duration_ms);
        }
        result
    }
}

impl NodeResult {
    fn failed(node: &PlanNode, error: TaskError, duration_ms: u64, revised: bool) -> Self {
        Self {
            node_id: node.id.clone(),
            description: node.description.clone(),
            success: false,
            output: String::new(),
            error: Some(error),
            duration_ms,
            tool_used: node.tool.clone(),
            files: Vec::new(),
            revised,
        }
    }
}

fn upstream_context(node: &PlanNode, results: &[NodeResult], index: &HashMap<NodeId, usize>) -> String {
    node.dependencies
        .iter()
        .filter_map(|dep| index.get(dep).map(|&i| &results[i]))
        .map(|r| {
            if r.success {
                format!("[{}] {}", r.node_id, r.output)
            } else {
                let reason = r.error.as_ref().map(|e| e.reason.as_str()).unwrap_or("unknown error");
                format!("[{}] failed: {reason}", r.node_id)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

const SYNTHESIS_PROMPT: &str = "You compile the results of a multi-step plan into one coherent \
answer for the user. Use only the step results provided, mention failed steps briefly when they \
matter, and reply in the same language as the goal.";

/// Compile node results into one answer, falling back to concatenation.
pub async fn synthesize(
    goal: &str,
    run: &DagRun,
    client: &dyn CompletionClient,
    events: Option<&EventCollector>,
) -> String {
    let started = Instant::now();
    if let Some(events) = events {
        events.emit_start("synthesis", Stage::Synthesis, format!("compile {} results", run.results.len()));
    }

    let mut prompt = format!("Goal: {goal}\n\nStep results:\n");
    for result in &run.results {
        if result.success {
            prompt.push_str(&format!("### {} ({})\n{}\n\n", result.node_id, result.description, result.output));
        } else {
            let reason = result.error.as_ref().map(|e| e.reason.as_str()).unwrap_or_default();
            prompt.push_str(&format!("### {} ({})\nFAILED: {reason}\n\n", result.node_id, result.description));
        }
    }

    let request = CompletionRequest::prompt(prompt)
        .with_system_prompt(SYNTHESIS_PROMPT)
        .with_temperature(0.3)
        .with_max_tokens(2048);

    let (answer, outcome) = match client.complete(request).await {
        Ok(text) if !text.trim().is_empty() => (text.trim().to_string(), Outcome::Success),
        Ok(_) => {
            tracing::warn!("synthesis returned empty text; concatenating results");
            (run.concatenate(), Outcome::failure("empty synthesis"))
        }
        Err(err) => {
            tracing::warn!(error = %err, "synthesis failed; concatenating results");
            (run.concatenate(), Outcome::failure(err.to_string()))
        }
    };

    if let Some(events) = events {
        events.emit_finish("synthesis", Stage::Synthesis, outcome, started.elapsed().as_millis() as u64);
    }
    answer
}

const REASONING_PROMPT: &str = "You are completing one step of a larger plan. Answer the step \
concisely using the context from earlier steps. Reply in the language of the task.";

/// Node executor that sends tool-bound nodes through the [`ToolDispatcher`]
/// and answers tool-less nodes with a direct completion call.
pub struct DispatchNodeExecutor {
    dispatcher: Arc<ToolDispatcher>,
    client: DynCompletionClient,
    context: ToolContext,
}

impl DispatchNodeExecutor {
    pub fn new(dispatcher: Arc<ToolDispatcher>, client: DynCompletionClient, context: ToolContext) -> Self {
        Self {
            dispatcher,
            client,
            context,
        }
    }
}

/// Planners sometimes write `"null"` or `"none"` instead of omitting the tool.
fn effective_tool(node: &PlanNode) -> Option<&str> {
    node.tool
        .as_deref()
        .map(str::trim)
        .filter(|tool| !tool.is_empty() && !tool.eq_ignore_ascii_case("null") && !tool.eq_ignore_ascii_case("none"))
}

#[async_trait]
impl NodeExecutor for DispatchNodeExecutor {
    async fn execute(&self, node: &PlanNode, upstream: &str) -> anyhow::Result<NodeOutput> {
        if let Some(tool) = effective_tool(node) {
            let call = ToolCall::new(tool, node.params.clone());
            let invocation = self.dispatcher.invoke(&call, &self.context).await;
            if !invocation.outcome.success {
                anyhow::bail!("{}", invocation.outcome.render());
            }
            return Ok(NodeOutput {
                text: invocation.outcome.render(),
                files: invocation.outcome.file_attachment().into_iter().collect(),
                tool_used: invocation.resolved,
            });
        }

        let mut prompt = format!("Task: {}", node.description);
        if !upstream.trim().is_empty() {
            prompt.push_str(&format!("\n\nResults of earlier steps:\n{upstream}"));
        }
        let text = self
            .client
            .complete(
                CompletionRequest::prompt(prompt)
                    .with_system_prompt(REASONING_PROMPT)
                    .with_temperature(0.3),
            )
            .await?;
        Ok(NodeOutput::text(text.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ToolOutcome;
    use crate::registry::{FnTool, ToolRegistry};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn diamond() -> TaskGraph {
        TaskGraph::from_nodes(
            "compare phones",
            vec![
                PlanNode::new("search", "find candidates").with_tool("web_search"),
                PlanNode::new("price", "compare prices").with_dependency("search"),
                PlanNode::new("camera", "compare cameras").with_dependency("search"),
                PlanNode::new("report", "write report")
                    .with_dependency("price")
                    .with_dependency("camera"),
            ],
        )
        .unwrap()
    }

    #[derive(Default)]
    struct Recording {
        running: AtomicUsize,
        peak: AtomicUsize,
        upstream: Mutex<HashMap<String, String>>,
        fail_once: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeExecutor for Recording {
        async fn execute(&self, node: &PlanNode, upstream: &str) -> anyhow::Result<NodeOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            self.upstream
                .lock()
                .unwrap()
                .insert(node.id.clone(), upstream.to_string());

            let mut fail_once = self.fail_once.lock().unwrap();
            if let Some(pos) = fail_once.iter().position(|id| *id == node.id) {
                fail_once.remove(pos);
                anyhow::bail!("{} exploded", node.id);
            }
            Ok(NodeOutput {
                text: format!("{} done", node.id),
                tool_used: node.tool.clone(),
                files: Vec::new(),
            })
        }
    }

    struct StaticPlanner {
        revised: Option<TaskGraph>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Planner for StaticPlanner {
        async fn generate_plan(&self, _goal: &str, _tools: &str) -> anyhow::Result<TaskGraph> {
            anyhow::bail!("not used")
        }

        async fn revise_plan(
            &self,
            _graph: &TaskGraph,
            _failed_node: &str,
            _error: &str,
        ) -> anyhow::Result<TaskGraph> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.revised
                .clone()
                .ok_or_else(|| anyhow::anyhow!("planner unavailable"))
        }
    }

    struct FixedReply(Result<&'static str, &'static str>);

    #[async_trait]
    impl CompletionClient for FixedReply {
        async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
            self.0.map(str::to_string).map_err(|e| anyhow::anyhow!(e))
        }
    }

    #[tokio::test]
    async fn waves_run_in_order_with_siblings_in_parallel() {
        let executor = Recording::default();
        let run = DagExecutor::new(DagConfig::default())
            .execute(&diamond(), &executor)
            .await
            .unwrap();

        let ids: Vec<&str> = run.results.iter().map(|r| r.node_id.as_str()).collect();
        assert_eq!(ids, vec!["search", "price", "camera", "report"]);
        assert_eq!(run.waves, 3);
        assert_eq!(run.succeeded(), 4);
        assert_eq!(executor.peak.load(Ordering::SeqCst), 2);

        let upstream = executor.upstream.lock().unwrap();
        assert_eq!(upstream["price"], "[search] search done");
        assert_eq!(upstream["report"], "[price] price done\n[camera] camera done");
        assert_eq!(run.tools_used(), vec!["web_search".to_string()]);
    }

    #[tokio::test]
    async fn semaphore_caps_wave_concurrency() {
        let graph = TaskGraph::from_nodes(
            "fan out",
            (0..4).map(|i| PlanNode::new(format!("n{i}"), "work")).collect(),
        )
        .unwrap();
        let executor = Recording::default();
        let config = DagConfig {
            max_concurrent_nodes: 1,
            ..DagConfig::default()
        };
        let run = DagExecutor::new(config).execute(&graph, &executor).await.unwrap();
        assert_eq!(run.succeeded(), 4);
        assert_eq!(executor.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_node_is_rerun_once_after_revision() {
        let executor = Recording::default();
        executor.fail_once.lock().unwrap().push("price".to_string());
        let planner = Arc::new(StaticPlanner {
            revised: Some(diamond()),
            calls: AtomicUsize::new(0),
        });

        let run = DagExecutor::new(DagConfig::default())
            .with_planner(planner.clone())
            .execute(&diamond(), &executor)
            .await
            .unwrap();

        assert!(run.revision_attempted);
        assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
        let price = run.results.iter().find(|r| r.node_id == "price").unwrap();
        assert!(price.success);
        assert!(price.revised);
        assert_eq!(run.failed(), 0);
    }

    #[tokio::test]
    async fn failed_revision_keeps_original_failure_and_dependents_still_run() {
        let executor = Recording::default();
        executor.fail_once.lock().unwrap().push("search".to_string());
        let planner = Arc::new(StaticPlanner {
            revised: None,
            calls: AtomicUsize::new(0),
        });

        let run = DagExecutor::new(DagConfig::default())
            .with_planner(planner)
            .execute(&diamond(), &executor)
            .await
            .unwrap();

        let search = &run.results[0];
        assert!(!search.success);
        assert!(search.error.as_ref().unwrap().reason.contains("search exploded"));
        assert_eq!(run.results.len(), 4);
        assert_eq!(run.failed(), 1);
        let upstream = executor.upstream.lock().unwrap();
        assert!(upstream["price"].starts_with("[search] failed:"));
    }

    #[tokio::test]
    async fn synthesis_falls_back_to_concatenation() {
        let run = DagExecutor::new(DagConfig::default())
            .execute(&diamond(), &Recording::default())
            .await
            .unwrap();

        let answer = synthesize("compare phones", &run, &FixedReply(Ok("Combined answer")), None).await;
        assert_eq!(answer, "Combined answer");

        let fallback = synthesize("compare phones", &run, &FixedReply(Err("offline")), None).await;
        assert!(fallback.starts_with("**find candidates**\nsearch done"));
        assert!(fallback.contains("**write report**\nreport done"));
    }

    #[tokio::test]
    async fn dispatch_executor_routes_tool_and_reasoning_nodes() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FnTool::new("make_report", "build a file", |_params| async {
            Ok(ToolOutcome::ok("report built").with_data(json!({
                "send_file": true,
                "filepath": "/tmp/report.pdf",
                "filename": "report.pdf"
            })))
        })));
        let dispatcher = Arc::new(ToolDispatcher::new(Arc::new(registry)));
        let executor = DispatchNodeExecutor::new(
            dispatcher,
            Arc::new(FixedReply(Ok("  reasoned  "))),
            ToolContext::new("conv"),
        );

        let tool_node = PlanNode::new("r", "make the report").with_tool("make_reprot");
        let output = executor.execute(&tool_node, "").await.unwrap();
        assert_eq!(output.text, "report built");
        assert_eq!(output.tool_used.as_deref(), Some("make_report"));
        assert_eq!(output.files[0].name, "report.pdf");

        let thinking = PlanNode::new("t", "summarise").with_tool("null");
        let output = executor.execute(&thinking, "[r] report built").await.unwrap();
        assert_eq!(output.text, "reasoned");
        assert!(output.tool_used.is_none());

        let missing = PlanNode::new("m", "missing").with_tool("launch_rocket");
        let err = executor.execute(&missing, "").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}
