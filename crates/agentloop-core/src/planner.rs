//! Task graphs and the planning collaborator.
//!
//! A [`TaskGraph`] is a DAG of [`PlanNode`]s. Execution groups nodes into
//! waves: every node of a wave has all of its dependencies in earlier waves.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::action::Params;
use crate::error::AgentLoopError;
use crate::llm::{CompletionClient, CompletionRequest, DynCompletionClient, complete_json};

/// Unique identifier for a plan node
pub type NodeId = String;

/// A single sub-task of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: NodeId,
    pub description: String,
    /// Tool to call; tool-less nodes are answered by a direct reasoning call.
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub params: Params,
    /// IDs of nodes that must complete before this one
    #[serde(default, alias = "depends_on")]
    pub dependencies: Vec<NodeId>,
}

impl PlanNode {
    pub fn new(id: impl Into<NodeId>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool: None,
            params: Params::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_dependency(mut self, dep_id: impl Into<NodeId>) -> Self {
        self.dependencies.push(dep_id.into());
        self
    }
}

/// Directed acyclic graph of plan nodes
///
/// Serialized as the goal plus the node list; loading re-runs [`TaskGraph::from_nodes`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "GraphRecord", into = "GraphRecord")]
pub struct TaskGraph {
    goal: String,
    nodes: HashMap<NodeId, PlanNode>,
    /// Insertion order, used to keep waves deterministic
    order: Vec<NodeId>,
    /// Adjacency list: node_id -> [dependent_node_ids]
    edges: HashMap<NodeId, Vec<NodeId>>,
}

#[derive(Serialize, Deserialize)]
struct GraphRecord {
    goal: String,
    #[serde(default)]
    nodes: Vec<PlanNode>,
}

impl TryFrom<GraphRecord> for TaskGraph {
    type Error = AgentLoopError;

    fn try_from(record: GraphRecord) -> Result<Self, Self::Error> {
        TaskGraph::from_nodes(record.goal, record.nodes)
    }
}

impl From<TaskGraph> for GraphRecord {
    fn from(mut graph: TaskGraph) -> Self {
        let nodes = graph
            .order
            .iter()
            .filter_map(|id| graph.nodes.remove(id))
            .collect();
        GraphRecord {
            goal: graph.goal,
            nodes,
        }
    }
}

impl TaskGraph {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }

    /// Build a graph from nodes listed in any order, validating references and acyclicity.
    pub fn from_nodes(
        goal: impl Into<String>,
        nodes: Vec<PlanNode>,
    ) -> Result<Self, AgentLoopError> {
        let mut graph = Self::new(goal);
        for node in nodes {
            if graph.nodes.contains_key(&node.id) {
                return Err(AgentLoopError::Planning(format!(
                    "plan node with ID '{}' already exists",
                    node.id
                )));
            }
            graph.order.push(node.id.clone());
            graph.nodes.insert(node.id.clone(), node);
        }

        for id in &graph.order {
            let node = &graph.nodes[id];
            for dep_id in &node.dependencies {
                if !graph.nodes.contains_key(dep_id) {
                    return Err(AgentLoopError::Planning(format!(
                        "dependency '{}' not found for node '{}'",
                        dep_id, node.id
                    )));
                }
                graph
                    .edges
                    .entry(dep_id.clone())
                    .or_default()
                    .push(node.id.clone());
            }
        }

        graph.validate()?;
        Ok(graph)
    }

    /// Validate that the graph is acyclic
    pub fn validate(&self) -> Result<(), AgentLoopError> {
        let visited: usize = self.waves_unchecked().iter().map(Vec::len).sum();
        if visited != self.nodes.len() {
            return Err(AgentLoopError::Planning(
                "plan graph contains cycles".to_string(),
            ));
        }
        Ok(())
    }

    /// Group nodes into execution waves (Kahn's algorithm, level by level).
    pub fn waves(&self) -> Result<Vec<Vec<NodeId>>, AgentLoopError> {
        self.validate()?;
        Ok(self.waves_unchecked())
    }

    fn waves_unchecked(&self) -> Vec<Vec<NodeId>> {
        let position: HashMap<&NodeId, usize> =
            self.order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        let mut in_degree: HashMap<&NodeId, usize> = self
            .nodes
            .values()
            .map(|node| (&node.id, unique_dependencies(node).len()))
            .collect();

        let mut current: Vec<&NodeId> = self
            .order
            .iter()
            .filter(|id| in_degree.get(id).copied() == Some(0))
            .collect();
        let mut waves = Vec::new();

        while !current.is_empty() {
            let mut next: Vec<&NodeId> = Vec::new();
            for id in &current {
                let Some(dependents) = self.edges.get(*id) else {
                    continue;
                };
                let mut seen = HashSet::new();
                for dependent in dependents {
                    if !seen.insert(dependent) {
                        continue;
                    }
                    if let Some(degree) = in_degree.get_mut(dependent) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            next.push(dependent);
                        }
                    }
                }
            }
            next.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
            waves.push(current.into_iter().cloned().collect());
            current = next;
        }
        waves
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn get_node(&self, id: &str) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn nodes_in_order(&self) -> impl Iterator<Item = &PlanNode> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Multi-line description of the plan and its parallel groups.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Plan: {} ({} steps)", self.goal, self.len())];
        match self.waves() {
            Ok(waves) => {
                for (index, wave) in waves.iter().enumerate() {
                    lines.push(format!("Wave {}: {}", index + 1, wave.join(", ")));
                }
            }
            Err(err) => lines.push(format!("invalid plan: {err}")),
        }
        for node in self.nodes_in_order() {
            let tool = node.tool.as_deref().unwrap_or("reasoning");
            lines.push(format!("- {} [{}] {}", node.id, tool, node.description));
        }
        lines.join("\n")
    }
}

fn unique_dependencies(node: &PlanNode) -> HashSet<&NodeId> {
    node.dependencies.iter().collect()
}

/// Planning collaborator.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn generate_plan(&self, goal: &str, tools_description: &str)
    -> anyhow::Result<TaskGraph>;

    /// One-shot repair after `failed_node` failed with `error`.
    async fn revise_plan(
        &self,
        graph: &TaskGraph,
        failed_node: &str,
        error: &str,
    ) -> anyhow::Result<TaskGraph>;
}

const PLAN_PROMPT: &str = "Break the goal into a small plan of concrete steps. \
Reply with one JSON object: {\"nodes\": [{\"id\": \"s1\", \"description\": \"...\", \
\"tool\": \"tool_name or null\", \"params\": {}, \"depends_on\": []}]}. \
Use tools only from the list below; steps without a tool are answered by reasoning. \
Independent steps must not depend on each other so they can run in parallel.";

/// Planner that asks the completion service for a JSON plan.
pub struct LlmPlanner {
    client: DynCompletionClient,
    max_nodes: usize,
}

#[derive(Debug, Deserialize)]
struct PlanPayload {
    #[serde(default)]
    nodes: Vec<PlanNode>,
}

impl LlmPlanner {
    pub fn new(client: DynCompletionClient) -> Self {
        Self {
            client,
            max_nodes: 10,
        }
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes.max(1);
        self
    }

    async fn request_plan(&self, goal: &str, prompt: String) -> anyhow::Result<TaskGraph> {
        let client: &dyn CompletionClient = self.client.as_ref();
        let value = complete_json(
            client,
            CompletionRequest::prompt(prompt)
                .with_system_prompt(PLAN_PROMPT)
                .with_temperature(0.2),
        )
        .await?;

        let mut payload: PlanPayload = serde_json::from_value(value)?;
        payload.nodes.truncate(self.max_nodes);
        let graph = TaskGraph::from_nodes(goal, payload.nodes)?;
        tracing::debug!(nodes = graph.len(), "plan generated");
        Ok(graph)
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn generate_plan(
        &self,
        goal: &str,
        tools_description: &str,
    ) -> anyhow::Result<TaskGraph> {
        let prompt = format!("Goal: {goal}\n\nAvailable tools:\n{tools_description}");
        self.request_plan(goal, prompt).await
    }

    async fn revise_plan(
        &self,
        graph: &TaskGraph,
        failed_node: &str,
        error: &str,
    ) -> anyhow::Result<TaskGraph> {
        let current = serde_json::to_string(&graph.nodes_in_order().collect::<Vec<_>>())?;
        let prompt = format!(
            "Goal: {}\n\nCurrent plan nodes: {current}\n\nStep '{failed_node}' failed: {error}\n\
             Return the revised full plan. Keep the ID of a step you only want to retry.",
            graph.goal()
        );
        self.request_plan(graph.goal(), prompt).await
    }
}
