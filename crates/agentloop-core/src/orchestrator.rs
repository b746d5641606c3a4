//! The reasoning loop: think, act, observe, repeat.
//!
//! [`Orchestrator::run`] always returns a [`Response`]. Complex requests try
//! the plan path first; everything else (and a failed plan) goes through the
//! iterative loop, which is bounded by `max_iterations` plus one forced
//! final call.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::action::{self, Action, ParsedAction, clean_answer};
use crate::aggregate;
use crate::classify::classify;
use crate::config::{AgentConfig, DagConfig};
use crate::dag::{DagExecutor, DagRun, DispatchNodeExecutor, synthesize};
use crate::dispatch::{FileAttachment, Invocation, ToolContext, ToolDispatcher, render_parallel};
use crate::events::{EventCollector, Outcome, Stage};
use crate::lexicon::Lexicon;
use crate::llm::{ChatMessage, CompletionRequest, DynCompletionClient, Role, complete_json};
use crate::metrics;
use crate::planner::Planner;

/// Returned when even the forced final call fails.
pub const APOLOGY: &str =
    "Sorry, I could not finish this request. Please try again or rephrase it.";

const CONTINUE_NUDGE: &str =
    "Continue working on the request. Reply with a single JSON object as instructed.";
const RETRY_NUDGE: &str = "The previous step failed. Try again or choose another approach, \
and reply with a single JSON object as instructed.";
const PLAN_FAILED_NUDGE: &str =
    "Planning failed. Continue step by step with individual tool calls.";
const GOAL_REMINDER: &str = "The recent steps drifted away from the request. \
Focus on what the user asked and answer once you have enough information. The request was: ";
const GOAL_CHECK_WINDOW: usize = 3;
const FORCE_FINAL_PROMPT: &str = "You have run out of steps. Using everything gathered so far, \
give the user your final answer now as plain text, without JSON.";

const SYSTEM_PROMPT: &str = r#"You are an assistant that solves the user's request step by step.
On every turn reply with exactly one JSON object:
{"thought": "your reasoning", "action": {...}, "confidence": 0.0-1.0, "should_remember": "fact worth keeping about the user, or null"}

Actions:
- {"type": "tool_call", "tool": "name", "params": {...}}
- {"type": "parallel_tools", "calls": [{"tool": "name", "params": {...}}, ...]} for independent calls
- {"type": "plan", "answer": "what the plan should achieve"} for multi-step work with dependencies
- {"type": "final_answer", "answer": "text for the user"}
- {"type": "ask_user", "answer": "clarifying question"}

After a tool call you receive an Observation. Always answer in the user's language.

Available tools:
"#;

/// One loop turn. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub thought: String,
    pub action: Action,
    pub observation: String,
    pub duration_ms: u64,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    FinalAnswer,
    AskUser,
    /// The auto-plan path answered before the loop started.
    Plan,
    MaxIterations,
    Aborted,
}

impl Termination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Termination::FinalAnswer => "final_answer",
            Termination::AskUser => "ask_user",
            Termination::Plan => "plan",
            Termination::MaxIterations => "max_iterations",
            Termination::Aborted => "aborted",
        }
    }
}

/// Terminal artifact of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub answer: String,
    pub steps: Vec<Step>,
    pub tools_used: Vec<String>,
    pub iteration_count: usize,
    pub elapsed_ms: u64,
    pub plan_used: bool,
    pub files_to_send: Vec<FileAttachment>,
    pub memory_entries_created: usize,
    pub termination: Termination,
}

/// Per-run inputs supplied by the host.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub conversation_id: String,
    /// Checked at the start of every iteration.
    pub abort: CancellationToken,
    pub tool_context: ToolContext,
}

impl RunContext {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            tool_context: ToolContext::new(conversation_id.clone()),
            conversation_id,
            abort: CancellationToken::new(),
        }
    }

    pub fn with_abort(mut self, abort: CancellationToken) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_tool_context(mut self, tool_context: ToolContext) -> Self {
        self.tool_context = tool_context;
        self
    }
}

/// Receives facts the model asked to remember.
#[async_trait]
pub trait MemorySink: Send + Sync {
    async fn remember(&self, conversation_id: &str, fact: &str) -> anyhow::Result<()>;
}

/// A failed loop turn, kept for later analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningSignal {
    pub conversation_id: String,
    pub iteration: usize,
    pub user_message: String,
    pub error: String,
}

#[async_trait]
pub trait LearningSink: Send + Sync {
    async fn record_failure(&self, signal: LearningSignal) -> anyhow::Result<()>;
}

pub struct Orchestrator {
    client: DynCompletionClient,
    dispatcher: Arc<ToolDispatcher>,
    planner: Option<Arc<dyn Planner>>,
    lexicon: Arc<Lexicon>,
    config: AgentConfig,
    dag_config: DagConfig,
    events: Option<EventCollector>,
    memory: Option<Arc<dyn MemorySink>>,
    learning: Option<Arc<dyn LearningSink>>,
}

/// Mutable bookkeeping for one run.
#[derive(Default)]
struct RunState {
    steps: Vec<Step>,
    tools_used: Vec<String>,
    files: Vec<FileAttachment>,
    plan_used: bool,
    memory_entries_created: usize,
}

impl RunState {
    fn record_tool(&mut self, name: &str) {
        if !self.tools_used.iter().any(|used| used == name) {
            self.tools_used.push(name.to_string());
        }
    }

    fn record_invocations(&mut self, invocations: &[Invocation]) {
        for invocation in invocations {
            if let Some(name) = &invocation.resolved {
                self.record_tool(name);
            }
            if let Some(file) = invocation.outcome.file_attachment() {
                self.files.push(file);
            }
        }
    }

    fn record_plan(&mut self, run: &DagRun) {
        self.plan_used = true;
        for tool in run.tools_used() {
            self.record_tool(&tool);
        }
        self.files.extend(run.files());
    }
}

enum TurnOutcome {
    Continue,
    Done(String, Termination),
}

struct PlanOutcome {
    answer: String,
    summary: String,
    run: DagRun,
}

impl Orchestrator {
    pub fn new(client: DynCompletionClient, dispatcher: Arc<ToolDispatcher>) -> Self {
        Self {
            client,
            dispatcher,
            planner: None,
            lexicon: Arc::new(Lexicon::default()),
            config: AgentConfig::default(),
            dag_config: DagConfig::default(),
            events: None,
            memory: None,
            learning: None,
        }
    }

    pub fn with_planner(mut self, planner: Arc<dyn Planner>) -> Self {
        self.planner = Some(planner);
        self
    }

    pub fn with_lexicon(mut self, lexicon: Arc<Lexicon>) -> Self {
        self.lexicon = lexicon;
        self
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dag_config(mut self, config: DagConfig) -> Self {
        self.dag_config = config;
        self
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemorySink>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_learning(mut self, learning: Arc<dyn LearningSink>) -> Self {
        self.learning = Some(learning);
        self
    }

    /// Handle one user message. Never fails.
    #[tracing::instrument(skip_all, fields(conversation_id = %context.conversation_id))]
    pub async fn run(&self, message: &str, history: &[ChatMessage], context: &RunContext) -> Response {
        let started = Instant::now();
        let mut state = RunState::default();
        if let Some(events) = &self.events {
            events.emit_start(context.conversation_id.clone(), Stage::Loop, message.to_string());
        }

        let verdict = classify(message, &self.lexicon);
        if verdict.complex && self.planner.is_some() {
            tracing::info!(reason = ?verdict.reason, markers = verdict.marker_hits, "complex request, trying plan path");
            let plan_started = Instant::now();
            match self.execute_plan(message, &context.tool_context).await {
                Ok(plan) => {
                    state.record_plan(&plan.run);
                    state.steps.push(Step {
                        index: 1,
                        thought: "Complex request; executed a task plan.".to_string(),
                        action: Action::Plan {
                            description: message.to_string(),
                        },
                        observation: plan.summary,
                        duration_ms: plan_started.elapsed().as_millis() as u64,
                    });
                    return self.finish(plan.answer, Termination::Plan, 1, state, started, context);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "plan path failed, falling back to the loop");
                }
            }
        }

        let system_prompt = format!("{SYSTEM_PROMPT}{}", self.dispatcher.describe_all());
        let mut messages = self.initial_messages(message, history);
        let mut iterations = 0;
        let mut outcome = None;

        for iteration in 1..=self.config.max_iterations {
            if context.abort.is_cancelled() {
                tracing::info!(iteration, "abort requested");
                outcome = Some(Termination::Aborted);
                break;
            }
            iterations = iteration;

            let interval = self.config.goal_check_interval.max(1);
            if iteration > 1 && iteration % interval == 0 && !state.tools_used.is_empty() {
                self.check_goal(message, &state.steps, &mut messages);
            }

            let turn_started = Instant::now();
            let turn = self
                .turn(iteration, &system_prompt, &mut messages, &mut state, context, turn_started)
                .await;

            match turn {
                Ok(TurnOutcome::Continue) => {}
                Ok(TurnOutcome::Done(answer, termination)) => {
                    let answer = if termination == Termination::FinalAnswer {
                        self.quality_check(message, answer, iteration).await
                    } else {
                        answer
                    };
                    return self.finish(answer, termination, iterations, state, started, context);
                }
                Err(err) => {
                    tracing::warn!(iteration, error = %err, "turn failed");
                    state.steps.push(Step {
                        index: iteration,
                        thought: String::new(),
                        action: Action::final_answer(""),
                        observation: format!("Error: {err:#}"),
                        duration_ms: turn_started.elapsed().as_millis() as u64,
                    });
                    self.record_learning(context, iteration, message, &err).await;
                    messages.push(ChatMessage::user(RETRY_NUDGE));
                }
            }
        }

        let termination = outcome.unwrap_or(Termination::MaxIterations);
        let answer = self.force_final(&system_prompt, &messages).await;
        self.finish(answer, termination, iterations, state, started, context)
    }

    fn initial_messages(&self, message: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let relevant: Vec<&ChatMessage> = history.iter().filter(|m| m.role != Role::System).collect();
        let skip = relevant.len().saturating_sub(self.config.history_limit);
        let mut messages: Vec<ChatMessage> = relevant.into_iter().skip(skip).cloned().collect();
        messages.push(ChatMessage::user(message));
        messages
    }

    async fn turn(
        &self,
        iteration: usize,
        system_prompt: &str,
        messages: &mut Vec<ChatMessage>,
        state: &mut RunState,
        context: &RunContext,
        turn_started: Instant,
    ) -> anyhow::Result<TurnOutcome> {
        let request = CompletionRequest::new(messages.clone())
            .with_system_prompt(system_prompt)
            .with_temperature(self.config.turn_temperature)
            .with_max_tokens(self.config.turn_max_tokens)
            .structured();
        let raw = self.client.complete(request).await?;

        let ParsedAction {
            action,
            thought,
            confidence,
            remember_fact,
        } = action::parse(&raw);
        tracing::debug!(iteration, action = action.kind(), confidence, "parsed turn");

        if let Some(fact) = remember_fact {
            self.remember(context, &fact, state).await;
        }

        let (observation, outcome) = match &action {
            Action::ToolCall(call) => {
                let invocation = self.dispatcher.invoke(call, &context.tool_context).await;
                state.record_invocations(std::slice::from_ref(&invocation));
                (invocation.observation(), TurnOutcome::Continue)
            }
            Action::ParallelTools { calls } => {
                let invocations = self.dispatcher.invoke_all(calls, &context.tool_context).await;
                state.record_invocations(&invocations);
                (render_parallel(&invocations), TurnOutcome::Continue)
            }
            Action::Plan { description } => {
                let goal = if description.trim().is_empty() {
                    context_goal(messages)
                } else {
                    description.clone()
                };
                match self.execute_plan(&goal, &context.tool_context).await {
                    Ok(plan) => {
                        state.record_plan(&plan.run);
                        let observation = format!("{}\n\nPlan result:\n{}", plan.summary, plan.answer);
                        (observation, TurnOutcome::Continue)
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "in-loop plan failed");
                        let observation = format!("Planning failed: {err:#}");
                        messages.push(ChatMessage::assistant(raw.clone()));
                        messages.push(ChatMessage::user(PLAN_FAILED_NUDGE));
                        self.push_step(state, iteration, thought, action.clone(), observation, turn_started);
                        return Ok(TurnOutcome::Continue);
                    }
                }
            }
            Action::FinalAnswer { text } | Action::AskUser { text } => {
                let cleaned = clean_answer(text);
                if cleaned.trim().is_empty() {
                    messages.push(ChatMessage::assistant(raw.clone()));
                    messages.push(ChatMessage::user(CONTINUE_NUDGE));
                    ("Empty answer; asked the model to continue.".to_string(), TurnOutcome::Continue)
                } else {
                    let termination = if matches!(action, Action::AskUser { .. }) {
                        Termination::AskUser
                    } else {
                        Termination::FinalAnswer
                    };
                    (String::new(), TurnOutcome::Done(cleaned, termination))
                }
            }
        };

        if matches!(action, Action::ToolCall(_) | Action::ParallelTools { .. } | Action::Plan { .. }) {
            messages.push(ChatMessage::assistant(raw));
            messages.push(ChatMessage::user(format!("Observation:\n{observation}")));
        }
        self.push_step(state, iteration, thought, action, observation, turn_started);
        Ok(outcome)
    }

    fn push_step(
        &self,
        state: &mut RunState,
        index: usize,
        thought: String,
        action: Action,
        observation: String,
        started: Instant,
    ) {
        if let Some(events) = &self.events {
            events.emit_message(
                format!("step-{index}"),
                Stage::Loop,
                observation.clone(),
                json!({ "iteration": index, "action": action.kind() }),
            );
        }
        state.steps.push(Step {
            index,
            thought,
            action,
            observation,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    async fn execute_plan(&self, goal: &str, tool_context: &ToolContext) -> anyhow::Result<PlanOutcome> {
        let planner = self
            .planner
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no planner configured"))?;
        let graph = planner
            .generate_plan(goal, &self.dispatcher.describe_all())
            .await?;
        if graph.len() <= 1 {
            anyhow::bail!("plan has {} step(s), nothing to parallelise", graph.len());
        }
        let summary = graph.summary();
        tracing::info!(nodes = graph.len(), "executing plan");

        let mut executor = DagExecutor::new(self.dag_config.clone()).with_planner(planner);
        if let Some(events) = &self.events {
            executor = executor.with_events(events.clone());
        }
        let node_executor = DispatchNodeExecutor::new(
            self.dispatcher.clone(),
            self.client.clone(),
            tool_context.clone(),
        );
        let run = executor.execute(&graph, &node_executor).await?;
        if run.succeeded() == 0 {
            anyhow::bail!("every plan step failed");
        }

        let answer = synthesize(graph.goal(), &run, self.client.as_ref(), self.events.as_ref()).await;
        Ok(PlanOutcome {
            answer: clean_answer(&answer),
            summary,
            run,
        })
    }

    /// Remind the model of the original request when recent steps stop mentioning it.
    ///
    /// Drift is judged by vocabulary overlap with the last few steps, so the check
    /// never spends a completion call.
    fn check_goal(&self, message: &str, steps: &[Step], messages: &mut Vec<ChatMessage>) {
        let request = aggregate::tokens(message);
        if request.is_empty() || steps.is_empty() {
            return;
        }
        let recent = steps
            .iter()
            .rev()
            .take(GOAL_CHECK_WINDOW)
            .map(|step| {
                let action = serde_json::to_string(&step.action).unwrap_or_default();
                format!("{} {action} {}", step.thought, step.observation)
            })
            .collect::<Vec<_>>()
            .join(" ");
        let recent = aggregate::tokens(&recent);

        let on_track = request
            .iter()
            .any(|word| recent.iter().any(|seen| seen.contains(word.as_str()) || word.contains(seen.as_str())));
        if on_track {
            return;
        }
        tracing::info!(steps = steps.len(), "goal drift detected");
        messages.push(ChatMessage::user(format!("{GOAL_REMINDER}{message}")));
    }

    async fn force_final(&self, system_prompt: &str, messages: &[ChatMessage]) -> String {
        let mut messages = messages.to_vec();
        messages.push(ChatMessage::user(FORCE_FINAL_PROMPT));
        let request = CompletionRequest::new(messages)
            .with_system_prompt(system_prompt)
            .with_temperature(self.config.turn_temperature)
            .with_max_tokens(self.config.turn_max_tokens);

        match self.client.complete(request).await {
            Ok(text) => {
                let cleaned = clean_answer(&text);
                if cleaned.trim().is_empty() {
                    APOLOGY.to_string()
                } else {
                    cleaned
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "forced final answer failed");
                APOLOGY.to_string()
            }
        }
    }

    async fn quality_check(&self, message: &str, answer: String, iterations: usize) -> String {
        if iterations < self.config.reflection_threshold
            || answer.chars().count() <= self.config.min_reflect_chars
        {
            return answer;
        }

        let prompt = format!(
            "Request: {message}\n\nAnswer: {answer}\n\n\
             Rate how well the answer serves the request from 0 to 1. If it can be improved, \
             rewrite it in the same language. Reply with JSON: \
             {{\"quality\": 0.0-1.0, \"improved_answer\": \"better answer or null\"}}"
        );
        let review = match complete_json(
            self.client.as_ref(),
            CompletionRequest::prompt(prompt).with_temperature(0.2),
        )
        .await
        {
            Ok(review) => review,
            Err(err) => {
                tracing::debug!(error = %err, "quality check skipped");
                return answer;
            }
        };

        let quality = review.get("quality").and_then(Value::as_f64).unwrap_or(1.0);
        let improved = review
            .get("improved_answer")
            .and_then(Value::as_str)
            .map(clean_answer)
            .filter(|text| !text.trim().is_empty() && !text.eq_ignore_ascii_case("null"));

        match improved {
            Some(improved) if quality < self.config.quality_threshold => {
                tracing::info!(quality, "replacing low quality answer");
                improved
            }
            _ => answer,
        }
    }

    async fn remember(&self, context: &RunContext, fact: &str, state: &mut RunState) {
        let Some(memory) = &self.memory else {
            return;
        };
        match memory.remember(&context.conversation_id, fact).await {
            Ok(()) => state.memory_entries_created += 1,
            Err(err) => tracing::warn!(error = %err, "failed to store fact"),
        }
    }

    async fn record_learning(&self, context: &RunContext, iteration: usize, message: &str, err: &anyhow::Error) {
        let Some(learning) = &self.learning else {
            return;
        };
        let signal = LearningSignal {
            conversation_id: context.conversation_id.clone(),
            iteration,
            user_message: message.to_string(),
            error: format!("{err:#}"),
        };
        if let Err(err) = learning.record_failure(signal).await {
            tracing::debug!(error = %err, "learning signal dropped");
        }
    }

    fn finish(
        &self,
        answer: String,
        termination: Termination,
        iteration_count: usize,
        state: RunState,
        started: Instant,
        context: &RunContext,
    ) -> Response {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        metrics::record_run(termination.as_str(), elapsed_ms, iteration_count, state.plan_used);
        tracing::info!(
            termination = termination.as_str(),
            iterations = iteration_count,
            tools = state.tools_used.len(),
            elapsed_ms,
            "run complete"
        );
        if let Some(events) = &self.events {
            let outcome = match termination {
                Termination::Aborted => Outcome::Cancelled,
                _ => Outcome::Success,
            };
            events.emit_finish(context.conversation_id.clone(), Stage::Loop, outcome, elapsed_ms);
        }

        Response {
            answer,
            steps: state.steps,
            tools_used: state.tools_used,
            iteration_count,
            elapsed_ms,
            plan_used: state.plan_used,
            files_to_send: state.files,
            memory_entries_created: state.memory_entries_created,
            termination,
        }
    }
}

/// Latest user turn that is not a synthetic observation.
fn context_goal(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User && !m.content.starts_with("Observation:"))
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ToolOutcome;
    use crate::llm::CompletionClient;
    use crate::registry::{FnTool, ToolRegistry};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replies from a queue; the last reply repeats once the queue is drained.
    struct Scripted {
        replies: Mutex<VecDeque<String>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl CompletionClient for Scripted {
        async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
            self.requests.lock().unwrap().push(request);
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                Ok(replies.pop_front().unwrap_or_default())
            } else {
                replies
                    .front()
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("script exhausted"))
            }
        }
    }

    fn orchestrator(client: Arc<Scripted>, registry: ToolRegistry) -> Orchestrator {
        Orchestrator::new(client, Arc::new(ToolDispatcher::new(Arc::new(registry))))
    }

    #[tokio::test]
    async fn plain_text_reply_is_the_answer() {
        let client = Scripted::new(&["Привет, как дела?"]);
        let response = orchestrator(client.clone(), ToolRegistry::new())
            .run("привет", &[], &RunContext::new("c1"))
            .await;

        assert_eq!(response.answer, "Привет, как дела?");
        assert_eq!(response.termination, Termination::FinalAnswer);
        assert_eq!(response.iteration_count, 1);
        assert_eq!(client.calls(), 1);
        assert!(client.requests.lock().unwrap()[0].structured);
    }

    #[tokio::test]
    async fn tool_observation_follows_assistant_turn() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FnTool::new("get_time", "current time", |_p| async {
            Ok(ToolOutcome::ok("12:00"))
        })));
        let client = Scripted::new(&[
            r#"{"thought": "need time", "action": {"type": "tool_call", "tool": "get_time", "params": {}}}"#,
            r#"{"thought": "done", "action": {"type": "final_answer", "answer": "It is 12:00"}}"#,
        ]);

        let response = orchestrator(client.clone(), registry)
            .run("what time is it", &[], &RunContext::new("c1"))
            .await;

        assert_eq!(response.answer, "It is 12:00");
        assert_eq!(response.tools_used, vec!["get_time".to_string()]);
        assert_eq!(response.steps.len(), 2);
        assert_eq!(response.steps[0].observation, "[get_time] ok: 12:00");

        let requests = client.requests.lock().unwrap();
        let second = &requests[1].messages;
        assert_eq!(second[second.len() - 2].role, Role::Assistant);
        assert!(second[second.len() - 2].content.contains("get_time"));
        assert_eq!(second[second.len() - 1].content, "Observation:\n[get_time] ok: 12:00");
    }

    #[tokio::test]
    async fn completion_errors_become_observations_and_learning_signals() {
        struct FailOnce {
            failed: Mutex<bool>,
        }

        #[async_trait]
        impl CompletionClient for FailOnce {
            async fn complete(&self, _request: CompletionRequest) -> anyhow::Result<String> {
                let mut failed = self.failed.lock().unwrap();
                if !*failed {
                    *failed = true;
                    anyhow::bail!("upstream timeout");
                }
                Ok(r#"{"action": {"type": "final_answer", "answer": "recovered"}}"#.to_string())
            }
        }

        #[derive(Default)]
        struct Signals(Mutex<Vec<LearningSignal>>);

        #[async_trait]
        impl LearningSink for Signals {
            async fn record_failure(&self, signal: LearningSignal) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(signal);
                Ok(())
            }
        }

        let signals = Arc::new(Signals::default());
        let orchestrator = Orchestrator::new(
            Arc::new(FailOnce {
                failed: Mutex::new(false),
            }),
            Arc::new(ToolDispatcher::new(Arc::new(ToolRegistry::new()))),
        )
        .with_learning(signals.clone());

        let response = orchestrator.run("hi", &[], &RunContext::new("c9")).await;
        assert_eq!(response.answer, "recovered");
        assert_eq!(response.iteration_count, 2);
        assert!(response.steps[0].observation.contains("upstream timeout"));

        let signals = signals.0.lock().unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].iteration, 1);
        assert_eq!(signals[0].conversation_id, "c9");
    }

    #[tokio::test]
    async fn remembered_facts_are_counted() {
        #[derive(Default)]
        struct Facts(Mutex<Vec<String>>);

        #[async_trait]
        impl MemorySink for Facts {
            async fn remember(&self, _conversation_id: &str, fact: &str) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(fact.to_string());
                Ok(())
            }
        }

        let facts = Arc::new(Facts::default());
        let client = Scripted::new(&[
            r#"{"action": {"type": "final_answer", "answer": "Noted"}, "should_remember": "prefers tea"}"#,
        ]);
        let response = orchestrator(client, ToolRegistry::new())
            .with_memory(facts.clone())
            .run("I like tea", &[], &RunContext::new("c1"))
            .await;

        assert_eq!(response.memory_entries_created, 1);
        assert_eq!(facts.0.lock().unwrap().as_slice(), ["prefers tea".to_string()]);
    }

    #[tokio::test]
    async fn low_quality_answer_is_replaced() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(FnTool::new("lookup", "lookup", |_p| async {
            Ok(ToolOutcome::ok("data"))
        })));
        let tool_turn = r#"{"action": {"type": "tool_call", "tool": "lookup"}}"#;
        let final_turn = r#"{"action": {"type": "final_answer", "answer": "A rather long but not very helpful answer about the data found."}}"#;
        let client = Scripted::new(&[
            tool_turn,
            tool_turn,
            final_turn,
            r#"{"quality": 0.3, "improved_answer": "A much better answer."}"#,
        ]);

        let response = orchestrator(client.clone(), registry)
            .run("look it up", &[], &RunContext::new("c1"))
            .await;

        assert_eq!(response.iteration_count, 3);
        assert_eq!(response.answer, "A much better answer.");
        assert_eq!(client.calls(), 4);
        assert!(!client.requests.lock().unwrap()[3].structured);
    }

    fn tool_step(index: usize, observation: &str) -> Step {
        Step {
            index,
            thought: "checking".to_string(),
            action: Action::ToolCall(action::ToolCall::new("get_weather", Default::default())),
            observation: observation.to_string(),
            duration_ms: 1,
        }
    }

    #[test]
    fn goal_check_reminds_when_steps_drift() {
        let orchestrator = orchestrator(Scripted::new(&["x"]), ToolRegistry::new());
        let steps = vec![
            tool_step(1, "[get_weather] ok: sunny, 21C"),
            tool_step(2, "[get_weather] ok: rain tomorrow"),
        ];
        let mut messages = vec![ChatMessage::user("сколько стоит билет в Казань")];

        orchestrator.check_goal("сколько стоит билет в Казань", &steps, &mut messages);

        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.starts_with(GOAL_REMINDER));
        assert!(messages[1].content.ends_with("сколько стоит билет в Казань"));
    }

    #[test]
    fn goal_check_stays_quiet_when_on_track() {
        let orchestrator = orchestrator(Scripted::new(&["x"]), ToolRegistry::new());
        let steps = vec![tool_step(1, "[get_weather] ok: Berlin weather is sunny")];
        let mut messages = vec![ChatMessage::user("weather in Berlin")];

        orchestrator.check_goal("weather in Berlin", &steps, &mut messages);

        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn empty_final_answer_asks_model_to_continue() {
        let client = Scripted::new(&[
            r#"{"action": {"type": "final_answer", "answer": ""}}"#,
            r#"{"action": {"type": "ask_user", "answer": "Which city?"}}"#,
        ]);
        let response = orchestrator(client, ToolRegistry::new())
            .run("weather", &[], &RunContext::new("c1"))
            .await;

        assert_eq!(response.termination, Termination::AskUser);
        assert_eq!(response.answer, "Which city?");
        assert_eq!(response.steps.len(), 2);
    }

    #[test]
    fn history_is_trimmed_to_limit() {
        let orchestrator = orchestrator(Scripted::new(&["x"]), ToolRegistry::new()).with_config(AgentConfig {
            history_limit: 2,
            ..AgentConfig::default()
        });
        let history = vec![
            ChatMessage::system("ignored"),
            ChatMessage::user("one"),
            ChatMessage::assistant("two"),
            ChatMessage::user("three"),
        ];
        let messages = orchestrator.initial_messages("four", &history);
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "three", "four"]);
    }
}
