//! AgentLoop core: a reasoning/acting loop over pluggable tools.
//!
//! The [`Orchestrator`] drives a language model through think → act →
//! observe turns, fans independent tool calls out concurrently, executes
//! multi-step task graphs in dependency waves, and can run wide multi-source
//! research with deduplication and confidence scoring. The completion service,
//! tool catalogue, fetcher and planner are collaborators injected by the host.

pub mod action;
pub mod aggregate;
pub mod classify;
pub mod config;
pub mod dag;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fetch;
pub mod lexicon;
pub mod llm;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod research;
pub mod telemetry;
pub mod trace;

pub use action::{Action, ParsedAction, ToolCall, clean_answer, parse};
pub use classify::{ComplexityVerdict, classify, is_complex};
pub use config::{Config, ConfigLoader, SecretValue};
pub use dag::{DagExecutor, DagRun, DispatchNodeExecutor, NodeExecutor, NodeOutput, NodeResult};
pub use dispatch::{
    FileAttachment, Invocation, ToolCatalogue, ToolContext, ToolDispatcher, ToolOutcome,
};
pub use error::{AgentLoopError, TaskError};
pub use events::{Event, EventCollector, Outcome, Stage};
pub use lexicon::Lexicon;
pub use llm::{ChatMessage, CompletionClient, CompletionRequest, DynCompletionClient, Role};
pub use logging::{JsonlLearningLog, LogLocation};
pub use orchestrator::{
    LearningSignal, LearningSink, MemorySink, Orchestrator, Response, RunContext, Step,
    Termination,
};
pub use planner::{LlmPlanner, PlanNode, Planner, TaskGraph};
pub use registry::{FnTool, ToolHandler, ToolRegistry};
pub use research::{ResearchReport, WideResearch, register_research_tools};
pub use trace::{TraceSummary, persist_trace};
