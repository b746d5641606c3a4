use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentloop_core::config::ResearchConfig;
use agentloop_core::fetch::{PageData, SearchHit, WebFetcher};
use agentloop_core::orchestrator::APOLOGY;
use agentloop_core::{
    CompletionClient, CompletionRequest, EventCollector, FnTool, Orchestrator, PlanNode, Planner,
    RunContext, Stage, TaskGraph, Termination, ToolDispatcher, ToolOutcome, ToolRegistry,
    WideResearch, register_research_tools,
};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Answers structured turns from a closure and free-text calls with a fixed string.
struct ScriptedModel<F> {
    turn: F,
    free_text: Result<&'static str, &'static str>,
    structured_calls: AtomicUsize,
    free_calls: AtomicUsize,
}

impl<F> ScriptedModel<F>
where
    F: Fn(usize) -> String + Send + Sync,
{
    fn new(turn: F, free_text: Result<&'static str, &'static str>) -> Arc<Self> {
        Arc::new(Self {
            turn,
            free_text,
            structured_calls: AtomicUsize::new(0),
            free_calls: AtomicUsize::new(0),
        })
    }

    fn total_calls(&self) -> usize {
        self.structured_calls.load(Ordering::SeqCst) + self.free_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> CompletionClient for ScriptedModel<F>
where
    F: Fn(usize) -> String + Send + Sync,
{
    async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
        if request.structured {
            let n = self.structured_calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.turn)(n))
        } else {
            self.free_calls.fetch_add(1, Ordering::SeqCst);
            self.free_text
                .map(str::to_string)
                .map_err(|err| anyhow::anyhow!(err))
        }
    }
}

fn dispatcher(registry: ToolRegistry) -> Arc<ToolDispatcher> {
    Arc::new(ToolDispatcher::new(Arc::new(registry)))
}

#[tokio::test]
async fn loop_terminates_after_ceiling_plus_forced_final() {
    let model = ScriptedModel::new(
        |_| r#"{"thought": "try it", "action": {"type": "tool_call", "tool": "no_such_tool_xyz", "params": {}}}"#.to_string(),
        Ok("Here is what I could find."),
    );
    let orchestrator = Orchestrator::new(model.clone(), dispatcher(ToolRegistry::new()));

    let response = orchestrator
        .run("do something impossible", &[], &RunContext::new("conv-1"))
        .await;

    assert_eq!(model.total_calls(), 16);
    assert_eq!(response.termination, Termination::MaxIterations);
    assert_eq!(response.iteration_count, 15);
    assert_eq!(response.steps.len(), 15);
    assert!(response.tools_used.is_empty());
    assert!(response.steps.iter().all(|s| s.observation.contains("not found")));
    assert_eq!(response.answer, "Here is what I could find.");
}

#[tokio::test]
async fn ceiling_holds_when_a_real_tool_runs_every_turn() {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(FnTool::new("get_time", "current time", |_p| async {
        Ok(ToolOutcome::ok("12:00"))
    })));
    let model = ScriptedModel::new(
        |_| r#"{"thought": "again", "action": {"type": "tool_call", "tool": "get_time", "params": {}}}"#.to_string(),
        Ok("It is 12:00."),
    );

    let response = Orchestrator::new(model.clone(), dispatcher(registry))
        .run("what time is it in Tokyo", &[], &RunContext::new("conv-1b"))
        .await;

    assert_eq!(model.total_calls(), 16);
    assert_eq!(model.free_calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.termination, Termination::MaxIterations);
    assert_eq!(response.iteration_count, 15);
    assert_eq!(response.tools_used, vec!["get_time".to_string()]);
    assert_eq!(response.answer, "It is 12:00.");
}

#[tokio::test]
async fn failed_forced_final_returns_apology() {
    let model = ScriptedModel::new(
        |_| r#"{"action": {"type": "tool_call", "tool": "missing"}}"#.to_string(),
        Err("service down"),
    );
    let response = Orchestrator::new(model, dispatcher(ToolRegistry::new()))
        .run("hello", &[], &RunContext::new("conv-1"))
        .await;
    assert_eq!(response.answer, APOLOGY);
}

#[tokio::test]
async fn parallel_results_keep_request_order_and_isolate_failures() {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(FnTool::new("slow_lookup", "slow", |_p| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ToolOutcome::ok("slow done"))
    })));
    registry.register(Arc::new(FnTool::new("broken", "always fails", |_p| async {
        Err(anyhow::anyhow!("database unavailable"))
    })));
    registry.register(Arc::new(FnTool::new("fast_lookup", "fast", |_p| async {
        Ok(ToolOutcome::ok("fast done"))
    })));

    let model = ScriptedModel::new(
        |n| match n {
            0 => json!({
                "thought": "fan out",
                "action": {"type": "parallel_tools", "calls": [
                    {"tool": "slow_lookup", "params": {}},
                    {"tool": "broken", "params": {}},
                    {"tool": "fast_lookup", "params": {}}
                ]}
            })
            .to_string(),
            _ => r#"{"action": {"type": "final_answer", "answer": "combined"}}"#.to_string(),
        },
        Ok("unused"),
    );

    let response = Orchestrator::new(model, dispatcher(registry))
        .run("look everything up", &[], &RunContext::new("conv-2"))
        .await;

    assert_eq!(response.answer, "combined");
    let lines: Vec<&str> = response.steps[0].observation.lines().collect();
    assert_eq!(
        lines,
        vec![
            "[slow_lookup] ok: slow done",
            "[broken] failed: error: database unavailable",
            "[fast_lookup] ok: fast done",
        ]
    );
    assert_eq!(
        response.tools_used,
        vec!["slow_lookup".to_string(), "broken".to_string(), "fast_lookup".to_string()]
    );
}

#[tokio::test]
async fn abort_skips_the_loop() {
    let model = ScriptedModel::new(|_| "never used".to_string(), Ok("Stopped early."));
    let abort = CancellationToken::new();
    abort.cancel();

    let response = Orchestrator::new(model.clone(), dispatcher(ToolRegistry::new()))
        .run("hello", &[], &RunContext::new("conv-3").with_abort(abort))
        .await;

    assert_eq!(response.termination, Termination::Aborted);
    assert_eq!(response.iteration_count, 0);
    assert_eq!(model.total_calls(), 1);
    assert_eq!(response.answer, "Stopped early.");
}

#[tokio::test]
async fn ask_user_ends_the_run() {
    let model = ScriptedModel::new(
        |_| r#"{"thought": "unclear", "action": {"type": "ask_user", "answer": "Which city do you mean?"}, "confidence": 0.4}"#.to_string(),
        Ok("unused"),
    );
    let response = Orchestrator::new(model, dispatcher(ToolRegistry::new()))
        .run("weather tomorrow", &[], &RunContext::new("conv-4"))
        .await;

    assert_eq!(response.termination, Termination::AskUser);
    assert_eq!(response.answer, "Which city do you mean?");
    assert_eq!(response.steps[0].thought, "unclear");
}

#[tokio::test]
async fn tool_files_are_collected_for_delivery() {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(FnTool::new("export_report", "export", |_p| async {
        Ok(ToolOutcome::ok("exported").with_data(json!({
            "send_file": true,
            "filepath": "/tmp/out/report.xlsx",
            "filename": "report.xlsx"
        })))
    })));
    let model = ScriptedModel::new(
        |n| match n {
            0 => r#"{"action": {"type": "tool_call", "tool": "export_report"}}"#.to_string(),
            _ => r#"{"action": {"type": "final_answer", "answer": "Report attached."}}"#.to_string(),
        },
        Ok("unused"),
    );

    let response = Orchestrator::new(model, dispatcher(registry))
        .run("export the report", &[], &RunContext::new("conv-5"))
        .await;

    assert_eq!(response.files_to_send.len(), 1);
    assert_eq!(response.files_to_send[0].path, "/tmp/out/report.xlsx");
    assert_eq!(response.files_to_send[0].name, "report.xlsx");
}

struct FixedPlanner {
    graph: Option<TaskGraph>,
    calls: AtomicUsize,
}

#[async_trait]
impl Planner for FixedPlanner {
    async fn generate_plan(&self, _goal: &str, tools: &str) -> anyhow::Result<TaskGraph> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(tools.contains("shop_search"));
        self.graph
            .clone()
            .ok_or_else(|| anyhow::anyhow!("planner offline"))
    }

    async fn revise_plan(
        &self,
        _graph: &TaskGraph,
        _failed_node: &str,
        _error: &str,
    ) -> anyhow::Result<TaskGraph> {
        anyhow::bail!("no revisions")
    }
}

fn shop_registry() -> ToolRegistry {
    let registry = ToolRegistry::new();
    registry.register(Arc::new(FnTool::new("shop_search", "find products", |_p| async {
        Ok(ToolOutcome::ok("Phone A 500$, Phone B 450$"))
    })));
    registry
}

#[tokio::test]
async fn complex_request_routes_to_plan_path() {
    let graph = TaskGraph::from_nodes(
        "найди лучший, сравни цену и камеру",
        vec![
            PlanNode::new("search", "find phones").with_tool("shop_search"),
            PlanNode::new("compare", "compare price and camera").with_dependency("search"),
        ],
    )
    .unwrap();
    let planner = Arc::new(FixedPlanner {
        graph: Some(graph),
        calls: AtomicUsize::new(0),
    });
    let model = ScriptedModel::new(|_| "not expected".to_string(), Ok("Phone B wins."));
    let (events, mut receiver) = EventCollector::new();

    let response = Orchestrator::new(model.clone(), dispatcher(shop_registry()))
        .with_planner(planner.clone())
        .with_events(events)
        .run("найди лучший, сравни цену и камеру", &[], &RunContext::new("conv-6"))
        .await;

    assert_eq!(response.termination, Termination::Plan);
    assert!(response.plan_used);
    assert_eq!(response.answer, "Phone B wins.");
    assert_eq!(response.tools_used, vec!["shop_search".to_string()]);
    assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(model.structured_calls.load(Ordering::SeqCst), 0);

    let events = agentloop_core::events::drain(&mut receiver);
    let plan_nodes = events.iter().filter(|e| e.stage() == Stage::PlanNode).count();
    assert_eq!(plan_nodes, 4, "start and finish for each node");
}

#[tokio::test]
async fn failed_plan_falls_back_to_the_loop() {
    let planner = Arc::new(FixedPlanner {
        graph: None,
        calls: AtomicUsize::new(0),
    });
    let model = ScriptedModel::new(
        |_| r#"{"action": {"type": "final_answer", "answer": "Answered step by step."}}"#.to_string(),
        Ok("unused"),
    );

    let response = Orchestrator::new(model, dispatcher(shop_registry()))
        .with_planner(planner.clone())
        .run("найди лучший, сравни цену и камеру", &[], &RunContext::new("conv-7"))
        .await;

    assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.termination, Termination::FinalAnswer);
    assert!(!response.plan_used);
    assert_eq!(response.answer, "Answered step by step.");
}

#[tokio::test]
async fn single_step_plan_stays_in_the_loop() {
    let graph = TaskGraph::from_nodes(
        "найди лучший, сравни цену и камеру",
        vec![PlanNode::new("search", "find phones").with_tool("shop_search")],
    )
    .unwrap();
    let planner = Arc::new(FixedPlanner {
        graph: Some(graph),
        calls: AtomicUsize::new(0),
    });
    let model = ScriptedModel::new(
        |n| match n {
            0 => r#"{"action": {"type": "tool_call", "tool": "shop_search", "params": {}}}"#.to_string(),
            _ => r#"{"action": {"type": "final_answer", "answer": "Phone B is cheaper."}}"#.to_string(),
        },
        Ok("plan synthesis"),
    );

    let response = Orchestrator::new(model.clone(), dispatcher(shop_registry()))
        .with_planner(planner.clone())
        .run("найди лучший, сравни цену и камеру", &[], &RunContext::new("conv-7b"))
        .await;

    assert_eq!(planner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(response.termination, Termination::FinalAnswer);
    assert!(!response.plan_used);
    assert_eq!(response.answer, "Phone B is cheaper.");
    assert_eq!(response.tools_used, vec!["shop_search".to_string()]);
    assert_eq!(model.free_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn simple_request_skips_the_planner() {
    let planner = Arc::new(FixedPlanner {
        graph: None,
        calls: AtomicUsize::new(0),
    });
    let model = ScriptedModel::new(|_| "Привет, как дела?".to_string(), Ok("unused"));

    let response = Orchestrator::new(model, dispatcher(shop_registry()))
        .with_planner(planner.clone())
        .run("привет", &[], &RunContext::new("conv-8"))
        .await;

    assert_eq!(planner.calls.load(Ordering::SeqCst), 0);
    assert_eq!(response.answer, "Привет, как дела?");
}

struct OnePageWeb {
    fetched: Mutex<Vec<String>>,
}

#[async_trait]
impl WebFetcher for OnePageWeb {
    async fn search(&self, query: &str, _max_results: usize) -> anyhow::Result<Vec<SearchHit>> {
        Ok(vec![SearchHit {
            title: format!("About {query}"),
            url: "https://en.wikipedia.org/wiki/Rust".to_string(),
            snippet: String::new(),
        }])
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<PageData> {
        self.fetched.lock().unwrap().push(url.to_string());
        Ok(PageData {
            url: url.to_string(),
            title: "Rust".to_string(),
            text: "Rust 1.0 was released in 2015 after years of development.\nshort".to_string(),
            success: true,
            ..PageData::default()
        })
    }
}

#[tokio::test]
async fn research_is_callable_as_a_tool() {
    let web = Arc::new(OnePageWeb {
        fetched: Mutex::new(Vec::new()),
    });
    let research = Arc::new(WideResearch::new(web.clone(), ResearchConfig::default()));
    let registry = ToolRegistry::new();
    register_research_tools(&registry, research.clone());

    let model = ScriptedModel::new(
        |n| match n {
            0 => r#"{"action": {"type": "tool_call", "tool": "quick_research", "params": {"query": "rust release"}}}"#.to_string(),
            _ => r#"{"action": {"type": "final_answer", "answer": "Rust 1.0 shipped in 2015."}}"#.to_string(),
        },
        Ok("unused"),
    );

    let response = Orchestrator::new(model, dispatcher(registry))
        .run("when was rust released", &[], &RunContext::new("conv-9"))
        .await;

    assert_eq!(response.tools_used, vec!["quick_research".to_string()]);
    assert!(response.steps[0].observation.starts_with("[quick_research] ok:"));
    assert_eq!(web.fetched.lock().unwrap().len(), 1);
    assert_eq!(research.history(5).await.len(), 1);
}
