use agentloop_core::telemetry::{TelemetryOptions, init_telemetry};
use agentloop_core::{Config, ConfigLoader, classify, parse};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use tokio::runtime::Runtime;

#[derive(Parser, Debug)]
#[command(
    name = "agentloop",
    version,
    about = "Reasoning/acting agent loop with DAG planning"
)]
struct Cli {
    /// Configuration file (defaults to $AGENTLOOP_CONFIG or ./agentloop.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one orchestration against the configured completion service.
    Run(RunArgs),
    /// Show whether a message would take the plan path.
    Classify(ClassifyArgs),
    /// Parse raw model output into an action and print it as JSON.
    Parse(ParseArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// User message to handle.
    message: String,

    /// Conversation ID passed to tools (random if omitted).
    #[arg(long)]
    conversation: Option<String>,

    /// Directory for the JSON step trace.
    #[arg(long)]
    trace_dir: Option<PathBuf>,

    /// Print the full response as JSON instead of the answer text.
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    message: String,
}

#[derive(Args, Debug)]
struct ParseArgs {
    /// Raw text; read from stdin when omitted.
    raw: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;

    init_telemetry(TelemetryOptions {
        // RUST_LOG wins over the configured level.
        env_filter: std::env::var("RUST_LOG")
            .is_err()
            .then(|| config.logging.level.clone()),
        ..TelemetryOptions::default()
    })?;
    agentloop_core::metrics::init_metrics_from_env("agentloop-cli");

    match cli.command {
        Command::Run(args) => {
            let rt = Runtime::new()?;
            rt.block_on(run_command(config, args))?;
        }
        Command::Classify(args) => classify_command(&config, &args)?,
        Command::Parse(args) => parse_command(args)?,
    }

    Ok(())
}

fn classify_command(config: &Config, args: &ClassifyArgs) -> Result<()> {
    let lexicon = config.lexicon()?;
    let verdict = classify(&args.message, &lexicon);
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

fn parse_command(args: ParseArgs) -> Result<()> {
    let raw = match args.raw {
        Some(raw) => raw,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read model output from stdin")?;
            buffer
        }
    };
    println!("{}", serde_json::to_string_pretty(&parse(&raw))?);
    Ok(())
}

#[cfg(feature = "openai-client")]
async fn run_command(config: Config, args: RunArgs) -> Result<()> {
    use agentloop_core::llm::OpenAiCompatibleClient;
    use agentloop_core::logging::{LogLocation, RunLogInput, log_run_completion};
    use agentloop_core::{
        JsonlLearningLog, LlmPlanner, Orchestrator, RunContext, ToolDispatcher, ToolRegistry,
        TraceSummary, persist_trace,
    };
    use std::sync::Arc;
    use tracing::{info, warn};

    let client = Arc::new(OpenAiCompatibleClient::new(&config.llm, config.llm_api_key()?)?);
    let registry = ToolRegistry::new();
    tools::register_builtin(&registry);
    register_research(&registry, &config, client.clone())?;

    let dispatcher = Arc::new(ToolDispatcher::with_config(
        Arc::new(registry),
        &config.dispatcher,
    ));
    let location = LogLocation::from_env();
    let orchestrator = Orchestrator::new(client.clone(), dispatcher)
        .with_planner(Arc::new(LlmPlanner::new(client)))
        .with_lexicon(Arc::new(config.lexicon()?))
        .with_config(config.agent.clone())
        .with_dag_config(config.dag.clone())
        .with_learning(Arc::new(JsonlLearningLog::new(location.clone())));

    let run_id = uuid::Uuid::new_v4().to_string();
    let conversation = args.conversation.unwrap_or_else(|| run_id.clone());
    info!(run_id = %run_id, conversation = %conversation, "starting run");

    let response = orchestrator
        .run(&args.message, &[], &RunContext::new(conversation.clone()))
        .await;

    let trace_path = match &args.trace_dir {
        Some(dir) => {
            let path = persist_trace(dir, &run_id, &response.steps)?;
            Some(path.display().to_string())
        }
        None => None,
    };

    if let Err(err) = log_run_completion(
        &location,
        RunLogInput {
            run_id,
            conversation_id: conversation,
            message: args.message.clone(),
            answer: response.answer.clone(),
            iterations: response.iteration_count,
            tools_used: response.tools_used.clone(),
            plan_used: response.plan_used,
            elapsed_ms: response.elapsed_ms,
            trace_path,
        },
    ) {
        warn!(error = %err, "failed to write run log");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        println!("{}", response.answer);
        eprintln!("{}", TraceSummary::from_steps(&response.steps).render_markdown());
    }
    Ok(())
}

#[cfg(all(feature = "openai-client", feature = "http-fetch"))]
fn register_research(
    registry: &agentloop_core::ToolRegistry,
    config: &Config,
    client: agentloop_core::DynCompletionClient,
) -> Result<()> {
    use agentloop_core::fetch::HttpFetcher;
    use agentloop_core::{WideResearch, register_research_tools};
    use std::sync::Arc;

    let Some(search_url) = &config.fetch.search_url else {
        tracing::debug!("no fetch.search_url configured, research tools disabled");
        return Ok(());
    };
    let web = Arc::new(HttpFetcher::new(search_url.clone(), &config.fetch)?);
    let research = WideResearch::from_config(web, config)?.with_completion(client);
    register_research_tools(registry, Arc::new(research));
    Ok(())
}

#[cfg(all(feature = "openai-client", not(feature = "http-fetch")))]
fn register_research(
    _registry: &agentloop_core::ToolRegistry,
    config: &Config,
    _client: agentloop_core::DynCompletionClient,
) -> Result<()> {
    if config.fetch.search_url.is_some() {
        tracing::warn!("fetch.search_url is set but the `http-fetch` feature is off");
    }
    Ok(())
}

#[cfg(not(feature = "openai-client"))]
async fn run_command(_config: Config, _args: RunArgs) -> Result<()> {
    anyhow::bail!("the run command needs the `openai-client` feature")
}

#[cfg(feature = "openai-client")]
mod tools {
    use agentloop_core::action::Params;
    use agentloop_core::{ToolContext, ToolHandler, ToolOutcome, ToolRegistry};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct CurrentTime;

    #[async_trait]
    impl ToolHandler for CurrentTime {
        fn name(&self) -> &str {
            "current_time"
        }

        fn description(&self) -> &str {
            "Current date and time in UTC"
        }

        async fn call(&self, _params: &Params, _context: &ToolContext) -> anyhow::Result<ToolOutcome> {
            let now = chrono::Utc::now();
            Ok(ToolOutcome::ok(now.to_rfc3339()).with_data(json!({ "unix": now.timestamp() })))
        }
    }

    pub fn register_builtin(registry: &ToolRegistry) {
        registry.register(Arc::new(CurrentTime));
    }
}
