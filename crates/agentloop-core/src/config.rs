use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::aggregate::ScoringWeights;
use crate::lexicon::Lexicon;
use crate::AgentLoopError;

const DEFAULT_CONFIG_PATH: &str = "agentloop.toml";
const CONFIG_PATH_ENV: &str = "AGENTLOOP_CONFIG";

/// Top-level configuration. Every section has defaults, so an empty file is valid.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub agent: AgentConfig,
    pub dispatcher: DispatcherConfig,
    pub dag: DagConfig,
    pub research: ResearchConfig,
    pub fetch: FetchConfig,
    pub scoring: ScoringWeights,
    pub logging: LoggingConfig,
    /// Optional TOML file replacing the built-in keyword lists.
    pub lexicon_path: Option<PathBuf>,
}

impl Config {
    pub fn llm_api_key(&self) -> Result<SecretValue, AgentLoopError> {
        self.llm.api_key()
    }

    /// Load the configured lexicon, or the built-in one when none is set.
    pub fn lexicon(&self) -> Result<Lexicon, AgentLoopError> {
        match &self.lexicon_path {
            Some(path) => Lexicon::from_path(path),
            None => Ok(Lexicon::default()),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a provided path or discoverable defaults.
    ///
    /// Resolution order:
    /// 1. Explicit `path` argument.
    /// 2. `AGENTLOOP_CONFIG` environment variable.
    /// 3. `agentloop.toml` in the current working directory.
    ///
    /// A missing default file yields the default configuration; a missing
    /// explicitly requested file is an error.
    pub fn load(path: Option<PathBuf>) -> Result<Config, AgentLoopError> {
        let (candidate, explicit) = resolve_path(path);
        if !explicit && !candidate.exists() {
            tracing::debug!(path = %candidate.display(), "no config file, using defaults");
            return Ok(Config::default());
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| AgentLoopError::config_io(candidate.clone(), err))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Config, AgentLoopError> {
        let config: Config = toml::from_str(raw)
            .map_err(|err| AgentLoopError::InvalidConfiguration(err.to_string()))?;
        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), AgentLoopError> {
        let invalid = |msg: &str| Err(AgentLoopError::InvalidConfiguration(msg.to_string()));

        if config.llm.api_key_env.trim().is_empty() {
            return invalid("llm.api_key_env must reference an environment variable");
        }
        if config.agent.max_iterations == 0 {
            return invalid("agent.max_iterations must be at least 1");
        }
        if !(0.0..=1.0).contains(&config.dispatcher.similarity_cutoff) {
            return invalid("dispatcher.similarity_cutoff must be within [0, 1]");
        }
        if config.research.max_concurrent_subagents == 0 || config.fetch.max_concurrent_fetches == 0 {
            return invalid("concurrency limits must be at least 1");
        }
        if config.research.min_subqueries > config.research.max_subqueries {
            return invalid("research.min_subqueries exceeds research.max_subqueries");
        }
        if config.scoring.min > config.scoring.max {
            return invalid("scoring.min exceeds scoring.max");
        }
        Ok(())
    }
}

/// Returns the candidate path and whether it was requested explicitly.
fn resolve_path(path: Option<PathBuf>) -> (PathBuf, bool) {
    if let Some(path) = path {
        return (path, true);
    }

    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return (PathBuf::from(from_env), true);
        }
    }

    (Path::new(DEFAULT_CONFIG_PATH).to_path_buf(), false)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
}

impl LlmConfig {
    /// Read the key from the variable named by `api_key_env`. Keys never live in the file.
    pub fn api_key(&self) -> Result<SecretValue, AgentLoopError> {
        match env::var(&self.api_key_env) {
            Ok(value) if !value.trim().is_empty() => Ok(SecretValue(value.trim().to_string())),
            _ => Err(AgentLoopError::MissingSecret(self.api_key_env.clone())),
        }
    }
}

/// Completion service key with a redacted `Debug`.
#[derive(Clone)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_ms: 60_000,
            max_retries: 2,
            initial_backoff_ms: 500,
        }
    }
}

/// Reasoning loop limits and thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    /// Minimum iterations before the final answer gets a quality check.
    pub reflection_threshold: usize,
    pub goal_check_interval: usize,
    pub quality_threshold: f64,
    pub min_reflect_chars: usize,
    /// Prior conversation turns kept in the prompt.
    pub history_limit: usize,
    pub turn_temperature: f32,
    pub turn_max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 15,
            reflection_threshold: 3,
            goal_check_interval: 3,
            quality_threshold: 0.6,
            min_reflect_chars: 50,
            history_limit: 20,
            turn_temperature: 0.3,
            turn_max_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub similarity_cutoff: f64,
    pub cache_ttl_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            similarity_cutoff: 0.6,
            cache_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DagConfig {
    pub max_concurrent_nodes: usize,
    /// Ask the planner for a one-shot revision when a node fails.
    pub revise_on_failure: bool,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            max_concurrent_nodes: 8,
            revise_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResearchConfig {
    pub max_concurrent_subagents: usize,
    pub max_sources_per_subquery: usize,
    pub follow_links: bool,
    pub max_findings_per_page: usize,
    pub min_paragraph_chars: usize,
    pub max_fact_chars: usize,
    pub max_text_per_page: usize,
    pub min_subqueries: usize,
    pub max_subqueries: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_subagents: 5,
            max_sources_per_subquery: 5,
            follow_links: true,
            max_findings_per_page: 15,
            min_paragraph_chars: 30,
            max_fact_chars: 500,
            max_text_per_page: 2000,
            min_subqueries: 3,
            max_subqueries: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// SearXNG-compatible JSON search endpoint; research tools stay off without it.
    pub search_url: Option<String>,
    pub max_concurrent_fetches: usize,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub initial_backoff_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            search_url: None,
            max_concurrent_fetches: 5,
            timeout_ms: 15_000,
            max_retries: 2,
            initial_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
