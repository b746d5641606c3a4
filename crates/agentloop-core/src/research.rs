//! Wide research: parallel sub-agents over one query, aggregated into a report.
//!
//! Each sub-query is handled by an isolated sub-agent (search, fetch, optional
//! one-level link following, paragraph extraction). Sub-agents share nothing
//! but a semaphore capping how many run at once; a failing sub-agent is
//! recorded in the report and never aborts its siblings.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{RwLock, Semaphore};
use tracing::instrument;

use crate::action::Params;
use crate::aggregate::{self, Contradiction, Finding, ScoringWeights};
use crate::config::{Config, ResearchConfig};
use crate::dispatch::{ToolContext, ToolOutcome};
use crate::events::{EventCollector, Outcome, Stage};
use crate::error::AgentLoopError;
use crate::fetch::{BoundedFetcher, DynWebFetcher, PageData};
use crate::lexicon::Lexicon;
use crate::llm::{CompletionRequest, DynCompletionClient, complete_json};
use crate::registry::{ToolHandler, ToolRegistry};

const SEARCH_HEADROOM: usize = 3;
const LINKS_SCANNED_PER_PAGE: usize = 20;
const MIN_LINK_WORD_CHARS: usize = 4;
const MIN_GENERATED_SUBQUERIES: usize = 2;
const MAX_INSIGHTS: usize = 7;
const INSIGHT_FACTS: usize = 30;
const INSIGHT_CONTRADICTIONS: usize = 5;
const COMPARE_MAX_SUBQUERIES: usize = 10;
const COMPARE_SOURCES: usize = 3;
const QUICK_SOURCES: usize = 3;
const HISTORY_CAPACITY: usize = 50;
const SEARCH_ENGINE_HOSTS: [&str; 3] = ["duckduckgo.com", "google.com/search", "bing.com/search"];

/// Outcome of one sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub task_id: String,
    pub query: String,
    pub findings: Vec<Finding>,
    pub sources_checked: usize,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub query: String,
    pub findings: Vec<Finding>,
    pub contradictions: Vec<Contradiction>,
    pub insights: Vec<String>,
    pub overall_confidence: f64,
    pub sub_results: Vec<SubAgentResult>,
    pub total_sources: usize,
    pub duration_ms: u64,
    pub created_at: String,
}

fn percent(value: f64) -> String {
    format!("{:.0}%", value * 100.0)
}

fn clip(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

impl ResearchReport {
    /// Compact plain-text rendering for chat delivery.
    pub fn summary(&self, max_findings: usize) -> String {
        let mut parts = vec![
            format!("Research: {}", self.query),
            format!("Time: {}ms | {}", self.duration_ms, self.created_at),
            format!(
                "Sub-agents: {} | Sources: {} | Findings: {}",
                self.sub_results.len(),
                self.total_sources,
                self.findings.len()
            ),
            format!("Confidence: {}", percent(self.overall_confidence)),
        ];

        if !self.insights.is_empty() {
            parts.push("\nKey insights:".to_string());
            for (i, insight) in self.insights.iter().take(10).enumerate() {
                parts.push(format!("  {}. {}", i + 1, insight));
            }
        }

        if !self.contradictions.is_empty() {
            parts.push(format!("\nContradictions ({}):", self.contradictions.len()));
            for c in self.contradictions.iter().take(5) {
                parts.push(format!("  - {}", clip(&c.description, 200)));
            }
        }

        if !self.findings.is_empty() {
            let shown = max_findings.min(self.findings.len());
            parts.push(format!("\nFindings (top {shown}):"));
            for f in aggregate::ranked(&self.findings).into_iter().take(max_findings) {
                let filled = ((f.confidence * 5.0) as usize).min(5);
                let bar = format!("{}{}", "#".repeat(filled), ".".repeat(5 - filled));
                parts.push(format!("  [{bar}] {}", clip(&f.fact, 200)));
                parts.push(format!("       {} | {}", f.source_title, clip(&f.source_url, 60)));
            }
        }

        parts.join("\n")
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            format!("# Research: {}", self.query),
            String::new(),
            format!("**Date:** {}  ", self.created_at),
            format!("**Sub-agents:** {}  ", self.sub_results.len()),
            format!("**Sources:** {}  ", self.total_sources),
            format!("**Findings:** {}  ", self.findings.len()),
            format!("**Confidence:** {}  ", percent(self.overall_confidence)),
            format!("**Duration:** {}ms  ", self.duration_ms),
            String::new(),
        ];

        if !self.insights.is_empty() {
            lines.push("## Key insights\n".to_string());
            for (i, insight) in self.insights.iter().enumerate() {
                lines.push(format!("{}. {}", i + 1, insight));
            }
            lines.push(String::new());
        }

        if !self.contradictions.is_empty() {
            lines.push("## Contradictions\n".to_string());
            for c in &self.contradictions {
                lines.push(format!("- {}", c.description));
            }
            lines.push(String::new());
        }

        if !self.findings.is_empty() {
            lines.push("## Findings\n".to_string());
            lines.push("| # | Confidence | Fact | Source |".to_string());
            lines.push("|---|---|---|---|".to_string());
            for (i, f) in aggregate::ranked(&self.findings).into_iter().enumerate() {
                lines.push(format!(
                    "| {} | {} | {} | {} |",
                    i + 1,
                    percent(f.confidence),
                    clip(&f.fact, 150).replace('|', "\\|"),
                    clip(&f.source_title, 30).replace('|', "\\|")
                ));
            }
            lines.push(String::new());
        }

        if !self.sub_results.is_empty() {
            lines.push("## Sub-agents\n".to_string());
            for sr in &self.sub_results {
                let status = if sr.success { "ok" } else { "failed" };
                let mut line = format!(
                    "- [{status}] **{}**: {} ({} sources, {} findings, {}ms)",
                    sr.task_id,
                    sr.query,
                    sr.sources_checked,
                    sr.findings.len(),
                    sr.duration_ms
                );
                if let Some(error) = &sr.error {
                    line.push_str(&format!(" error: {error}"));
                }
                lines.push(line);
            }
        }

        lines.join("\n")
    }

    pub fn digest(&self) -> ReportDigest {
        ReportDigest {
            query: self.query.clone(),
            findings: self.findings.len(),
            sources: self.total_sources,
            confidence: self.overall_confidence,
            date: self.created_at.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// History entry for a finished research run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDigest {
    pub query: String,
    pub findings: usize,
    pub sources: usize,
    pub confidence: f64,
    pub date: String,
    pub duration_ms: u64,
}

/// Options for one research invocation.
#[derive(Debug, Clone, Default)]
pub struct ResearchRequest {
    pub query: String,
    /// Explicit sub-queries; generated when absent.
    pub sub_queries: Option<Vec<String>>,
    pub max_sources: Option<usize>,
    pub follow_links: Option<bool>,
    /// Ask the completion service for sub-queries and insights.
    pub use_reasoning: bool,
    /// Extra context the insight prompt should take into account.
    pub business_context: Option<String>,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            use_reasoning: true,
            ..Self::default()
        }
    }
}

pub struct WideResearch {
    fetcher: DynWebFetcher,
    completion: Option<DynCompletionClient>,
    lexicon: Arc<Lexicon>,
    weights: ScoringWeights,
    config: ResearchConfig,
    semaphore: Arc<Semaphore>,
    history: RwLock<VecDeque<ReportDigest>>,
    events: Option<EventCollector>,
}

impl WideResearch {
    pub fn new(fetcher: DynWebFetcher, config: ResearchConfig) -> Self {
        let permits = config.max_concurrent_subagents.max(1);
        Self {
            fetcher,
            completion: None,
            lexicon: Arc::new(Lexicon::default()),
            weights: ScoringWeights::default(),
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            history: RwLock::new(VecDeque::new()),
            events: None,
        }
    }

    /// Engine over `fetcher` with the fetch limits, research settings, scoring
    /// weights and lexicon from `config`.
    pub fn from_config(fetcher: DynWebFetcher, config: &Config) -> Result<Self, AgentLoopError> {
        let bounded = BoundedFetcher::new(fetcher, &config.fetch);
        Ok(Self::new(Arc::new(bounded), config.research.clone())
            .with_lexicon(Arc::new(config.lexicon()?))
            .with_weights(config.scoring.clone()))
    }

    pub fn with_completion(mut self, completion: DynCompletionClient) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_lexicon(mut self, lexicon: Arc<Lexicon>) -> Self {
        self.lexicon = lexicon;
        self
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_events(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    /// Research `query` with generated sub-queries and deep fetching.
    pub async fn research(&self, query: &str, max_sources_per_subquery: usize) -> ResearchReport {
        let mut request = ResearchRequest::new(query);
        request.max_sources = Some(max_sources_per_subquery);
        self.research_with(request).await
    }

    /// Single sub-query, shallow fetch, no reasoning calls.
    pub async fn quick_research(&self, query: &str) -> ResearchReport {
        self.research_with(ResearchRequest {
            query: query.to_string(),
            sub_queries: Some(vec![query.to_string()]),
            max_sources: Some(QUICK_SOURCES),
            follow_links: Some(false),
            use_reasoning: false,
            business_context: None,
        })
        .await
    }

    /// Compare items on criteria, one sub-query per pair.
    pub async fn compare_research(&self, items: &[String], criteria: &[String]) -> ResearchReport {
        let mut sub_queries = Vec::new();
        for item in items {
            if criteria.is_empty() {
                sub_queries.push(format!("{item} {}", self.lexicon.default_compare_criteria));
            } else {
                sub_queries.extend(criteria.iter().map(|criterion| format!("{item} {criterion}")));
            }
        }
        sub_queries.truncate(COMPARE_MAX_SUBQUERIES);

        self.research_with(ResearchRequest {
            query: format!("Comparison: {}", items.join(", ")),
            sub_queries: Some(sub_queries),
            max_sources: Some(COMPARE_SOURCES),
            follow_links: Some(false),
            use_reasoning: true,
            business_context: None,
        })
        .await
    }

    #[instrument(skip(self, request), fields(query = %request.query))]
    pub async fn research_with(&self, request: ResearchRequest) -> ResearchReport {
        let started = Instant::now();
        let max_sources = request
            .max_sources
            .unwrap_or(self.config.max_sources_per_subquery)
            .max(1);
        let follow_links = request.follow_links.unwrap_or(self.config.follow_links);

        let sub_queries = match request.sub_queries.clone() {
            Some(queries) if !queries.is_empty() => queries,
            _ => self.sub_queries(&request.query, request.use_reasoning).await,
        };
        tracing::info!(sub_agents = sub_queries.len(), "starting wide research");

        let agents = sub_queries.iter().enumerate().map(|(i, sub_query)| {
            self.run_sub_agent(format!("SA-{}", i + 1), sub_query, max_sources, follow_links)
        });
        let sub_results = join_all(agents).await;

        let total_sources = sub_results.iter().map(|r| r.sources_checked).sum();
        let raw: Vec<Finding> = sub_results
            .iter()
            .flat_map(|r| r.findings.iter().cloned())
            .collect();
        let aggregation = aggregate::aggregate(raw, &self.lexicon, &self.weights);

        let insights = self
            .insights(
                &request.query,
                &aggregation.findings,
                &aggregation.contradictions,
                request.business_context.as_deref(),
                request.use_reasoning,
            )
            .await;

        let report = ResearchReport {
            query: request.query.clone(),
            overall_confidence: aggregate::overall_confidence(&aggregation.findings),
            findings: aggregation.findings,
            contradictions: aggregation.contradictions,
            insights,
            sub_results,
            total_sources,
            duration_ms: started.elapsed().as_millis() as u64,
            created_at: chrono::Local::now().format("%Y-%m-%d %H:%M").to_string(),
        };

        tracing::info!(
            duration_ms = report.duration_ms,
            findings = report.findings.len(),
            sources = report.total_sources,
            contradictions = report.contradictions.len(),
            "wide research complete"
        );

        let mut history = self.history.write().await;
        history.push_back(report.digest());
        while history.len() > HISTORY_CAPACITY {
            history.pop_front();
        }
        drop(history);

        report
    }

    /// Most recent report digests, oldest first.
    pub async fn history(&self, limit: usize) -> Vec<ReportDigest> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    async fn sub_queries(&self, query: &str, use_reasoning: bool) -> Vec<String> {
        if use_reasoning {
            if let Some(client) = &self.completion {
                match self.generate_sub_queries(client, query).await {
                    Ok(queries) => return queries,
                    Err(err) => tracing::debug!(error = %err, "sub-query generation failed"),
                }
            }
        }
        self.fallback_sub_queries(query)
    }

    async fn generate_sub_queries(
        &self,
        client: &DynCompletionClient,
        query: &str,
    ) -> anyhow::Result<Vec<String>> {
        let prompt = format!(
            "Split the research request into {}-{} concrete web search queries that can run in parallel.\n\n\
             Request: {query}\n\nReply with JSON: {{\"sub_queries\": [\"query 1\", \"query 2\"]}}",
            self.config.min_subqueries, self.config.max_subqueries
        );
        let value = complete_json(
            client.as_ref(),
            CompletionRequest::prompt(prompt)
                .with_temperature(0.3)
                .with_max_tokens(500),
        )
        .await?;

        let queries = string_list(value.get("sub_queries"));
        if queries.len() < MIN_GENERATED_SUBQUERIES {
            anyhow::bail!("too few sub-queries generated ({})", queries.len());
        }
        Ok(queries.into_iter().take(self.config.max_subqueries).collect())
    }

    fn fallback_sub_queries(&self, query: &str) -> Vec<String> {
        std::iter::once(query.to_string())
            .chain(
                self.lexicon
                    .subquery_suffixes
                    .iter()
                    .map(|suffix| format!("{query} {suffix}")),
            )
            .take(self.config.max_subqueries.max(1))
            .collect()
    }

    async fn run_sub_agent(
        &self,
        task_id: String,
        query: &str,
        max_sources: usize,
        follow_links: bool,
    ) -> SubAgentResult {
        let started = Instant::now();
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                return SubAgentResult {
                    task_id,
                    query: query.to_string(),
                    findings: Vec::new(),
                    sources_checked: 0,
                    success: false,
                    error: Some(err.to_string()),
                    duration_ms: 0,
                };
            }
        };

        if let Some(events) = &self.events {
            events.emit_start(&task_id, Stage::SubAgent, query);
        }

        let result = self.gather(&task_id, query, max_sources, follow_links).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let sub_result = match result {
            Ok((findings, sources_checked)) => SubAgentResult {
                task_id,
                query: query.to_string(),
                findings,
                sources_checked,
                success: true,
                error: None,
                duration_ms,
            },
            Err(err) => {
                tracing::warn!(task_id = %task_id, error = %err, "sub-agent failed");
                SubAgentResult {
                    task_id,
                    query: query.to_string(),
                    findings: Vec::new(),
                    sources_checked: 0,
                    success: false,
                    error: Some(format!("{err:#}")),
                    duration_ms,
                }
            }
        };

        if let Some(events) = &self.events {
            let outcome = match &sub_result.error {
                None => Outcome::Success,
                Some(error) => Outcome::failure(error.clone()),
            };
            events.emit_finish(&sub_result.task_id, Stage::SubAgent, outcome, duration_ms);
        }
        sub_result
    }

    async fn gather(
        &self,
        task_id: &str,
        query: &str,
        max_sources: usize,
        follow_links: bool,
    ) -> anyhow::Result<(Vec<Finding>, usize)> {
        let hits = self
            .fetcher
            .search(query, max_sources + SEARCH_HEADROOM)
            .await?;
        let urls: Vec<String> = hits
            .into_iter()
            .map(|hit| hit.url)
            .filter(|url| !url.is_empty() && !SEARCH_ENGINE_HOSTS.iter().any(|h| url.contains(h)))
            .take(max_sources)
            .collect();

        let mut visited: HashSet<String> = urls.iter().cloned().collect();
        let mut pages = self.fetch_all(&urls).await;

        if follow_links {
            let words: Vec<String> = query
                .to_lowercase()
                .split_whitespace()
                .filter(|w| w.chars().count() >= MIN_LINK_WORD_CHARS)
                .map(str::to_string)
                .collect();
            let mut follow = Vec::new();
            for page in pages.iter().filter(|p| p.success) {
                for link in page.links.iter().take(LINKS_SCANNED_PER_PAGE) {
                    let text = link.text.to_lowercase();
                    if !link.url.is_empty()
                        && !visited.contains(&link.url)
                        && words.iter().any(|w| text.contains(w.as_str()))
                    {
                        visited.insert(link.url.clone());
                        follow.push(link.url.clone());
                    }
                }
            }
            follow.truncate(max_sources);
            if !follow.is_empty() {
                tracing::debug!(task_id, followed = follow.len(), "following related links");
                pages.extend(self.fetch_all(&follow).await);
            }
        }

        let mut findings = Vec::new();
        let mut sources = 0;
        for page in pages.iter().filter(|p| p.success && !p.text.trim().is_empty()) {
            sources += 1;
            findings.extend(self.extract_findings(task_id, page));
        }
        Ok((findings, sources))
    }

    async fn fetch_all(&self, urls: &[String]) -> Vec<PageData> {
        let fetches = urls.iter().map(|url| async move {
            match self.fetcher.fetch(url).await {
                Ok(page) => page,
                Err(err) => {
                    tracing::debug!(url = %url, error = %err, "page fetch failed");
                    PageData::failed(url.clone(), format!("{err:#}"))
                }
            }
        });
        join_all(fetches).await
    }

    fn extract_findings(&self, task_id: &str, page: &PageData) -> Vec<Finding> {
        let text = clip(&page.text, self.config.max_text_per_page);
        text.split('\n')
            .map(str::trim)
            .filter(|p| p.chars().count() >= self.config.min_paragraph_chars)
            .take(self.config.max_findings_per_page)
            .map(|p| {
                Finding::new(&page.url, &page.title, clip(p, self.config.max_fact_chars))
                    .with_category(task_id)
            })
            .collect()
    }

    async fn insights(
        &self,
        query: &str,
        findings: &[Finding],
        contradictions: &[Contradiction],
        business_context: Option<&str>,
        use_reasoning: bool,
    ) -> Vec<String> {
        let Some(client) = self.completion.as_ref().filter(|_| use_reasoning) else {
            return aggregate::fallback_insights(findings);
        };
        if findings.is_empty() {
            return Vec::new();
        }

        if let Some(events) = &self.events {
            events.emit_start("insights", Stage::Synthesis, query);
        }
        let started = Instant::now();

        let facts = aggregate::ranked(findings)
            .into_iter()
            .take(INSIGHT_FACTS)
            .map(|f| {
                format!(
                    "- [{}] {} (src: {})",
                    percent(f.confidence),
                    clip(&f.fact, 200),
                    f.source_title
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut prompt = format!("Research: {query}\n\nFACTS:\n{facts}");
        if !contradictions.is_empty() {
            prompt.push_str("\n\nCONTRADICTIONS:\n");
            for c in contradictions.iter().take(INSIGHT_CONTRADICTIONS) {
                prompt.push_str(&format!("- {}\n", clip(&c.description, 200)));
            }
        }
        if let Some(context) = business_context.filter(|c| !c.trim().is_empty()) {
            prompt.push_str(&format!("\n\nBUSINESS CONTEXT: {context}"));
        }
        prompt.push_str(
            "\n\nState 3-7 key insights, one sentence each, in the language of the request.\n\
             Reply with JSON: {\"insights\": [\"insight 1\", \"insight 2\"]}",
        );

        let result = complete_json(
            client.as_ref(),
            CompletionRequest::prompt(prompt)
                .with_temperature(0.3)
                .with_max_tokens(1000),
        )
        .await;

        let insights = match result {
            Ok(value) => string_list(value.get("insights")),
            Err(err) => {
                tracing::debug!(error = %err, "insight generation failed");
                Vec::new()
            }
        };

        let succeeded = !insights.is_empty();
        if let Some(events) = &self.events {
            let outcome = if succeeded {
                Outcome::Success
            } else {
                Outcome::failure("fell back to top findings")
            };
            events.emit_finish(
                "insights",
                Stage::Synthesis,
                outcome,
                started.elapsed().as_millis() as u64,
            );
        }

        if succeeded {
            insights.into_iter().take(MAX_INSIGHTS).collect()
        } else {
            aggregate::fallback_insights(findings)
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn report_outcome(report: &ResearchReport) -> ToolOutcome {
    ToolOutcome::ok(report.summary(20)).with_data(json!({
        "query": report.query,
        "findings": report.findings.len(),
        "sources": report.total_sources,
        "confidence": report.overall_confidence,
        "contradictions": report.contradictions.len(),
        "markdown": report.to_markdown(),
    }))
}

fn required_str<'a>(params: &'a Params, key: &str) -> anyhow::Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required parameter '{key}'"))
}

/// Accepts either a JSON array of strings or a comma-separated string.
fn list_param(params: &Params, key: &str) -> Vec<String> {
    match params.get(key) {
        Some(Value::String(text)) => text
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        other => string_list(other),
    }
}

pub struct WideResearchTool(pub Arc<WideResearch>);

#[async_trait]
impl ToolHandler for WideResearchTool {
    fn name(&self) -> &str {
        "wide_research"
    }

    fn description(&self) -> &str {
        "Research a topic across many sources in parallel and report cross-checked findings"
    }

    fn parameters(&self) -> &str {
        "query: string, max_sources?: integer, sub_queries?: [string], context?: string"
    }

    async fn call(&self, params: &Params, _context: &ToolContext) -> anyhow::Result<ToolOutcome> {
        let mut request = ResearchRequest::new(required_str(params, "query")?);
        request.max_sources = params
            .get("max_sources")
            .and_then(Value::as_u64)
            .map(|n| n as usize);
        let sub_queries = list_param(params, "sub_queries");
        if !sub_queries.is_empty() {
            request.sub_queries = Some(sub_queries);
        }
        request.business_context = params
            .get("context")
            .and_then(Value::as_str)
            .map(str::to_string);
        let report = self.0.research_with(request).await;
        Ok(report_outcome(&report))
    }
}

pub struct QuickResearchTool(pub Arc<WideResearch>);

#[async_trait]
impl ToolHandler for QuickResearchTool {
    fn name(&self) -> &str {
        "quick_research"
    }

    fn description(&self) -> &str {
        "Fast single-query web research for simple factual questions"
    }

    fn parameters(&self) -> &str {
        "query: string"
    }

    async fn call(&self, params: &Params, _context: &ToolContext) -> anyhow::Result<ToolOutcome> {
        let report = self.0.quick_research(required_str(params, "query")?).await;
        Ok(report_outcome(&report))
    }
}

pub struct CompareResearchTool(pub Arc<WideResearch>);

#[async_trait]
impl ToolHandler for CompareResearchTool {
    fn name(&self) -> &str {
        "compare_research"
    }

    fn description(&self) -> &str {
        "Compare several items on given criteria using parallel research"
    }

    fn parameters(&self) -> &str {
        "items: [string], criteria?: [string]"
    }

    async fn call(&self, params: &Params, _context: &ToolContext) -> anyhow::Result<ToolOutcome> {
        let items = list_param(params, "items");
        if items.len() < 2 {
            anyhow::bail!("compare_research needs at least two items");
        }
        let criteria = list_param(params, "criteria");
        let report = self.0.compare_research(&items, &criteria).await;
        Ok(report_outcome(&report))
    }
}

/// Register the three research tools on `registry`.
pub fn register_research_tools(registry: &ToolRegistry, research: Arc<WideResearch>) {
    registry.register(Arc::new(WideResearchTool(research.clone())));
    registry.register(Arc::new(QuickResearchTool(research.clone())));
    registry.register(Arc::new(CompareResearchTool(research)));
}
