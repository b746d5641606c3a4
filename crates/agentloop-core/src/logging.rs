use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Datelike, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions, create_dir_all};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::warn;

use crate::orchestrator::{LearningSignal, LearningSink};

const LOG_DIR_ENV: &str = "AGENTLOOP_LOG_DIR";
const RETENTION_ENV: &str = "AGENTLOOP_LOG_RETENTION_DAYS";
const DEFAULT_LOG_DIR: &str = "data/logs";
const DEFAULT_RETENTION_DAYS: u64 = 90;

const RUN_LOG_FILE: &str = "runs.jsonl";
const LEARNING_LOG_FILE: &str = "learning.jsonl";
const AUDIT_LOG_FILE: &str = "audit.jsonl";

static REDACTION_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "api_key",
            Regex::new(r"(?i)(api[_-]?key\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid api_key regex"),
        ),
        (
            "secret",
            Regex::new(r"(?i)(secret\s*[:=]\s*)([A-Za-z0-9\-_.+/]+)")
                .expect("invalid secret regex"),
        ),
        (
            "bearer",
            Regex::new(r"(?i)(bearer\s+)([A-Za-z0-9\-_.+=/]+)").expect("invalid bearer regex"),
        ),
        (
            "sk_token",
            Regex::new(r"(sk-[A-Za-z0-9]{16,})").expect("invalid sk_token regex"),
        ),
    ]
});

/// Where JSONL logs live and how long they are kept.
#[derive(Debug, Clone)]
pub struct LogLocation {
    pub base_dir: PathBuf,
    /// Files older than this are pruned after each write; 0 disables pruning.
    pub retention_days: u64,
}

impl LogLocation {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }

    pub fn with_retention_days(mut self, days: u64) -> Self {
        self.retention_days = days;
        self
    }

    /// `AGENTLOOP_LOG_DIR` and `AGENTLOOP_LOG_RETENTION_DAYS`, falling back to defaults.
    pub fn from_env() -> Self {
        let base_dir = std::env::var(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_DIR));
        let retention_days = std::env::var(RETENTION_ENV)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(DEFAULT_RETENTION_DAYS);
        Self {
            base_dir,
            retention_days,
        }
    }

    fn month_dir(&self) -> PathBuf {
        let now = Utc::now();
        self.base_dir
            .join(format!("{:04}", now.year()))
            .join(format!("{:02}", now.month()))
    }
}

impl Default for LogLocation {
    fn default() -> Self {
        Self::from_env()
    }
}

#[derive(Debug, Clone)]
pub struct RunLogInput {
    pub run_id: String,
    pub conversation_id: String,
    pub message: String,
    pub answer: String,
    pub iterations: usize,
    pub tools_used: Vec<String>,
    pub plan_used: bool,
    pub elapsed_ms: u64,
    pub trace_path: Option<String>,
}

#[derive(Serialize)]
struct RunLogRecord {
    timestamp: String,
    run_id: String,
    conversation_id: String,
    message: String,
    answer: String,
    iterations: usize,
    tools_used: Vec<String>,
    plan_used: bool,
    elapsed_ms: u64,
    trace_path: Option<String>,
    redactions: Vec<String>,
}

#[derive(Serialize)]
struct LearningLogRecord {
    timestamp: String,
    conversation_id: String,
    iteration: usize,
    user_message: String,
    error: String,
    redactions: Vec<String>,
}

#[derive(Serialize)]
struct AuditLogRecord<'a> {
    timestamp: &'a str,
    conversation_id: &'a str,
    source: &'a str,
    redactions: &'a [String],
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .with_context(|| format!("failed to create log directory {}", parent.display()))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let line = serde_json::to_string(value)?;
    writeln!(writer, "{line}")
        .with_context(|| format!("failed to append log entry to {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

/// Replace anything that looks like a credential with `[REDACTED]`.
pub fn redact(input: &str) -> String {
    sanitize_text(input, &mut BTreeSet::new())
}

fn sanitize_text(input: &str, redactions: &mut BTreeSet<String>) -> String {
    let mut output = input.to_string();
    for (name, regex) in REDACTION_PATTERNS.iter() {
        let mut matched = false;
        output = regex
            .replace_all(&output, |caps: &Captures| {
                matched = true;
                if caps.len() > 2 {
                    format!("{}[REDACTED]", &caps[1])
                } else {
                    "[REDACTED]".to_string()
                }
            })
            .to_string();
        if matched {
            redactions.insert(name.to_string());
        }
    }
    output
}

fn write_audit(
    location: &LogLocation,
    timestamp: &str,
    conversation_id: &str,
    source: &str,
    redactions: &[String],
) -> Result<()> {
    if redactions.is_empty() {
        return Ok(());
    }
    let audit = AuditLogRecord {
        timestamp,
        conversation_id,
        source,
        redactions,
    };
    append_json_line(&location.month_dir().join(AUDIT_LOG_FILE), &audit)?;
    warn!(
        conversation_id = %conversation_id,
        source,
        fields = ?redactions,
        "redacted potential secrets from log record"
    );
    Ok(())
}

/// Append one completed run to `runs.jsonl`. Returns the file written.
pub fn log_run_completion(location: &LogLocation, input: RunLogInput) -> Result<PathBuf> {
    let timestamp = Utc::now().to_rfc3339();
    let mut redactions = BTreeSet::new();

    let message = sanitize_text(&input.message, &mut redactions);
    let answer = sanitize_text(&input.answer, &mut redactions);

    let record = RunLogRecord {
        timestamp: timestamp.clone(),
        run_id: input.run_id,
        conversation_id: input.conversation_id.clone(),
        message,
        answer,
        iterations: input.iterations,
        tools_used: input.tools_used,
        plan_used: input.plan_used,
        elapsed_ms: input.elapsed_ms,
        trace_path: input.trace_path,
        redactions: redactions.into_iter().collect(),
    };

    let path = location.month_dir().join(RUN_LOG_FILE);
    append_json_line(&path, &record)?;
    write_audit(
        location,
        &timestamp,
        &input.conversation_id,
        "run",
        &record.redactions,
    )?;
    enforce_retention(location)?;
    Ok(path)
}

fn log_learning_signal(location: &LogLocation, signal: &LearningSignal) -> Result<()> {
    let timestamp = Utc::now().to_rfc3339();
    let mut redactions = BTreeSet::new();

    let user_message = sanitize_text(&signal.user_message, &mut redactions);
    let error = sanitize_text(&signal.error, &mut redactions);

    let record = LearningLogRecord {
        timestamp: timestamp.clone(),
        conversation_id: signal.conversation_id.clone(),
        iteration: signal.iteration,
        user_message,
        error,
        redactions: redactions.into_iter().collect(),
    };

    append_json_line(&location.month_dir().join(LEARNING_LOG_FILE), &record)?;
    write_audit(
        location,
        &timestamp,
        &signal.conversation_id,
        "learning",
        &record.redactions,
    )?;
    enforce_retention(location)
}

/// [`LearningSink`] that appends per-turn failures to `learning.jsonl`.
#[derive(Debug, Clone, Default)]
pub struct JsonlLearningLog {
    location: LogLocation,
}

impl JsonlLearningLog {
    pub fn new(location: LogLocation) -> Self {
        Self { location }
    }

    pub fn location(&self) -> &LogLocation {
        &self.location
    }
}

#[async_trait]
impl LearningSink for JsonlLearningLog {
    async fn record_failure(&self, signal: LearningSignal) -> Result<()> {
        let location = self.location.clone();
        tokio::task::spawn_blocking(move || log_learning_signal(&location, &signal))
            .await
            .context("learning log writer task failed")?
    }
}

fn enforce_retention(location: &LogLocation) -> Result<()> {
    let retention = location.retention_days;
    if retention == 0 || !location.base_dir.exists() {
        return Ok(());
    }
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(retention.saturating_mul(86_400)))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    prune_directory(&location.base_dir, cutoff)
}

fn prune_directory(dir: &Path, cutoff: SystemTime) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            prune_directory(&path, cutoff)?;
            if path.read_dir()?.next().is_none() {
                fs::remove_dir(&path).ok();
            }
        } else if metadata.is_file()
            && metadata
                .modified()
                .map(|time| time < cutoff)
                .unwrap_or(false)
        {
            fs::remove_file(&path).ok();
        }
    }

    Ok(())
}
