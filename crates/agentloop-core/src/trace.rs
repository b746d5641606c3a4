use std::fmt::Write as _;
use std::fs::{File, create_dir_all};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::orchestrator::Step;

const MAX_LABEL_CHARS: usize = 80;

/// Flattened view of one loop step, used for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub action: String,
    pub target: String,
    pub observation: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceSummary {
    pub steps: Vec<TraceStep>,
}

impl TraceSummary {
    pub fn from_steps(steps: &[Step]) -> Self {
        let steps = steps
            .iter()
            .map(|step| TraceStep {
                index: step.index,
                action: step.action.kind().to_string(),
                target: action_target(&step.action),
                observation: first_line(&step.observation),
                duration_ms: step.duration_ms,
            })
            .collect();
        Self { steps }
    }

    pub fn render_markdown(&self) -> String {
        if self.steps.is_empty() {
            return "No steps recorded.".to_string();
        }
        let mut output = String::from("### Run Trace\n");
        for step in &self.steps {
            let target = if step.target.is_empty() {
                String::new()
            } else {
                format!(" `{}`", step.target)
            };
            let _ = write!(output, "{}. {}{} ({} ms)", step.index, step.action, target, step.duration_ms);
            if !step.observation.is_empty() {
                let _ = write!(output, " → {}", step.observation);
            }
            output.push('\n');
        }
        output
    }

    pub fn render_mermaid(&self) -> String {
        if self.steps.is_empty() {
            return "flowchart TD\n  %% no steps captured".to_string();
        }

        let mut output = String::from("flowchart TD\n");
        for step in &self.steps {
            let label = if step.target.is_empty() {
                step.action.clone()
            } else {
                format!("{}: {}", step.action, step.target)
            };
            let _ = writeln!(output, "  step{}[\"{}\"]", step.index, sanitize_mermaid(&label));
        }
        for pair in self.steps.windows(2) {
            let _ = writeln!(output, "  step{} --> step{}", pair[0].index, pair[1].index);
        }
        output
    }
}

fn action_target(action: &Action) -> String {
    match action {
        Action::ToolCall(call) => call.name.clone(),
        Action::ParallelTools { calls } => calls
            .iter()
            .map(|call| call.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        Action::Plan { description } => clip(description),
        Action::FinalAnswer { .. } | Action::AskUser { .. } => String::new(),
    }
}

fn first_line(text: &str) -> String {
    clip(text.lines().next().unwrap_or_default())
}

fn clip(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= MAX_LABEL_CHARS {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(MAX_LABEL_CHARS).collect();
    clipped.push('…');
    clipped
}

fn sanitize_mermaid(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "'")
        .replace('[', "(")
        .replace(']', ")")
        .replace('\n', "<br/>")
}

/// Write the full steps of a run as pretty JSON to `<dir>/<run_id>.json`.
pub fn persist_trace<P: AsRef<Path>>(dir: P, run_id: &str, steps: &[Step]) -> Result<PathBuf> {
    let dir = dir.as_ref();
    create_dir_all(dir)
        .with_context(|| format!("failed to create trace directory {}", dir.display()))?;
    let path = dir.join(format!("{run_id}.json"));
    let payload = serde_json::to_vec_pretty(steps)?;
    let mut file = File::create(&path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    file.write_all(&payload)
        .with_context(|| format!("failed to write trace file {}", path.display()))?;
    Ok(path)
}
