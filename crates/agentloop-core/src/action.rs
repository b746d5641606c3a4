//! Parsing of unreliable model output into a closed [`Action`] variant.
//!
//! [`parse`] is total: whatever the model produced, the caller receives a
//! well-formed [`ParsedAction`]. Decoding is attempted in order on the raw
//! text, a fenced code block, the outermost brace span, and that span with
//! trailing commas stripped; if all fail the raw text becomes a final answer.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool parameters as produced by the model.
pub type Params = Map<String, Value>;

pub const DEFAULT_CONFIDENCE: f64 = 0.5;

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```(?:json)?\s*([\s\S]*?)```").expect("invalid fenced block regex"));
static FENCED_JSON_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"```(?:json)?\s*\{[\s\S]*?\}\s*```").expect("invalid fenced json regex")
});
static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",\s*([}\]])").expect("invalid trailing comma regex"));
static FLAT_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{[^{}]*\}").expect("invalid flat object regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub params: Params,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, params: Params) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    ToolCall(ToolCall),
    ParallelTools { calls: Vec<ToolCall> },
    Plan { description: String },
    FinalAnswer { text: String },
    AskUser { text: String },
}

impl Action {
    pub fn kind(&self) -> &'static str {
        match self {
            Action::ToolCall(_) => "tool_call",
            Action::ParallelTools { .. } => "parallel_tools",
            Action::Plan { .. } => "plan",
            Action::FinalAnswer { .. } => "final_answer",
            Action::AskUser { .. } => "ask_user",
        }
    }

    pub fn final_answer(text: impl Into<String>) -> Self {
        Action::FinalAnswer { text: text.into() }
    }
}

/// One decoded model turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedAction {
    pub action: Action,
    pub thought: String,
    pub confidence: f64,
    pub remember_fact: Option<String>,
}

impl ParsedAction {
    fn fallback(raw: &str) -> Self {
        Self {
            action: Action::final_answer(raw.trim()),
            thought: String::new(),
            confidence: DEFAULT_CONFIDENCE,
            remember_fact: None,
        }
    }
}

/// Parse raw model output. Never fails.
pub fn parse(raw: &str) -> ParsedAction {
    match extract_json_object(raw) {
        Some(Value::Object(object)) => from_object(&object, raw),
        _ => ParsedAction::fallback(raw),
    }
}

/// Run the decode fallback chain and return the first JSON object found.
pub fn extract_json_object(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();

    if let Some(value) = decode_object(trimmed) {
        return Some(value);
    }

    if let Some(value) = FENCED_BLOCK
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .and_then(|body| decode_object(body.as_str().trim()))
    {
        return Some(value);
    }

    let span = outermost_brace_span(trimmed)?;
    if let Some(value) = decode_object(span) {
        return Some(value);
    }

    let repaired = TRAILING_COMMA.replace_all(span, "$1");
    decode_object(&repaired)
}

fn decode_object(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn outermost_brace_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn from_object(object: &Map<String, Value>, raw: &str) -> ParsedAction {
    let thought = object
        .get("thought")
        .map(value_to_text)
        .unwrap_or_default();
    let confidence = object
        .get("confidence")
        .and_then(parse_confidence)
        .unwrap_or(DEFAULT_CONFIDENCE);
    let remember_fact = object
        .get("should_remember")
        .or_else(|| object.get("remember_fact"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|fact| !fact.is_empty() && !fact.eq_ignore_ascii_case("null"))
        .map(str::to_string);

    let action = match object.get("action") {
        Some(Value::String(text)) => Action::final_answer(text.clone()),
        Some(Value::Object(action)) => action_from_object(action),
        _ => {
            let top_answer = object
                .get("answer")
                .map(value_to_text)
                .filter(|answer| !answer.trim().is_empty());
            let text = top_answer
                .or_else(|| (!thought.trim().is_empty()).then(|| thought.clone()))
                .unwrap_or_else(|| raw.trim().to_string());
            Action::final_answer(text)
        }
    };

    ParsedAction {
        action,
        thought,
        confidence,
        remember_fact,
    }
}

fn action_from_object(action: &Map<String, Value>) -> Action {
    let kind = action
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("final_answer")
        .trim()
        .to_lowercase();
    let answer = action.get("answer").map(value_to_text).unwrap_or_default();

    match kind.as_str() {
        "tool_call" | "tool" => Action::ToolCall(single_call(action)),
        "parallel_tools" => {
            let calls: Vec<ToolCall> = action
                .get("calls")
                .and_then(Value::as_array)
                .map(|calls| calls.iter().filter_map(call_from_value).collect())
                .unwrap_or_default();
            if calls.is_empty() {
                Action::ToolCall(single_call(action))
            } else {
                Action::ParallelTools { calls }
            }
        }
        "plan" => Action::Plan {
            description: answer,
        },
        "ask_user" => Action::AskUser { text: answer },
        _ => Action::FinalAnswer { text: answer },
    }
}

fn single_call(action: &Map<String, Value>) -> ToolCall {
    let name = action
        .get("tool")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ToolCall::new(name, params_of(action.get("params")))
}

fn call_from_value(value: &Value) -> Option<ToolCall> {
    let call = value.as_object()?;
    let name = call
        .get("tool")
        .or_else(|| call.get("name"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    Some(ToolCall::new(name, params_of(call.get("params"))))
}

fn params_of(value: Option<&Value>) -> Params {
    match value {
        Some(Value::Object(params)) => params.clone(),
        _ => Params::new(),
    }
}

fn parse_confidence(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then(|| parsed.clamp(0.0, 1.0))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

const ANSWER_KEYS: [&str; 6] = ["answer", "response", "result", "text", "message", "output"];

/// Strip JSON that leaked into user-facing text.
pub fn clean_answer(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }

    if text.starts_with('{') && text.ends_with('}') {
        if let Some(Value::Object(object)) = decode_object(text) {
            if let Some(inner) = answer_from_object(&object) {
                return clean_answer(&inner);
            }
            if let Some(thought) = object.get("thought").and_then(Value::as_str) {
                if thought.chars().count() > 10 {
                    return thought.to_string();
                }
            }
        }
    }

    if text.contains("```json") || text.contains("```{") {
        let without_blocks = FENCED_JSON_BLOCK.replace_all(text, "");
        let without_blocks = without_blocks.trim();
        if without_blocks.chars().count() > 5 {
            return without_blocks.to_string();
        }
    }

    if text.starts_with("{\"") || text.starts_with("{\n") {
        if let Some(end) = balanced_object_end(text) {
            let rest = text[end..].trim();
            if !rest.is_empty() {
                return rest.to_string();
            }
            if let Some(Value::Object(object)) = decode_object(&text[..end]) {
                if let Some(inner) = answer_from_object(&object) {
                    return inner;
                }
            }
        }
    }

    if text.contains('{') && text.contains('}') {
        let parts: Vec<&str> = FLAT_OBJECT
            .split(text)
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect();
        let kept: usize = parts.iter().map(|part| part.chars().count()).sum();
        if !parts.is_empty() && kept > 20 {
            return parts.join(" ");
        }
    }

    text.to_string()
}

fn answer_from_object(object: &Map<String, Value>) -> Option<String> {
    for key in ANSWER_KEYS {
        if let Some(Value::String(inner)) = object.get(key) {
            if !inner.trim().is_empty() {
                return Some(inner.clone());
            }
        }
    }
    object
        .get("action")
        .and_then(Value::as_object)
        .and_then(|action| action.get("answer"))
        .and_then(Value::as_str)
        .filter(|answer| !answer.trim().is_empty())
        .map(str::to_string)
}

fn balanced_object_end(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, ch) in text.char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}
