//! Cheap complexity classifier deciding whether a request goes to the auto-DAG path.

use serde::Serialize;

use crate::lexicon::Lexicon;

const MARKER_THRESHOLD: usize = 2;
const LONG_MESSAGE_CHARS: usize = 200;
const ACTION_VERB_THRESHOLD: usize = 2;
const CONJUNCTION_THRESHOLD: usize = 2;
const CONJUNCTION_MIN_CHARS: usize = 100;

/// Which rule, if any, classified the message as complex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityReason {
    Markers,
    LongWithActions,
    Conjunctions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplexityVerdict {
    pub complex: bool,
    pub reason: Option<ComplexityReason>,
    pub marker_hits: usize,
    pub action_hits: usize,
    pub conjunction_hits: usize,
}

pub fn classify(message: &str, lexicon: &Lexicon) -> ComplexityVerdict {
    let lower = message.to_lowercase();
    let length = message.chars().count();

    let marker_hits = lexicon
        .complex_markers
        .iter()
        .filter(|marker| lower.contains(marker.as_str()))
        .count();
    let action_hits = lexicon
        .action_verbs
        .iter()
        .filter(|verb| lower.contains(verb.as_str()))
        .count();
    let conjunction_hits: usize = lexicon
        .conjunction_markers
        .iter()
        .map(|marker| lower.matches(marker.as_str()).count())
        .sum();

    let reason = if marker_hits >= MARKER_THRESHOLD {
        Some(ComplexityReason::Markers)
    } else if length > LONG_MESSAGE_CHARS && action_hits >= ACTION_VERB_THRESHOLD {
        Some(ComplexityReason::LongWithActions)
    } else if conjunction_hits >= CONJUNCTION_THRESHOLD && length > CONJUNCTION_MIN_CHARS {
        Some(ComplexityReason::Conjunctions)
    } else {
        None
    };

    ComplexityVerdict {
        complex: reason.is_some(),
        reason,
        marker_hits,
        action_hits,
        conjunction_hits,
    }
}

pub fn is_complex(message: &str, lexicon: &Lexicon) -> bool {
    classify(message, lexicon).complex
}
