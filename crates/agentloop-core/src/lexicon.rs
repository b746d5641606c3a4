//! Locale-specific keyword data used by the heuristics.
//!
//! The complexity classifier, contradiction detector and confidence scorer only
//! read from a [`Lexicon`]; swapping the lexicon file re-targets them to another
//! locale without touching control flow. The built-in default covers Russian
//! and English.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::AgentLoopError;

/// A positive/negative term pair used for contradiction detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegationPair {
    pub positive: String,
    pub negative: String,
}

impl NegationPair {
    pub fn new(positive: impl Into<String>, negative: impl Into<String>) -> Self {
        Self {
            positive: positive.into(),
            negative: negative.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Lexicon {
    /// Phrases marking a multi-step request. Two hits make a message complex.
    pub complex_markers: Vec<String>,
    /// Verb stems counted for long messages.
    pub action_verbs: Vec<String>,
    /// Substrings that chain several requests together.
    pub conjunction_markers: Vec<String>,
    pub negation_pairs: Vec<NegationPair>,
    /// Vocabulary hinting that a fact is backed by data or a study.
    pub data_vocabulary: Vec<String>,
    pub trusted_domains: Vec<String>,
    pub low_trust_domains: Vec<String>,
    /// Suffixes appended to the base query when sub-queries cannot be generated.
    pub subquery_suffixes: Vec<String>,
    /// Criteria used by compare research when none are supplied.
    pub default_compare_criteria: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            complex_markers: strings(&[
                "исследуй",
                "проанализируй",
                "сравни",
                "найди лучший",
                "составь отчёт",
                "полный анализ",
                "собери информацию",
                "research",
                "analyze",
                "compare",
                "comprehensive",
                "несколько",
                "каждый",
                "по всем",
                "для всех",
                "пошагово",
                "план",
                "стратеги",
                "отредактируй",
                "исправь в файле",
                "добавь в файл",
                "проанализируй данные",
                "построй график",
                "сравни файлы",
                "широкое исследование",
                "глубокий анализ",
                "организуй",
                "спланируй",
                "подготовь",
                "разберись",
                "помоги разобраться",
                "объясни подробно",
                "научи",
            ]),
            action_verbs: strings(&[
                "найди",
                "сделай",
                "создай",
                "отправ",
                "провер",
                "сравни",
                "проанализ",
                "посчитай",
                "узнай",
            ]),
            conjunction_markers: strings(&[" и ", ", затем", ", потом", " + "]),
            negation_pairs: vec![
                NegationPair::new("увеличил", "уменьшил"),
                NegationPair::new("вырос", "упал"),
                NegationPair::new("лучше", "хуже"),
                NegationPair::new("дороже", "дешевле"),
                NegationPair::new("быстрее", "медленнее"),
                NegationPair::new("больше", "меньше"),
                NegationPair::new("рост", "падение"),
                NegationPair::new("positive", "negative"),
                NegationPair::new("increase", "decrease"),
                NegationPair::new("higher", "lower"),
                NegationPair::new("better", "worse"),
                NegationPair::new("recommended", "not recommended"),
                NegationPair::new("рекомендуется", "не рекомендуется"),
                NegationPair::new("безопасно", "опасно"),
                NegationPair::new("эффективн", "неэффективн"),
            ],
            data_vocabulary: strings(&[
                "исследование",
                "статистика",
                "данные",
                "отчёт",
                "study",
                "research",
                "data",
                "report",
                "according",
            ]),
            trusted_domains: strings(&[
                "wikipedia",
                "gov.",
                ".edu",
                "reuters",
                "bloomberg",
                "statista",
                "worldbank",
                "who.int",
                "un.org",
            ]),
            low_trust_domains: strings(&["forum", "blog", "reddit", "quora"]),
            subquery_suffixes: strings(&["обзор", "сравнение", "отзывы", "статистика"]),
            default_compare_criteria: "обзор характеристики цена".to_string(),
        }
    }
}

impl Lexicon {
    /// Load a lexicon from a TOML file. Missing keys fall back to the built-in lists.
    pub fn from_path(path: &Path) -> Result<Self, AgentLoopError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AgentLoopError::config_io(path.to_path_buf(), err))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, AgentLoopError> {
        toml::from_str(raw).map_err(|err| {
            AgentLoopError::InvalidConfiguration(format!("invalid lexicon: {err}"))
        })
    }
}
