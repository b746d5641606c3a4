//! Aggregation of research findings: dedup, contradiction linking, confidence.
//!
//! All functions here are pure and operate on in-memory finding lists, so the
//! research coordinator can run them after every sub-agent has finished.

use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::lexicon::{Lexicon, NegationPair};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("invalid whitespace regex"));

const ID_PREFIX_CHARS: usize = 50;
const FINGERPRINT_CHARS: usize = 100;
/// Findings must share at least this many tokens to be about the same topic.
pub const SAME_TOPIC_MIN_SHARED_TOKENS: usize = 3;
const MIN_TOKEN_CHARS: usize = 3;
const DESCRIPTION_FACT_CHARS: usize = 100;
const INSIGHT_FACT_CHARS: usize = 200;
const FALLBACK_INSIGHTS: usize = 5;

/// A single extracted fact plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub source_url: String,
    pub source_title: String,
    pub fact: String,
    pub confidence: f64,
    /// Sub-agent task that produced the finding.
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub supports: Vec<String>,
    #[serde(default)]
    pub contradicts: Vec<String>,
}

impl Finding {
    pub fn new(
        source_url: impl Into<String>,
        source_title: impl Into<String>,
        fact: impl Into<String>,
    ) -> Self {
        let source_url = source_url.into();
        let fact = fact.into();
        Self {
            id: finding_id(&source_url, &fact),
            source_url,
            source_title: source_title.into(),
            fact,
            confidence: 0.8,
            category: String::new(),
            supports: Vec::new(),
            contradicts: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

/// Stable ID derived from the source URL and the head of the fact text.
pub fn finding_id(source_url: &str, fact: &str) -> String {
    let head: String = fact.chars().take(ID_PREFIX_CHARS).collect();
    let digest = md5::compute(format!("{source_url}:{head}").as_bytes());
    let hex = format!("{digest:x}");
    format!("F-{}", &hex[..8])
}

/// Lowercase, trim and collapse whitespace.
pub fn normalize(text: &str) -> String {
    WHITESPACE
        .replace_all(text.trim(), " ")
        .to_lowercase()
}

pub fn fingerprint(text: &str) -> String {
    let head: String = normalize(text).chars().take(FINGERPRINT_CHARS).collect();
    format!("{:x}", md5::compute(head.as_bytes()))
}

/// Tunable confidence weights. Defaults reproduce the empirically chosen values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub base: f64,
    pub per_support: f64,
    pub per_contradiction: f64,
    pub detail_bonus: f64,
    pub detail_min_chars: usize,
    pub digit_bonus: f64,
    pub data_vocabulary_bonus: f64,
    pub trusted_domain_bonus: f64,
    pub low_trust_penalty: f64,
    /// Added to a retained finding for each dropped duplicate.
    pub duplicate_boost: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            base: 0.5,
            per_support: 0.1,
            per_contradiction: 0.15,
            detail_bonus: 0.05,
            detail_min_chars: 50,
            digit_bonus: 0.1,
            data_vocabulary_bonus: 0.1,
            trusted_domain_bonus: 0.15,
            low_trust_penalty: 0.1,
            duplicate_boost: 0.1,
            min: 0.1,
            max: 1.0,
        }
    }
}

/// Drop findings whose fingerprint was already seen.
///
/// A duplicate links to the retained finding as support and boosts its
/// confidence. Running this twice yields the same surviving set.
pub fn dedup(findings: Vec<Finding>, weights: &ScoringWeights) -> Vec<Finding> {
    let mut unique: Vec<Finding> = Vec::with_capacity(findings.len());
    let mut by_fingerprint: HashMap<String, usize> = HashMap::new();

    for finding in findings {
        let print = fingerprint(&finding.fact);
        match by_fingerprint.get(&print) {
            Some(&index) => {
                let retained = &mut unique[index];
                retained.confidence = (retained.confidence + weights.duplicate_boost).min(1.0);
                if finding.id != retained.id && !retained.supports.contains(&finding.id) {
                    retained.supports.push(finding.id);
                }
            }
            None => {
                by_fingerprint.insert(print, unique.len());
                unique.push(finding);
            }
        }
    }
    unique
}

/// A symmetric contradiction edge between two findings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contradiction {
    pub finding_a: String,
    pub finding_b: String,
    pub description: String,
    /// The `positive/negative` pair that triggered the flag.
    pub kind: String,
}

pub(crate) fn tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect()
}

/// True if `term` occurs in `text` outside any occurrence of `shadow`.
///
/// Used where one side of a pair contains the other, e.g. "не рекомендуется"
/// contains "рекомендуется" and "безопасно" contains "опасно".
fn contains_term(text: &str, term: &str, shadow: &str) -> bool {
    if shadow.contains(term) && shadow != term {
        text.replace(shadow, " ").contains(term)
    } else {
        text.contains(term)
    }
}

fn opposes(a: &str, b: &str, pair: &NegationPair) -> bool {
    let positive = pair.positive.to_lowercase();
    let negative = pair.negative.to_lowercase();
    let a_pos = contains_term(a, &positive, &negative);
    let a_neg = contains_term(a, &negative, &positive);
    let b_pos = contains_term(b, &positive, &negative);
    let b_neg = contains_term(b, &negative, &positive);
    (a_pos && b_neg) || (a_neg && b_pos)
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Flag cross-source pairs asserting opposite claims about the same topic.
///
/// Edges are written to both findings' `contradicts` lists.
pub fn detect_contradictions(findings: &mut [Finding], lexicon: &Lexicon) -> Vec<Contradiction> {
    let lowered: Vec<String> = findings.iter().map(|f| f.fact.to_lowercase()).collect();
    let token_sets: Vec<HashSet<String>> = findings.iter().map(|f| tokens(&f.fact)).collect();
    let mut found = Vec::new();
    let mut edges: Vec<(usize, usize)> = Vec::new();

    for i in 0..findings.len() {
        for j in (i + 1)..findings.len() {
            if findings[i].source_url == findings[j].source_url {
                continue;
            }
            let Some(pair) = lexicon
                .negation_pairs
                .iter()
                .find(|pair| opposes(&lowered[i], &lowered[j], pair))
            else {
                continue;
            };
            let shared = token_sets[i].intersection(&token_sets[j]).count();
            if shared < SAME_TOPIC_MIN_SHARED_TOKENS {
                continue;
            }

            let (a, b) = (&findings[i], &findings[j]);
            found.push(Contradiction {
                finding_a: a.id.clone(),
                finding_b: b.id.clone(),
                description: format!(
                    "'{}' ({}) vs '{}' ({})",
                    truncate(&a.fact, DESCRIPTION_FACT_CHARS),
                    a.source_title,
                    truncate(&b.fact, DESCRIPTION_FACT_CHARS),
                    b.source_title
                ),
                kind: format!("{}/{}", pair.positive, pair.negative),
            });
            edges.push((i, j));
        }
    }

    for (i, j) in edges {
        let (id_i, id_j) = (findings[i].id.clone(), findings[j].id.clone());
        if !findings[i].contradicts.contains(&id_j) {
            findings[i].contradicts.push(id_j);
        }
        if !findings[j].contradicts.contains(&id_i) {
            findings[j].contradicts.push(id_i);
        }
    }
    found
}

/// Confidence from corroboration, contradiction, text and source signals.
pub fn score_confidence(finding: &Finding, lexicon: &Lexicon, weights: &ScoringWeights) -> f64 {
    let mut score = weights.base;
    score += weights.per_support * finding.supports.len() as f64;
    score -= weights.per_contradiction * finding.contradicts.len() as f64;

    let fact = finding.fact.to_lowercase();
    if finding.fact.chars().count() > weights.detail_min_chars {
        score += weights.detail_bonus;
    }
    if fact.chars().any(|c| c.is_ascii_digit()) {
        score += weights.digit_bonus;
    }
    if lexicon.data_vocabulary.iter().any(|w| fact.contains(w.as_str())) {
        score += weights.data_vocabulary_bonus;
    }

    let url = finding.source_url.to_lowercase();
    if lexicon.trusted_domains.iter().any(|d| url.contains(d.as_str())) {
        score += weights.trusted_domain_bonus;
    }
    if lexicon.low_trust_domains.iter().any(|d| url.contains(d.as_str())) {
        score -= weights.low_trust_penalty;
    }

    score.clamp(weights.min, weights.max)
}

/// Result of the full aggregation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Aggregation {
    pub findings: Vec<Finding>,
    pub contradictions: Vec<Contradiction>,
}

/// Dedup, link contradictions, then rescore every surviving finding.
pub fn aggregate(findings: Vec<Finding>, lexicon: &Lexicon, weights: &ScoringWeights) -> Aggregation {
    let mut findings = dedup(findings, weights);
    let contradictions = detect_contradictions(&mut findings, lexicon);
    for finding in findings.iter_mut() {
        finding.confidence = score_confidence(finding, lexicon, weights);
    }
    Aggregation {
        findings,
        contradictions,
    }
}

/// Findings sorted by descending confidence, stable for ties.
pub fn ranked(findings: &[Finding]) -> Vec<&Finding> {
    let mut sorted: Vec<&Finding> = findings.iter().collect();
    sorted.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    sorted
}

/// Insights used when no reasoning collaborator is available.
pub fn fallback_insights(findings: &[Finding]) -> Vec<String> {
    ranked(findings)
        .into_iter()
        .take(FALLBACK_INSIGHTS)
        .map(|f| truncate(&f.fact, INSIGHT_FACT_CHARS))
        .collect()
}

pub fn overall_confidence(findings: &[Finding]) -> f64 {
    if findings.is_empty() {
        return 0.0;
    }
    findings.iter().map(|f| f.confidence).sum::<f64>() / findings.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(url: &str, fact: &str) -> Finding {
        Finding::new(url, url.trim_start_matches("https://"), fact)
    }

    #[test]
    fn ids_are_stable_and_prefixed() {
        let a = finding("https://a.example", "Battery lasts two days");
        let b = finding("https://a.example", "Battery lasts two days");
        assert_eq!(a.id, b.id);
        assert!(a.id.starts_with("F-"));
        assert_eq!(a.id.len(), 10);
        assert_ne!(a.id, finding("https://b.example", "Battery lasts two days").id);
    }

    #[test]
    fn duplicates_link_support_and_boost() {
        let findings = vec![
            finding("https://a.example", "Battery  lasts TWO days"),
            finding("https://b.example", "battery lasts two days"),
            finding("https://c.example", "Screen is 6.1 inches"),
        ];
        let second_id = findings[1].id.clone();

        let unique = dedup(findings, &ScoringWeights::default());

        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].supports, vec![second_id]);
        assert!((unique[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn dedup_is_idempotent() {
        let findings = vec![
            finding("https://a.example", "Same fact here"),
            finding("https://b.example", "same   fact here"),
            finding("https://c.example", "Different fact"),
        ];
        let weights = ScoringWeights::default();
        let once = dedup(findings, &weights);
        let twice = dedup(once.clone(), &weights);

        let ids = |list: &[Finding]| list.iter().map(|f| f.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&once), ids(&twice));
        assert_eq!(once[0].supports, twice[0].supports);
    }

    #[test]
    fn one_shared_token_is_not_a_contradiction() {
        let mut findings = vec![
            finding("https://a.example", "Цена увеличилась на 10%"),
            finding("https://b.example", "Цена уменьшилась на 5%"),
        ];
        let found = detect_contradictions(&mut findings, &Lexicon::default());
        assert!(found.is_empty());
        assert!(findings.iter().all(|f| f.contradicts.is_empty()));
    }

    #[test]
    fn three_shared_tokens_flip_to_contradiction() {
        let mut findings = vec![
            finding("https://a.example", "Цена смартфона Samsung увеличилась на 10%"),
            finding("https://b.example", "Цена смартфона Samsung уменьшилась на 5%"),
        ];
        let found = detect_contradictions(&mut findings, &Lexicon::default());

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, "увеличил/уменьшил");
        assert!(found[0].description.contains("' (a.example) vs '"));
        assert_eq!(findings[0].contradicts, vec![findings[1].id.clone()]);
        assert_eq!(findings[1].contradicts, vec![findings[0].id.clone()]);
    }

    #[test]
    fn same_source_pairs_are_skipped() {
        let mut findings = vec![
            finding("https://a.example", "Цена смартфона Samsung увеличилась"),
            finding("https://a.example", "Цена смартфона Samsung уменьшилась"),
        ];
        assert!(detect_contradictions(&mut findings, &Lexicon::default()).is_empty());
    }

    #[test]
    fn embedded_negations_are_not_double_counted() {
        let lexicon = Lexicon::default();
        let both_negative = [
            "Препарат для детей не рекомендуется врачами",
            "Препарат для детей не рекомендуется педиатрами",
        ];
        let mut findings = vec![
            finding("https://a.example", both_negative[0]),
            finding("https://b.example", both_negative[1]),
        ];
        assert!(detect_contradictions(&mut findings, &lexicon).is_empty());

        let mut opposite = vec![
            finding("https://a.example", "Препарат для детей рекомендуется врачами"),
            finding("https://b.example", "Препарат для детей не рекомендуется врачами"),
        ];
        assert_eq!(detect_contradictions(&mut opposite, &lexicon).len(), 1);
    }

    #[test]
    fn contradiction_links_are_symmetric() {
        let mut findings = vec![
            finding("https://a.example", "Model X battery life is better than rivals"),
            finding("https://b.example", "Model X battery life is worse than rivals"),
            finding("https://c.example", "Model X battery life is worse than expected rivals"),
        ];
        detect_contradictions(&mut findings, &Lexicon::default());

        for a in &findings {
            for other_id in &a.contradicts {
                let b = findings.iter().find(|f| &f.id == other_id).unwrap();
                assert!(b.contradicts.contains(&a.id));
            }
            let unique: HashSet<_> = a.contradicts.iter().collect();
            assert_eq!(unique.len(), a.contradicts.len());
        }
        assert_eq!(findings[0].contradicts.len(), 2);
    }

    #[test]
    fn confidence_is_clamped_for_extreme_counts() {
        let lexicon = Lexicon::default();
        let weights = ScoringWeights::default();
        let mut f = finding("https://forum.example", "short");
        f.contradicts = (0..20).map(|i| format!("F-{i}")).collect();
        assert_eq!(score_confidence(&f, &lexicon, &weights), 0.1);

        let mut g = finding(
            "https://en.wikipedia.org/wiki/X",
            "According to a 2023 study the market grew by 12 percent year over year",
        );
        g.supports = (0..20).map(|i| format!("F-{i}")).collect();
        assert_eq!(score_confidence(&g, &lexicon, &weights), 1.0);

        for supports in 0..6 {
            for contradicts in 0..6 {
                let mut h = finding("https://blog.example", "text");
                h.supports = vec![String::new(); supports];
                h.contradicts = vec![String::new(); contradicts];
                let score = score_confidence(&h, &lexicon, &weights);
                assert!((0.1..=1.0).contains(&score));
            }
        }
    }

    #[test]
    fn source_and_text_signals_add_up() {
        let f = finding(
            "https://www.reuters.com/x",
            "Sales rose 12% according to the quarterly report",
        );
        // 0.5 + digit 0.1 + vocabulary 0.1 + trusted 0.15
        let score = score_confidence(&f, &Lexicon::default(), &ScoringWeights::default());
        assert!((score - 0.85).abs() < 1e-9);
    }

    #[test]
    fn aggregate_rescores_and_ranks() {
        let result = aggregate(
            vec![
                finding("https://blog.example", "opinion without numbers"),
                finding("https://stats.gov.example", "Output rose 4% according to data"),
            ],
            &Lexicon::default(),
            &ScoringWeights::default(),
        );
        let insights = fallback_insights(&result.findings);
        assert_eq!(insights[0], "Output rose 4% according to data");
        let overall = overall_confidence(&result.findings);
        assert!(overall > 0.1 && overall < 1.0);
        assert_eq!(overall_confidence(&[]), 0.0);
    }
}
