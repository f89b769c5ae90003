//! Cheap, deterministic answer scoring.
//!
//! The score gates fallback; it does not grade. Each heuristic lands in `[0, 1]`
//! and the total is a fixed weighted sum, so a rejected answer can always be
//! explained from its [`QualityBreakdown`].

use std::collections::HashSet;

use crate::models::AssistRequest;

const RELEVANCE_WEIGHT: f64 = 0.40;
const LENGTH_WEIGHT: f64 = 0.25;
const HEDGING_WEIGHT: f64 = 0.15;
const COMPLETENESS_WEIGHT: f64 = 0.20;

/// Overlap ratio that already earns full relevance credit.
const RELEVANCE_SATURATION: f64 = 0.5;
const MIN_WORDS: usize = 8;
const MAX_WORDS: usize = 800;
const MIN_UNIQUE_RATIO: f64 = 0.4;
const HEDGE_PENALTY: f64 = 0.5;
const INCOMPLETE_CREDIT: f64 = 0.4;
const OVERLONG_CREDIT: f64 = 0.6;

const HEDGING_MARKERS: &[&str] = &[
    "i'm not sure",
    "i am not sure",
    "i don't know",
    "i do not know",
    "i cannot help",
    "i can't help",
    "i'm unable to",
    "i am unable to",
    "as an ai",
    "i'm sorry",
    "i may be wrong",
    "it's unclear",
    "i cannot determine",
    "i can't determine",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "what", "how", "why", "when", "where", "which", "this", "that",
    "are", "was", "were", "can", "should", "does", "did", "you", "your", "our", "there", "from",
    "have", "has", "into", "about", "would", "could", "will", "not", "but", "its", "any", "all",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityBreakdown {
    pub relevance: f64,
    pub length: f64,
    pub hedging: f64,
    pub completeness: f64,
}

impl QualityBreakdown {
    const EMPTY: Self = Self {
        relevance: 0.0,
        length: 0.0,
        hedging: 0.0,
        completeness: 0.0,
    };

    pub fn total(&self) -> f64 {
        let total = self.relevance * RELEVANCE_WEIGHT
            + self.length * LENGTH_WEIGHT
            + self.hedging * HEDGING_WEIGHT
            + self.completeness * COMPLETENESS_WEIGHT;
        total.clamp(0.0, 1.0)
    }
}

pub fn score(request: &AssistRequest, answer_text: &str) -> f64 {
    assess(request, answer_text).total()
}

pub fn assess(request: &AssistRequest, answer_text: &str) -> QualityBreakdown {
    let trimmed = answer_text.trim();
    if trimmed.is_empty() {
        return QualityBreakdown::EMPTY;
    }

    let lowered = trimmed.to_lowercase();
    QualityBreakdown {
        relevance: relevance(request.text(), &lowered),
        length: length(&lowered),
        hedging: hedging(&lowered),
        completeness: completeness(trimmed),
    }
}

fn relevance(query: &str, answer: &str) -> f64 {
    let query = query.to_lowercase();
    let query_terms = content_terms(&query);
    if query_terms.is_empty() {
        return 1.0;
    }
    let answer_terms = content_terms(answer);
    let shared = query_terms.intersection(&answer_terms).count() as f64;
    let overlap = shared / query_terms.len() as f64;
    (overlap / RELEVANCE_SATURATION).min(1.0)
}

fn length(answer: &str) -> f64 {
    let words = answer.split_whitespace().collect::<Vec<_>>();
    let count = words.len();
    if count < MIN_WORDS {
        return 0.5 * count as f64 / MIN_WORDS as f64;
    }

    let band = if count > MAX_WORDS { OVERLONG_CREDIT } else { 1.0 };
    let unique = words.iter().collect::<HashSet<_>>().len() as f64;
    let repetition = (unique / count as f64 / MIN_UNIQUE_RATIO).min(1.0);
    band * repetition
}

fn hedging(answer: &str) -> f64 {
    let hits = HEDGING_MARKERS
        .iter()
        .filter(|marker| answer.contains(*marker))
        .count() as f64;
    (1.0 - HEDGE_PENALTY * hits).max(0.0)
}

fn completeness(answer: &str) -> f64 {
    let truncated = answer.ends_with("...")
        || answer.ends_with('…')
        || answer.matches("```").count() % 2 == 1;
    let terminated = answer.ends_with(['.', '!', '?', ')', '"', '`']);
    if terminated && !truncated {
        1.0
    } else {
        INCOMPLETE_CREDIT
    }
}

fn content_terms(text: &str) -> HashSet<&str> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|term| term.len() >= 3 && !STOPWORDS.contains(term))
        .collect()
}
