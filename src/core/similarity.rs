//! Lexical similarity between a query and page text.
//!
//! `relevance` answers "how much of what the query talks about shows up on the page":
//! each distinct query term is scored against the page vocabulary (exact hit, or the
//! closest fuzzy spelling above [`FUZZY_FLOOR`]) and the scores are averaged.

use std::collections::BTreeSet;

pub use strsim::{jaro, jaro_winkler, levenshtein, normalized_levenshtein};

/// Minimum Jaro-Winkler similarity for a fuzzy term hit ("result" ~ "results").
pub const FUZZY_FLOOR: f64 = 0.88;

const STOPWORDS: &[&str] = &[
    "about", "after", "all", "also", "am", "an", "and", "any", "are", "as", "at", "be", "been",
    "before", "but", "by", "can", "could", "did", "do", "does", "for", "from", "had", "has",
    "have", "he", "her", "him", "his", "how", "if", "in", "into", "is", "it", "its", "me", "my",
    "no", "not", "of", "on", "once", "or", "our", "she", "so", "some", "than", "that", "the",
    "their", "them", "then", "there", "they", "this", "to", "up", "us", "was", "we", "were",
    "what", "when", "where", "which", "while", "who", "will", "with", "would", "you", "your",
];

/// Lowercased alphanumeric terms, without stopwords and single characters.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| word.chars().nth(1).is_some())
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}

/// Score in `[0, 1]`; `0.0` when either side has no meaningful terms.
pub fn relevance(query: &str, page_text: &str) -> f64 {
    let mut terms = tokenize(query);
    let mut seen = BTreeSet::new();
    terms.retain(|term| seen.insert(term.clone()));
    if terms.is_empty() {
        return 0.0;
    }
    let vocabulary: BTreeSet<String> = tokenize(page_text).into_iter().collect();
    if vocabulary.is_empty() {
        return 0.0;
    }
    let total: f64 = terms
        .iter()
        .map(|term| term_score(term, &vocabulary))
        .sum();
    total / terms.len() as f64
}

fn term_score(term: &str, vocabulary: &BTreeSet<String>) -> f64 {
    if vocabulary.contains(term) {
        return 1.0;
    }
    vocabulary
        .iter()
        .map(|word| jaro_winkler(term, word))
        .filter(|score| *score >= FUZZY_FLOOR)
        .fold(0.0, f64::max)
}
