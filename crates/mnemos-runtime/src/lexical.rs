//! Lexical stage: query sanitizing and keyword search through the store.
//!
//! Queries are never rejected. Boolean operators and FTS syntax characters
//! are stripped so user text cannot change the meaning of the search, then
//! the remaining words are passed to the store as plain terms.

use mnemos_types::error::MnemosResult;
use mnemos_types::memory::{Candidate, MemoryStore, TimeWindow, TurnId};
use regex_lite::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::debug;

/// Maximum number of terms sent to the store.
const MAX_TERMS: usize = 32;

/// Candidates kept per requested result.
pub const CANDIDATE_MULTIPLIER: usize = 3;

fn operator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(NEAR/\d+|NEAR|NOT|AND|OR)\b").expect("operator regex is valid")
    })
}

fn special_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"[()\[\]{}"'*^\-+:~?,.!]"#).expect("special-character regex is valid")
    })
}

/// Strip search operators and special characters, collapsing whitespace.
pub fn sanitize_query(query: &str) -> String {
    let without_ops = operator_re().replace_all(query, " ");
    let without_specials = special_re().replace_all(&without_ops, " ");
    without_specials
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sanitized, lower-cased, de-duplicated search terms.
pub fn extract_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in sanitize_query(query).split_whitespace() {
        let word = word.to_lowercase();
        if word.chars().count() < 2 || terms.contains(&word) {
            continue;
        }
        terms.push(word);
        if terms.len() == MAX_TERMS {
            break;
        }
    }
    terms
}

/// Run the lexical stage: one candidate per turn carrying its best score,
/// best first, at most `max_results * CANDIDATE_MULTIPLIER`.
pub async fn search(
    store: &dyn MemoryStore,
    query: &str,
    window: TimeWindow,
    max_results: usize,
) -> MnemosResult<Vec<Candidate>> {
    let terms = extract_terms(query);
    if terms.is_empty() {
        debug!("No searchable terms after sanitizing");
        return Ok(Vec::new());
    }
    let cap = max_results.saturating_mul(CANDIDATE_MULTIPLIER).max(1);
    let hits = store.search_keywords(&terms, window, cap).await?;

    let mut by_turn: HashMap<TurnId, Candidate> = HashMap::with_capacity(hits.len());
    for hit in hits {
        let candidate = Candidate::from_lexical(hit);
        if !window.contains(candidate.timestamp_ms) {
            continue;
        }
        match by_turn.get_mut(&candidate.turn_id) {
            Some(existing) => existing.merge(candidate),
            None => {
                by_turn.insert(candidate.turn_id.clone(), candidate);
            }
        }
    }

    let mut candidates: Vec<Candidate> = by_turn.into_values().collect();
    candidates.sort_by(|a, b| {
        b.lexical_score
            .partial_cmp(&a.lexical_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.timestamp_ms.cmp(&a.timestamp_ms))
    });
    candidates.truncate(cap);
    debug!(terms = terms.len(), candidates = candidates.len(), "Lexical stage");
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operators_are_stripped() {
        assert_eq!(sanitize_query("cats AND dogs"), "cats dogs");
        assert_eq!(sanitize_query("cats or dogs NOT birds"), "cats dogs birds");
        assert_eq!(sanitize_query("alpha NEAR/3 beta near gamma"), "alpha beta gamma");
    }

    #[test]
    fn test_words_containing_operators_survive() {
        assert_eq!(sanitize_query("android ordinary notion"), "android ordinary notion");
    }

    #[test]
    fn test_special_characters_are_stripped() {
        assert_eq!(
            sanitize_query("\"what's (up)?\" col:val ^boost* -x +y ~z!"),
            "what s up col val boost x y z"
        );
        assert_eq!(sanitize_query("[a]{b}, c."), "a b c");
    }

    #[test]
    fn test_operator_only_query_yields_no_terms() {
        assert_eq!(sanitize_query("((((\"\"\"***"), "");
        assert!(extract_terms("AND OR NOT").is_empty());
    }

    #[test]
    fn test_extract_terms_dedupes_and_lowercases() {
        assert_eq!(
            extract_terms("Rose rose ROSE garden a"),
            vec!["rose".to_string(), "garden".to_string()]
        );
    }
}
