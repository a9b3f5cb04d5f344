//! Allergy term standardization
//!
//! Free-text allergy entries are cleaned and matched against a reference
//! vocabulary with an edit distance that treats QWERTY-neighbour typos as
//! half a mistake. Terms that match nothing closely enough are handed to
//! an external [`AllergyFallback`], typically a generative model.

use std::cmp::Ordering;

use log::debug;
use serde::Serialize;

use crate::error::Result;

/// Default minimum similarity for a vocabulary match
pub const DEFAULT_THRESHOLD: f64 = 0.8;

const QWERTY_ROWS: [&str; 3] = ["qwertyuiop", "asdfghjkl", "zxcvbnm"];

const ADJACENT_SUBSTITUTION_COST: f64 = 0.5;
const EDIT_COST: f64 = 1.0;

/// Leading phrases that carry no information about the allergen
const BOILERPLATE: &[&str] = &[
    "paciente refere alergia a",
    "paciente refere alergia",
    "paciente alérgico a",
    "paciente alergico a",
    "paciente alérgica a",
    "paciente alergica a",
    "refere alergia a",
    "refere alergia",
    "alergia a",
    "alergia",
    "alérgico a",
    "alergico a",
    "alérgica a",
    "alergica a",
    "refere",
    "relata",
];

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllergyMatch {
    pub raw: String,
    pub cleaned: String,
    pub term: String,
    pub similarity: f64,
    /// Matched by the fallback rather than by edit distance
    pub via_fallback: bool,
}

/// A term with no vocabulary match at or above the threshold
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnmatchedTerm {
    pub raw: String,
    pub cleaned: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StandardizationResult {
    pub matched: Vec<AllergyMatch>,
    pub unmatched: Vec<UnmatchedTerm>,
}

/// Second-pass classifier for terms the edit distance could not place.
/// Returns one optional vocabulary term per input, in input order.
pub trait AllergyFallback {
    fn classify(&self, terms: &[String], vocabulary: &[String]) -> Result<Vec<Option<String>>>;
}

pub struct AllergyStandardizer {
    vocabulary: Vec<String>,
    normalized: Vec<String>,
    threshold: f64,
}

impl AllergyStandardizer {
    pub fn new(vocabulary: Vec<String>, threshold: f64) -> Self {
        let normalized = vocabulary.iter().map(|t| t.trim().to_lowercase()).collect();
        AllergyStandardizer {
            vocabulary,
            normalized,
            threshold,
        }
    }

    pub fn vocabulary(&self) -> &[String] {
        &self.vocabulary
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Best vocabulary match for one cleaned term, if any clears the threshold
    pub fn best_match(&self, cleaned: &str) -> Option<(usize, f64)> {
        let mut scored: Vec<(usize, f64)> = self
            .normalized
            .iter()
            .enumerate()
            .map(|(idx, term)| (idx, similarity(cleaned, term)))
            .collect();
        // stable: equal scores keep vocabulary order
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.into_iter().next().filter(|(_, score)| *score >= self.threshold)
    }

    pub fn standardize<S: AsRef<str>>(&self, raw_terms: &[S]) -> StandardizationResult {
        let mut result = StandardizationResult::default();

        for raw in raw_terms {
            for piece in split_terms(raw.as_ref()) {
                let cleaned = clean_term(&piece);
                if cleaned.is_empty() {
                    continue;
                }
                match self.best_match(&cleaned) {
                    Some((idx, score)) => result.matched.push(AllergyMatch {
                        raw: piece,
                        cleaned,
                        term: self.vocabulary[idx].clone(),
                        similarity: score,
                        via_fallback: false,
                    }),
                    None => result.unmatched.push(UnmatchedTerm { raw: piece, cleaned }),
                }
            }
        }

        debug!(
            "Standardized allergies: {} matched, {} unmatched",
            result.matched.len(),
            result.unmatched.len()
        );
        result
    }

    /// Standardize, then send the unmatched terms through `fallback`.
    /// Terms the fallback also cannot place stay unmatched.
    pub fn standardize_with_fallback<S, F>(&self, raw_terms: &[S], fallback: &F) -> Result<StandardizationResult>
    where
        S: AsRef<str>,
        F: AllergyFallback + ?Sized,
    {
        let mut result = self.standardize(raw_terms);
        if result.unmatched.is_empty() {
            return Ok(result);
        }

        let pending = std::mem::take(&mut result.unmatched);
        let cleaned: Vec<String> = pending.iter().map(|t| t.cleaned.clone()).collect();
        let answers = fallback.classify(&cleaned, &self.vocabulary)?;

        for (idx, unmatched) in pending.into_iter().enumerate() {
            match answers.get(idx).cloned().flatten() {
                Some(term) => {
                    let score = similarity(&unmatched.cleaned, &term.to_lowercase());
                    result.matched.push(AllergyMatch {
                        raw: unmatched.raw,
                        cleaned: unmatched.cleaned,
                        term,
                        similarity: score,
                        via_fallback: true,
                    });
                }
                None => result.unmatched.push(unmatched),
            }
        }
        Ok(result)
    }
}

/// Standardize `raw_terms` against `vocabulary` in one call
pub fn standardize<S: AsRef<str>>(raw_terms: &[S], vocabulary: &[String], threshold: f64) -> StandardizationResult {
    AllergyStandardizer::new(vocabulary.to_vec(), threshold).standardize(raw_terms)
}

/// Split a free-text entry into individual terms
pub fn split_terms(raw: &str) -> Vec<String> {
    raw.split(|c: char| matches!(c, ',' | ';' | '\n'))
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lowercase, drop list markers and boilerplate, collapse whitespace
pub fn clean_term(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let mut term = strip_list_marker(&lowered).to_string();

    loop {
        let stripped = BOILERPLATE
            .iter()
            .find_map(|phrase| {
                term.strip_prefix(phrase)
                    .filter(|rest| rest.is_empty() || rest.starts_with(|c: char| c == ':' || c.is_whitespace()))
            })
            .map(|rest| rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace()).to_string());
        match stripped {
            Some(rest) if rest != term => term = rest,
            _ => break,
        }
    }

    term.trim_end_matches(|c: char| matches!(c, '.' | ':' | ';' | ','))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_list_marker(term: &str) -> &str {
    let term = term.trim_start_matches(|c: char| matches!(c, '-' | '*' | '•' | '·') || c.is_whitespace());
    let digits = term.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let rest = &term[digits..];
        if let Some(rest) = rest.strip_prefix(')').or_else(|| rest.strip_prefix('.')) {
            return rest.trim_start();
        }
    }
    term
}

fn key_position(c: char) -> Option<(i32, i32)> {
    let c = c.to_ascii_lowercase();
    QWERTY_ROWS.iter().enumerate().find_map(|(row, keys)| {
        keys.chars()
            .position(|k| k == c)
            .map(|col| (row as i32, col as i32))
    })
}

fn substitution_cost(a: char, b: char) -> f64 {
    if a == b {
        return 0.0;
    }
    match (key_position(a), key_position(b)) {
        (Some((ra, ca)), Some((rb, cb))) if (ra - rb).abs() + (ca - cb).abs() == 1 => ADJACENT_SUBSTITUTION_COST,
        _ => EDIT_COST,
    }
}

/// Edit distance with keyboard-adjacency-weighted substitutions
pub fn keyboard_distance(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();

    let mut previous: Vec<f64> = (0..=b.len()).map(|j| j as f64 * EDIT_COST).collect();
    let mut current = vec![0.0; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = (i + 1) as f64 * EDIT_COST;
        for (j, &cb) in b.iter().enumerate() {
            let deletion = previous[j + 1] + EDIT_COST;
            let insertion = current[j] + EDIT_COST;
            let substitution = previous[j] + substitution_cost(ca, cb);
            current[j + 1] = deletion.min(insertion).min(substitution);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// `1 - distance / max(len(a), len(b))`, 1.0 for two empty strings
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - keyboard_distance(a, b) / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MergeError;

    fn vocabulary() -> Vec<String> {
        ["Dipirona", "Penicilina", "Amoxicilina", "Lactose", "Camarão"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_adjacent_typo_costs_half() {
        // 'o' and 'p' are neighbours on the top row
        assert_eq!(keyboard_distance("dipirona", "dipirpna"), 0.5);
        assert_eq!(similarity("dipirona", "dipirpna"), 1.0 - 0.5 / 8.0);
        // 'a' and 'x' are two keys apart
        assert_eq!(keyboard_distance("a", "x"), 1.0);
        assert_eq!(keyboard_distance("abc", ""), 3.0);
    }

    #[test]
    fn test_similarity_bounds() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("lactose", "lactose"), 1.0);
        assert_eq!(similarity("abc", "xyz"), 0.0);
    }

    #[test]
    fn test_clean_term() {
        assert_eq!(clean_term("  - Alergia a Dipirona."), "dipirona");
        assert_eq!(clean_term("1) refere alergia a   camarão"), "camarão");
        assert_eq!(clean_term("2. Paciente alérgico a: penicilina"), "penicilina");
        assert_eq!(clean_term("• lactose"), "lactose");
        assert_eq!(clean_term("alergia"), "");
        assert_eq!(clean_term("relatadina"), "relatadina");
    }

    #[test]
    fn test_split_terms() {
        assert_eq!(
            split_terms("dipirona, penicilina;\n lactose,,"),
            vec!["dipirona", "penicilina", "lactose"]
        );
    }

    #[test]
    fn test_standardize_splits_matched_and_unmatched() {
        let result = standardize(
            &["Alergia a dipirpna, amoxicilina", "- poeira"],
            &vocabulary(),
            DEFAULT_THRESHOLD,
        );
        let terms: Vec<&str> = result.matched.iter().map(|m| m.term.as_str()).collect();
        assert_eq!(terms, vec!["Dipirona", "Amoxicilina"]);
        assert_eq!(result.matched[1].similarity, 1.0);
        assert_eq!(
            result.unmatched,
            vec![UnmatchedTerm {
                raw: "- poeira".to_string(),
                cleaned: "poeira".to_string(),
            }]
        );
    }

    #[test]
    fn test_ties_keep_vocabulary_order() {
        let vocab = vec!["ab".to_string(), "ac".to_string()];
        let standardizer = AllergyStandardizer::new(vocab, 0.1);
        // "aa" is one substitution away from both
        let (idx, score) = standardizer.best_match("aa").unwrap();
        assert_eq!(idx, 0);
        assert_eq!(score, 0.5);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let standardizer = AllergyStandardizer::new(vec!["abcd".to_string()], 0.75);
        assert!(standardizer.best_match("abcz").is_some());
        assert!(standardizer.best_match("abzz").is_none());
    }

    struct FixedFallback;

    impl AllergyFallback for FixedFallback {
        fn classify(&self, terms: &[String], _vocabulary: &[String]) -> Result<Vec<Option<String>>> {
            Ok(terms
                .iter()
                .map(|t| if t.contains("camar") { Some("Camarão".to_string()) } else { None })
                .collect())
        }
    }

    struct BrokenFallback;

    impl AllergyFallback for BrokenFallback {
        fn classify(&self, _terms: &[String], _vocabulary: &[String]) -> Result<Vec<Option<String>>> {
            Err(MergeError::Fallback("model unavailable".to_string()))
        }
    }

    #[test]
    fn test_fallback_places_remaining_terms() {
        let standardizer = AllergyStandardizer::new(vocabulary(), 0.95);
        let result = standardizer
            .standardize_with_fallback(&["Alergia a frutos do mar e Camarões.", "pólen"], &FixedFallback)
            .unwrap();
        assert_eq!(result.matched.len(), 1);
        assert!(result.matched[0].via_fallback);
        assert_eq!(result.matched[0].term, "Camarão");
        assert_eq!(result.matched[0].raw, "Alergia a frutos do mar e Camarões.");
        assert_eq!(result.matched[0].cleaned, "frutos do mar e camarões");
        let unmatched: Vec<&str> = result.unmatched.iter().map(|t| t.cleaned.as_str()).collect();
        assert_eq!(unmatched, vec!["pólen"]);
    }

    #[test]
    fn test_fallback_error_propagates() {
        let standardizer = AllergyStandardizer::new(vocabulary(), 0.95);
        assert!(standardizer
            .standardize_with_fallback(&["xyz"], &BrokenFallback)
            .is_err());
        // nothing unmatched: fallback never called
        assert!(standardizer
            .standardize_with_fallback(&["lactose"], &BrokenFallback)
            .is_ok());
    }
}
