//! Token-sort fuzzy matching for entity names.
//!
//! Names are lowercased, split into alphanumeric tokens, sorted, and
//! rejoined before a normalized-Levenshtein comparison, so word order and
//! punctuation differences ("repository pattern" vs "pattern, repository")
//! do not defeat the match.

use strsim::normalized_levenshtein;

/// Lowercase alphanumeric tokens, sorted.
fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<String> = s
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect();
    tokens.sort();
    tokens.join(" ")
}

/// Token-sort similarity ratio in [0, 1].
pub fn token_sort_ratio(a: &str, b: &str) -> f64 {
    let ta = sorted_tokens(a);
    let tb = sorted_tokens(b);
    if ta.is_empty() && tb.is_empty() {
        return 1.0;
    }
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    normalized_levenshtein(&ta, &tb)
}
