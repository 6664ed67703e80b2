//! Fuzzy identifier matching
//!
//! Scores are in [0, 1]. A score is the best of three signals:
//! normalized Levenshtein, Sørensen–Dice bigram overlap, and a fixed
//! segment score when the word equals one `_`-separated part of the
//! candidate (so `id` finds `product_id`).

use strsim::{normalized_levenshtein, sorensen_dice};

const SEGMENT_SCORE: f64 = 0.75;

/// Case-insensitive similarity between `word` and `candidate`.
pub fn similarity(word: &str, candidate: &str) -> f64 {
    let word = word.to_lowercase();
    let candidate = candidate.to_lowercase();
    if word == candidate {
        return 1.0;
    }
    if word.is_empty() || candidate.is_empty() {
        return 0.0;
    }

    let mut score = normalized_levenshtein(&word, &candidate).max(sorensen_dice(&word, &candidate));
    if candidate.contains('_') && candidate.split('_').any(|segment| segment == word) {
        score = score.max(SEGMENT_SCORE);
    }
    score
}

/// Up to `n` candidates scoring at least `cutoff`, best first.
///
/// Ties keep candidate order, so results are deterministic for a given
/// schema ordering.
pub fn close_matches<'a, I>(word: &str, candidates: I, n: usize, cutoff: f64) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    if n == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(f64, &str)> = candidates
        .into_iter()
        .map(|c| (similarity(word, c), c))
        .filter(|(score, _)| *score >= cutoff)
        .collect();
    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(n).map(|(_, c)| c.to_string()).collect()
}

/// Best single match, if any clears `cutoff`.
pub fn best_match<'a, I>(word: &str, candidates: I, cutoff: f64) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    close_matches(word, candidates, 1, cutoff).into_iter().next()
}
