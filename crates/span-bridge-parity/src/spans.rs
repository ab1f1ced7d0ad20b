//! Span candidate scoring and selection
//!
//! This algorithm is the parity contract: the companion runtime must
//! reproduce it exactly. A candidate at grid position (start, width) covers
//! tokens `[start, start + width + 1)`; the end bound is exclusive. Candidates
//! are kept when their score meets the threshold and the range fits the text,
//! then sorted by confidence descending (stable) and selected greedily,
//! rejecting any candidate whose token range intersects an already-selected
//! one.

use serde::{Deserialize, Serialize};
use span_bridge_core::tokenizer::Encoding;

/// One thresholded span candidate, in token coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct SpanCandidate {
    pub start: usize,
    /// Exclusive end: `start + width + 1`
    pub end: usize,
    pub score: f32,
    pub label: String,
}

impl SpanCandidate {
    fn overlaps(&self, other: &SpanCandidate) -> bool {
        !(self.end <= other.start || self.start >= other.end)
    }
}

/// A selected span resolved back to the input text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictedEntity {
    pub text: String,
    pub label: String,
    pub score: f32,
    pub token_start: usize,
    pub token_end: usize,
    /// Byte offsets into the original text; absent when the token-to-char
    /// maps do not cover the span and the text was joined from raw tokens.
    pub char_start: Option<usize>,
    pub char_end: Option<usize>,
}

/// Walk a `[text_len, max_width]` score grid and keep every valid candidate
/// whose score meets the threshold.
///
/// Validity: `0 <= start < text_len` and `start + width + 1 <= text_len`.
pub fn find_valid_spans(
    scores: &[f32],
    text_len: usize,
    max_width: usize,
    threshold: f32,
    label: &str,
) -> Vec<SpanCandidate> {
    let mut candidates = Vec::new();
    if scores.len() != text_len * max_width {
        return candidates;
    }
    for start in 0..text_len {
        for width in 0..max_width {
            let score = scores[start * max_width + width];
            if score < threshold {
                continue;
            }
            let end = start + width + 1;
            if start < text_len && end <= text_len {
                candidates.push(SpanCandidate { start, end, score, label: label.to_string() });
            }
        }
    }
    candidates
}

/// Greedy non-overlap selection over candidates from all labels.
///
/// The sort is stable, so equal scores keep their original relative order,
/// and selection is deterministic for a given candidate list.
pub fn select_spans(mut candidates: Vec<SpanCandidate>) -> Vec<SpanCandidate> {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

    let mut selected: Vec<SpanCandidate> = Vec::new();
    for candidate in candidates {
        if selected.iter().any(|s| candidate.overlaps(s)) {
            continue;
        }
        selected.push(candidate);
    }
    selected
}

/// Resolve a selected candidate to text and character offsets.
///
/// Offsets come from the tokenizer's start/end maps when they cover the span;
/// otherwise the entity text is the raw tokens joined with single spaces and
/// the offsets are absent.
pub fn resolve_entity(candidate: &SpanCandidate, encoding: &Encoding, text: &str) -> PredictedEntity {
    let start = candidate.start;
    let end = candidate.end;

    let offsets = match (encoding.start_map.get(start), encoding.end_map.get(end - 1)) {
        (Some(&cs), Some(&ce)) if ce <= text.len() && cs <= ce => Some((cs, ce)),
        _ => None,
    };

    let (span_text, char_start, char_end) = match offsets {
        Some((cs, ce)) => (text[cs..ce].to_string(), Some(cs), Some(ce)),
        None => {
            let joined = encoding
                .text_tokens
                .get(start..end)
                .map(|tokens| tokens.join(" "))
                .unwrap_or_default();
            (joined, None, None)
        }
    };

    PredictedEntity {
        text: span_text,
        label: candidate.label.clone(),
        score: candidate.score,
        token_start: start,
        token_end: end,
        char_start,
        char_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use span_bridge_core::tokenizer::WordTokenizer;

    fn candidate(start: usize, end: usize, score: f32) -> SpanCandidate {
        SpanCandidate { start, end, score, label: "person".into() }
    }

    #[test]
    fn test_boundary_validity() {
        // text of length 1: (start=0, width=0) gives end=1, valid
        let found = find_valid_spans(&[0.9], 1, 1, 0.4, "person");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].end, 1);

        // width = text_len gives end = text_len + 1, invalid
        let scores = vec![0.0, 0.9]; // width 1 slot scores 0.9
        let found = find_valid_spans(&scores, 1, 2, 0.4, "person");
        assert!(found.is_empty());
    }

    #[test]
    fn test_threshold_filters() {
        let scores = vec![0.39, 0.4, 0.41];
        let found = find_valid_spans(&scores, 3, 1, 0.4, "x");
        // Meets-or-exceeds, so 0.4 itself passes
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].start, 1);
    }

    #[test]
    fn test_overlap_rejection() {
        // [0,3) at 0.9 beats [2,5) at 0.7
        let selected = select_spans(vec![candidate(2, 5, 0.7), candidate(0, 3, 0.9)]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].start, 0);
        assert_eq!(selected[0].score, 0.9);
    }

    #[test]
    fn test_adjacent_spans_both_kept() {
        let selected = select_spans(vec![candidate(0, 2, 0.8), candidate(2, 4, 0.7)]);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_selection_is_idempotent() {
        let candidates = vec![
            candidate(0, 3, 0.9),
            candidate(2, 5, 0.7),
            candidate(5, 6, 0.5),
            candidate(4, 6, 0.5),
        ];
        let first = select_spans(candidates.clone());
        let second = select_spans(candidates);
        assert_eq!(first, second);
    }

    #[test]
    fn test_equal_scores_keep_input_order() {
        let selected = select_spans(vec![candidate(0, 2, 0.5), candidate(1, 3, 0.5)]);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].start, 0);
    }

    #[test]
    fn test_resolve_entity_uses_char_maps() {
        let tokenizer = WordTokenizer::from_words(["john", "smith", "works"]);
        let text = "John Smith works";
        let encoding = tokenizer.encode(text, 512);
        let entity = resolve_entity(&candidate(0, 2, 0.9), &encoding, text);
        assert_eq!(entity.text, "John Smith");
        assert_eq!(entity.char_start, Some(0));
        assert_eq!(entity.char_end, Some(10));
    }

    #[test]
    fn test_resolve_entity_falls_back_to_joined_tokens() {
        let tokenizer = WordTokenizer::from_words(["a", "b"]);
        let text = "a b";
        let mut encoding = tokenizer.encode(text, 512);
        encoding.end_map.clear(); // simulate a tokenizer without offset maps
        let entity = resolve_entity(&candidate(0, 2, 0.9), &encoding, text);
        assert_eq!(entity.text, "a b");
        assert!(entity.char_start.is_none());
    }
}
