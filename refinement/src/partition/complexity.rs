//! Complexity scoring for units.
//!
//! `score = 1.0 * (words / 100) + 0.5 * structural_elements + 10 * claim_density`
//!
//! | score   | band   | min rounds |
//! |---------|--------|------------|
//! | < 4     | low    | 3          |
//! | < 8     | medium | 5          |
//! | >= 8    | high   | 6          |

use std::sync::LazyLock;

use regex::Regex;

use super::facts::count_markers;
use crate::unit::{ComplexityBand, ComplexityScore};

const WORD_WEIGHT: f64 = 1.0;
const STRUCTURE_WEIGHT: f64 = 0.5;
const CLAIM_WEIGHT: f64 = 10.0;

const LOW_CEILING: f64 = 4.0;
const MEDIUM_CEILING: f64 = 8.0;

static STRUCTURAL_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(#{1,6}\s|[-*+]\s|\d+[.)]\s|\||!\[|\$\$|(?i:figure|fig\.|equation|eq\.)\s*\d)")
        .expect("STRUCTURAL_LINE regex should compile")
});

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[.!?]+(\s+|$)").expect("SENTENCE_END regex should compile"));

/// Split prose into trimmed, non-empty sentences.
pub fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END.find_iter(text) {
        let sentence = text[start..m.end()].trim();
        if !sentence.is_empty() {
            out.push(sentence);
        }
        start = m.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

pub fn count_structural_elements(text: &str) -> usize {
    text.lines().filter(|line| STRUCTURAL_LINE.is_match(line)).count()
}

/// Fraction of sentences carrying a digit or a fact marker.
pub fn claim_density(text: &str) -> f64 {
    let all = sentences(text);
    if all.is_empty() {
        return 0.0;
    }
    let claims = all
        .iter()
        .filter(|s| s.chars().any(|c| c.is_ascii_digit()) || count_markers(s) > 0)
        .count();
    claims as f64 / all.len() as f64
}

pub fn band_for(value: f64) -> ComplexityBand {
    if value < LOW_CEILING {
        ComplexityBand::Low
    } else if value < MEDIUM_CEILING {
        ComplexityBand::Medium
    } else {
        ComplexityBand::High
    }
}

/// Score a unit's content.
pub fn score(text: &str) -> ComplexityScore {
    let words = text.split_whitespace().count();
    let structural_elements = count_structural_elements(text);
    let claim_density = claim_density(text);

    let value = WORD_WEIGHT * (words as f64 / 100.0)
        + STRUCTURE_WEIGHT * structural_elements as f64
        + CLAIM_WEIGHT * claim_density;

    ComplexityScore {
        value,
        words,
        structural_elements,
        claim_density,
        band: band_for(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentences() {
        let s = sentences("First one. Second one! Third? tail without stop");
        assert_eq!(s.len(), 4);
        assert_eq!(s[0], "First one.");
        assert_eq!(s[3], "tail without stop");
        // Decimal points are not sentence ends.
        assert_eq!(sentences("Gain is 3.5 dB here.").len(), 1);
    }

    #[test]
    fn test_structural_elements() {
        let text = "## Results\n- item\n* item\n1. first\n| a | b |\n![fig](x.png)\nFigure 3 shows\nplain line";
        assert_eq!(count_structural_elements(text), 7);
    }

    #[test]
    fn test_plain_prose_is_low() {
        let s = score("A short paragraph with no claims. It reads easily.");
        assert_eq!(s.band, ComplexityBand::Low);
        assert_eq!(s.claim_density, 0.0);
        assert_eq!(s.structural_elements, 0);
    }

    #[test]
    fn test_claim_heavy_is_medium_or_higher() {
        // Every sentence has a number: density 1.0 contributes 10.
        let s = score("We measured 3 W. Efficiency hit 42%. Loss was 0.2 dB.");
        assert_eq!(s.claim_density, 1.0);
        assert_eq!(s.band, ComplexityBand::High);

        // Half the sentences: 5.0 total, medium.
        let s = score("We measured 3 W. It was stable.");
        assert_eq!(s.band, ComplexityBand::Medium);
    }

    #[test]
    fn test_band_boundaries() {
        assert_eq!(band_for(0.0), ComplexityBand::Low);
        assert_eq!(band_for(3.99), ComplexityBand::Low);
        assert_eq!(band_for(4.0), ComplexityBand::Medium);
        assert_eq!(band_for(7.99), ComplexityBand::Medium);
        assert_eq!(band_for(8.0), ComplexityBand::High);
    }

    #[test]
    fn test_empty_text() {
        let s = score("");
        assert_eq!(s.words, 0);
        assert_eq!(s.value, 0.0);
        assert_eq!(s.band, ComplexityBand::Low);
    }
}
