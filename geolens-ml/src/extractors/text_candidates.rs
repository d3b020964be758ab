//! Geocoding candidate selection
//!
//! OCR output is noisy: price tags, phone numbers, opening hours. Geocoding
//! is rate limited, so every fragment sent to the geocoder has to earn its
//! slot. This filter drops fragments unlikely to name a place and ranks
//! street-address-shaped text first.

use crate::types::TextFragment;
use regex::Regex;
use std::sync::OnceLock;

fn street_address_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\d+\s+[\w\s]+(Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr)\b")
            .expect("street address regex is valid")
    })
}

fn digits_only_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[\d\s\-.,:/]+$").expect("digits regex is valid"))
}

/// Filter and rank OCR fragments for geocoding.
///
/// Keeps fragments that pass the confidence floor, have at least
/// `min_length` non-whitespace-trimmed characters, and contain something
/// other than digits and punctuation. Phone-shaped text (parenthesized
/// area codes) is dropped. Street-address-shaped fragments sort first;
/// within each group, higher OCR confidence wins.
pub fn select_candidates(
    fragments: &[TextFragment],
    min_confidence: f32,
    min_length: usize,
) -> Vec<String> {
    let mut scored: Vec<(bool, f32, String)> = fragments
        .iter()
        .filter_map(|fragment| {
            let text = fragment.text.trim();
            if fragment.confidence < min_confidence || text.chars().count() < min_length {
                return None;
            }
            if digits_only_regex().is_match(text) {
                return None;
            }
            // Parenthesized digits are phone numbers, not addresses
            if text.contains('(') && text.contains(')') {
                return None;
            }
            let is_address = street_address_regex().is_match(text);
            Some((is_address, fragment.confidence, text.to_string()))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.0.cmp(&a.0).then(
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    scored.into_iter().map(|(_, _, text)| text).collect()
}
