//! Position-flip detection and classification.
//!
//! A flip relates two positions of the same agent, from older to newer
//! (the graph is acyclic by construction). Classification runs on the
//! embedding similarity of the two claims plus two textual signals:
//! an explicit withdrawal and an opposite-stance (negation) check.

use regex::Regex;

use super::{FlipKind, Position};
use crate::debate::convergence::LexicalBackend;

/// Classification thresholds.
#[derive(Debug, Clone, Copy)]
pub struct FlipSettings {
    /// At or above: same claim, not a flip (when text is unchanged).
    pub tau_same: f64,
    /// At or above with non-decreasing confidence: refinement.
    pub tau_refine: f64,
    /// Below: contradiction/retraction territory.
    pub tau_qual: f64,
    /// Prior positions scanned per new position.
    pub scan_limit: u32,
    /// How much a qualification counts against consistency (0 = not at
    /// all, which is the recorded default).
    pub qualification_weight: f64,
}

impl Default for FlipSettings {
    fn default() -> Self {
        Self {
            tau_same: 0.9,
            tau_refine: 0.75,
            tau_qual: 0.45,
            scan_limit: 50,
            qualification_weight: 0.0,
        }
    }
}

/// Whether the new claim explicitly withdraws a prior one.
pub fn asserts_withdrawal(text: &str) -> bool {
    let re = Regex::new(
        r"(?i)\b(retract|withdraw|no longer (claim|believe|hold)|i was wrong|take (that|it) back)\b",
    )
    .expect("withdrawal regex");
    re.is_match(text)
}

/// Opposite-stance detection: a content term negated in one claim but
/// plain in the other. Tokenization shares the negation scoping used by
/// the lexical embedding, so both signals agree on what "negated" means.
pub fn opposite_stance(old_text: &str, new_text: &str) -> bool {
    let split = |text: &str| {
        let mut plain = std::collections::HashSet::new();
        let mut negated = std::collections::HashSet::new();
        for token in LexicalBackend::tokens(text) {
            match token.strip_prefix("neg<").and_then(|t| t.strip_suffix('>')) {
                Some(term) => {
                    negated.insert(term.to_string());
                }
                None => {
                    plain.insert(token);
                }
            }
        }
        (plain, negated)
    };
    let (old_plain, old_negated) = split(old_text);
    let (new_plain, new_negated) = split(new_text);
    old_plain.intersection(&new_negated).next().is_some()
        || new_plain.intersection(&old_negated).next().is_some()
}

fn normalized(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Classify the relation between an older and a newer position of the
/// same agent given their embedding similarity.
pub fn classify(
    settings: &FlipSettings,
    old: &Position,
    new: &Position,
    similarity: f64,
) -> Option<FlipKind> {
    if similarity >= settings.tau_same && normalized(&old.claim) == normalized(&new.claim) {
        return None;
    }
    if similarity >= settings.tau_refine {
        if new.confidence >= old.confidence {
            return Some(FlipKind::Refinement);
        }
        // Same subject with eroding confidence reads as hedging.
        return Some(FlipKind::Qualification);
    }
    if similarity >= settings.tau_qual {
        return Some(FlipKind::Qualification);
    }
    if asserts_withdrawal(&new.claim) {
        return Some(FlipKind::Retraction);
    }
    if opposite_stance(&old.claim, &new.claim) {
        return Some(FlipKind::Contradiction);
    }
    None
}

/// Consistency score from flip counts, clamped to [0, 1].
pub fn consistency_score(
    contradictions_and_retractions: u32,
    qualifications: u32,
    total_positions: u32,
    qualification_weight: f64,
) -> f64 {
    let weighted =
        contradictions_and_retractions as f64 + qualification_weight * qualifications as f64;
    (1.0 - weighted / (total_positions.max(1) as f64)).clamp(0.0, 1.0)
}
