//! Pairwise ELO arithmetic.
//!
//! N-way debates decompose into C(N,2) pairwise outcomes: every winner
//! beats every loser, winners draw among themselves, losers draw among
//! themselves. Deltas are zero-sum by construction.

use std::collections::BTreeMap;

/// ELO tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct EloSettings {
    pub k: f64,
    pub initial: f64,
}

impl Default for EloSettings {
    fn default() -> Self {
        Self {
            k: 32.0,
            initial: 1500.0,
        }
    }
}

/// Standard logistic expected score for `a` against `b`.
pub fn expected_score(rating_a: f64, rating_b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
}

/// Compute per-agent ELO deltas for one match.
///
/// `ratings` holds the current rating of every participant; `winners`
/// names the subset on the winning side (empty means an all-draw).
pub fn match_deltas(
    ratings: &BTreeMap<String, f64>,
    winners: &[String],
    k: f64,
) -> BTreeMap<String, f64> {
    let agents: Vec<&String> = ratings.keys().collect();
    let mut deltas: BTreeMap<String, f64> =
        agents.iter().map(|a| ((*a).clone(), 0.0)).collect();

    for i in 0..agents.len() {
        for j in (i + 1)..agents.len() {
            let (a, b) = (agents[i], agents[j]);
            let a_won = winners.contains(a);
            let b_won = winners.contains(b);
            let score_a = match (a_won, b_won) {
                (true, false) => 1.0,
                (false, true) => 0.0,
                _ => 0.5,
            };
            let expected_a = expected_score(ratings[a], ratings[b]);
            let change = k * (score_a - expected_a);
            *deltas.get_mut(a).expect("participant") += change;
            *deltas.get_mut(b).expect("participant") -= change;
        }
    }
    deltas
}

/// Normalized ELO-derived vote weights with the maximum at 1.0.
pub fn vote_weights(ratings: &BTreeMap<String, f64>) -> BTreeMap<String, f64> {
    let max = ratings.values().cloned().fold(f64::MIN, f64::max);
    if max <= 0.0 {
        return ratings.keys().map(|a| (a.clone(), 1.0)).collect();
    }
    ratings
        .iter()
        .map(|(agent, rating)| (agent.clone(), (rating / max).clamp(0.0, 1.0)))
        .collect()
}
