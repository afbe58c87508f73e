//! Voting and consensus evaluation.
//!
//! Ballots are cast over the candidate proposals surfaced in the debate.
//! Before tallying, semantically equivalent choices are grouped so
//! wording differences between agents don't manufacture disagreement.
//! Five policies decide whether consensus was reached; each reports its
//! natural confidence statistic.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::convergence::{SimilarityBackend, SimilarityResult};
use super::state::ConsensusPolicy;

/// Similarity at which two vote choices count as the same option.
pub const VOTE_GROUPING_THRESHOLD: f64 = 0.85;

/// One cast vote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
    pub agent: String,
    pub choice: String,
    pub confidence: Option<f64>,
    /// Round in which the chosen proposal first appeared.
    pub proposal_round: u32,
}

/// Aggregate statistics per (grouped) choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceStats {
    pub count: usize,
    pub voters: Vec<String>,
    pub mean_confidence: Option<f64>,
    pub earliest_round: u32,
    pub weighted_score: f64,
}

/// Result of evaluating a consensus policy over ballots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteTally {
    pub policy: ConsensusPolicy,
    pub reached: bool,
    pub choice: Option<String>,
    /// Policy's natural statistic: fraction agreeing, weighted share, or
    /// the judge's stated confidence.
    pub confidence: f64,
    pub distribution: BTreeMap<String, ChoiceStats>,
}

impl VoteTally {
    /// Agents that voted for the winning choice.
    pub fn winners(&self) -> Vec<String> {
        match &self.choice {
            Some(choice) => self
                .distribution
                .get(choice)
                .map(|s| s.voters.clone())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Whether the distribution yields a strict plurality usable for
    /// ranking even without consensus.
    pub fn has_strict_plurality(&self) -> bool {
        let mut counts: Vec<usize> = self.distribution.values().map(|s| s.count).collect();
        counts.sort_unstable_by(|a, b| b.cmp(a));
        match counts.as_slice() {
            [] => false,
            [_] => true,
            [first, second, ..] => first > second,
        }
    }
}

/// Merge semantically equivalent choices, rewriting ballots to the
/// canonical wording (the first occurrence).
pub async fn group_ballots(
    backend: &dyn SimilarityBackend,
    ballots: Vec<Ballot>,
    threshold: f64,
) -> SimilarityResult<Vec<Ballot>> {
    let mut canonical: Vec<String> = Vec::new();
    let mut grouped = Vec::with_capacity(ballots.len());
    for mut ballot in ballots {
        let mut mapped = None;
        for existing in &canonical {
            if *existing == ballot.choice
                || backend.similarity(existing, &ballot.choice).await? >= threshold
            {
                mapped = Some(existing.clone());
                break;
            }
        }
        match mapped {
            Some(choice) => {
                if choice != ballot.choice {
                    debug!(from = %ballot.choice, to = %choice, "vote choice grouped");
                }
                ballot.choice = choice;
            }
            None => canonical.push(ballot.choice.clone()),
        }
        grouped.push(ballot);
    }
    Ok(grouped)
}

fn build_distribution(
    ballots: &[Ballot],
    weights: &HashMap<String, f64>,
) -> BTreeMap<String, ChoiceStats> {
    let mut distribution: BTreeMap<String, ChoiceStats> = BTreeMap::new();
    for ballot in ballots {
        let stats = distribution
            .entry(ballot.choice.clone())
            .or_insert(ChoiceStats {
                count: 0,
                voters: Vec::new(),
                mean_confidence: None,
                earliest_round: ballot.proposal_round,
                weighted_score: 0.0,
            });
        stats.count += 1;
        stats.voters.push(ballot.agent.clone());
        stats.earliest_round = stats.earliest_round.min(ballot.proposal_round);
        stats.weighted_score += weights.get(&ballot.agent).copied().unwrap_or(1.0);
    }
    for (choice, stats) in distribution.iter_mut() {
        let confidences: Vec<f64> = ballots
            .iter()
            .filter(|b| &b.choice == choice)
            .filter_map(|b| b.confidence)
            .collect();
        if !confidences.is_empty() {
            stats.mean_confidence =
                Some(confidences.iter().sum::<f64>() / confidences.len() as f64);
        }
    }
    distribution
}

/// Evaluate a consensus policy over grouped ballots.
///
/// `weights` carries ELO-derived voter weights normalized so the
/// maximum is 1.0 (only the `weighted` policy reads them). `judge`
/// names the deciding agent for the `judge` policy.
pub fn tally(
    policy: ConsensusPolicy,
    threshold: f64,
    ballots: &[Ballot],
    weights: &HashMap<String, f64>,
    judge: Option<&str>,
) -> VoteTally {
    let distribution = build_distribution(ballots, weights);
    let total = ballots.len();

    let empty = VoteTally {
        policy,
        reached: false,
        choice: None,
        confidence: 0.0,
        distribution: distribution.clone(),
    };
    if total == 0 {
        return empty;
    }

    match policy {
        ConsensusPolicy::Majority => {
            // Plurality wins; ties break by (a) highest mean confidence,
            // (b) earliest proposal round.
            let winner = distribution
                .iter()
                .max_by(|(_, a), (_, b)| {
                    a.count
                        .cmp(&b.count)
                        .then(
                            a.mean_confidence
                                .unwrap_or(0.0)
                                .partial_cmp(&b.mean_confidence.unwrap_or(0.0))
                                .unwrap_or(std::cmp::Ordering::Equal),
                        )
                        .then(b.earliest_round.cmp(&a.earliest_round))
                })
                .map(|(choice, stats)| (choice.clone(), stats.clone()));
            match winner {
                Some((choice, stats)) => {
                    let confidence = stats
                        .mean_confidence
                        .unwrap_or(stats.count as f64 / total as f64);
                    VoteTally {
                        policy,
                        reached: true,
                        choice: Some(choice),
                        confidence,
                        distribution,
                    }
                }
                None => empty,
            }
        }
        ConsensusPolicy::Supermajority => {
            let winner = distribution
                .iter()
                .max_by_key(|(_, stats)| stats.count)
                .map(|(choice, stats)| (choice.clone(), stats.count));
            match winner {
                Some((choice, count)) => {
                    let fraction = count as f64 / total as f64;
                    let reached = fraction >= threshold;
                    VoteTally {
                        policy,
                        reached,
                        choice: reached.then_some(choice),
                        confidence: fraction,
                        distribution,
                    }
                }
                None => empty,
            }
        }
        ConsensusPolicy::Unanimous => {
            if distribution.len() == 1 {
                let choice = distribution.keys().next().cloned();
                VoteTally {
                    policy,
                    reached: true,
                    choice,
                    confidence: 1.0,
                    distribution,
                }
            } else {
                empty
            }
        }
        ConsensusPolicy::Judge => {
            let verdict = judge.and_then(|j| ballots.iter().find(|b| b.agent == j));
            match verdict {
                Some(ballot) => VoteTally {
                    policy,
                    reached: true,
                    choice: Some(ballot.choice.clone()),
                    confidence: ballot.confidence.unwrap_or(0.5),
                    distribution,
                },
                None => empty,
            }
        }
        ConsensusPolicy::Weighted => {
            let total_weight: f64 = distribution.values().map(|s| s.weighted_score).sum();
            let winner = distribution
                .iter()
                .max_by(|(_, a), (_, b)| {
                    a.weighted_score
                        .partial_cmp(&b.weighted_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(choice, stats)| (choice.clone(), stats.weighted_score));
            match winner {
                Some((choice, score)) if total_weight > 0.0 => {
                    let share = score / total_weight;
                    let reached = share >= threshold;
                    VoteTally {
                        policy,
                        reached,
                        choice: reached.then_some(choice),
                        confidence: share,
                        distribution,
                    }
                }
                _ => empty,
            }
        }
    }
}
