//! Ranking: ELO matches, position tracking, flips, and consistency.
//!
//! The engine exclusively owns `Match`, `AgentRating`, and `Flip` rows.
//! It depends on a narrow [`RankingStore`] capability so the storage
//! adapter and test fakes plug in interchangeably.

pub mod elo;
pub mod flips;

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::debate::convergence::{cosine, SharedSimilarity};
use crate::events::{DebateEvent, EventKind, EventSink};

pub use elo::EloSettings;
pub use flips::FlipSettings;

#[derive(Debug, thiserror::Error)]
pub enum RankingError {
    #[error("ranking store failure: {0}")]
    Store(String),
    #[error("event emission failed: {0}")]
    Emit(String),
    #[error("similarity backend failure: {0}")]
    Similarity(String),
    #[error("match needs at least two participants, got {0}")]
    TooFewParticipants(usize),
}

pub type RankingResult<T> = Result<T, RankingError>;

/// Verification status of a tracked position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionOutcome {
    Pending,
    Correct,
    Incorrect,
    Unknown,
}

impl PositionOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Correct => "correct",
            Self::Incorrect => "incorrect",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "correct" => Self::Correct,
            "incorrect" => Self::Incorrect,
            "unknown" => Self::Unknown,
            _ => Self::Pending,
        }
    }
}

/// A claim attributable to one agent in one debate at one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Option<i64>,
    pub agent: String,
    pub claim: String,
    pub confidence: f64,
    pub domain: String,
    pub debate_id: String,
    pub round: u32,
    pub outcome: PositionOutcome,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
}

/// Kind of relation between two positions of the same agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlipKind {
    Contradiction,
    Retraction,
    Qualification,
    Refinement,
}

impl FlipKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contradiction => "contradiction",
            Self::Retraction => "retraction",
            Self::Qualification => "qualification",
            Self::Refinement => "refinement",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contradiction" => Some(Self::Contradiction),
            "retraction" => Some(Self::Retraction),
            "qualification" => Some(Self::Qualification),
            "refinement" => Some(Self::Refinement),
            _ => None,
        }
    }

    /// Whether this kind counts against consistency outright.
    pub fn damages_consistency(self) -> bool {
        matches!(self, Self::Contradiction | Self::Retraction)
    }
}

impl std::fmt::Display for FlipKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Directed edge from an older position to a newer one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flip {
    pub agent: String,
    pub original_position_id: i64,
    pub new_position_id: i64,
    pub similarity: f64,
    pub kind: FlipKind,
    pub domain: String,
    pub created_at: DateTime<Utc>,
}

/// One ELO event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: String,
    pub debate_id: String,
    pub domain: String,
    pub participants: Vec<String>,
    pub winner: Option<String>,
    pub elo_changes: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

/// Per-agent, per-domain rating row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRating {
    pub agent: String,
    pub domain: String,
    pub elo: f64,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    pub consistency: f64,
    pub updated_at: DateTime<Utc>,
}

impl AgentRating {
    pub fn fresh(agent: &str, domain: &str, initial_elo: f64) -> Self {
        Self {
            agent: agent.to_string(),
            domain: domain.to_string(),
            elo: initial_elo,
            wins: 0,
            losses: 0,
            draws: 0,
            consistency: 1.0,
            updated_at: Utc::now(),
        }
    }
}

/// Flip counts backing the consistency score.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyCounts {
    pub contradictions: u32,
    pub retractions: u32,
    pub qualifications: u32,
    pub total_positions: u32,
}

/// Consistency surfaced on the leaderboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub agent: String,
    pub consistency: f64,
    pub contradictions: u32,
    pub retractions: u32,
    pub qualifications: u32,
    pub total_positions: u32,
}

/// Storage capability the ranking engine needs.
pub trait RankingStore: Send + Sync {
    fn get_rating(&self, agent: &str, domain: &str) -> Result<Option<AgentRating>, String>;
    /// Persist the match and every updated rating as one atomic unit.
    fn record_match(&self, record: &MatchRecord, ratings: &[AgentRating]) -> Result<(), String>;
    fn insert_position(&self, position: &Position) -> Result<i64, String>;
    /// Most recent prior positions for the agent, newest first. An empty
    /// result for the domain falls back to all domains caller-side.
    fn recent_positions(
        &self,
        agent: &str,
        domain: Option<&str>,
        limit: u32,
    ) -> Result<Vec<Position>, String>;
    fn insert_flip(&self, flip: &Flip) -> Result<(), String>;
    fn consistency_counts(&self, agent: &str) -> Result<ConsistencyCounts, String>;
}

/// The ranking and flip engine.
pub struct RankingEngine {
    store: Arc<dyn RankingStore>,
    sink: Arc<dyn EventSink>,
    similarity: SharedSimilarity,
    elo: EloSettings,
    flip_settings: FlipSettings,
}

impl RankingEngine {
    pub fn new(
        store: Arc<dyn RankingStore>,
        sink: Arc<dyn EventSink>,
        similarity: SharedSimilarity,
        elo: EloSettings,
        flip_settings: FlipSettings,
    ) -> Self {
        Self {
            store,
            sink,
            similarity,
            elo,
            flip_settings,
        }
    }

    pub fn flip_settings(&self) -> &FlipSettings {
        &self.flip_settings
    }

    /// Record an ELO match for a finished debate and update ratings
    /// atomically. `winners` is empty for an all-draw.
    pub fn record_debate_match(
        &self,
        debate_id: &str,
        domain: &str,
        participants: &[String],
        winners: &[String],
    ) -> RankingResult<MatchRecord> {
        if participants.len() < 2 {
            return Err(RankingError::TooFewParticipants(participants.len()));
        }

        let mut ratings: BTreeMap<String, AgentRating> = BTreeMap::new();
        for agent in participants {
            let rating = self
                .store
                .get_rating(agent, domain)
                .map_err(RankingError::Store)?
                .unwrap_or_else(|| AgentRating::fresh(agent, domain, self.elo.initial));
            ratings.insert(agent.clone(), rating);
        }

        let current: BTreeMap<String, f64> =
            ratings.iter().map(|(a, r)| (a.clone(), r.elo)).collect();
        let deltas = elo::match_deltas(&current, winners, self.elo.k);

        let has_losers = !winners.is_empty() && winners.len() < participants.len();
        for (agent, rating) in ratings.iter_mut() {
            rating.elo += deltas[agent];
            if has_losers {
                if winners.contains(agent) {
                    rating.wins += 1;
                } else {
                    rating.losses += 1;
                }
            } else {
                rating.draws += 1;
            }
            let counts = self
                .store
                .consistency_counts(agent)
                .map_err(RankingError::Store)?;
            rating.consistency = flips::consistency_score(
                counts.contradictions + counts.retractions,
                counts.qualifications,
                counts.total_positions,
                self.flip_settings.qualification_weight,
            );
            rating.updated_at = Utc::now();
        }

        let record = MatchRecord {
            match_id: uuid::Uuid::new_v4().to_string(),
            debate_id: debate_id.to_string(),
            domain: domain.to_string(),
            participants: participants.to_vec(),
            winner: (winners.len() == 1).then(|| winners[0].clone()),
            elo_changes: deltas.clone(),
            created_at: Utc::now(),
        };

        let updated: Vec<AgentRating> = ratings.into_values().collect();
        self.store
            .record_match(&record, &updated)
            .map_err(RankingError::Store)?;

        self.sink
            .publish(DebateEvent::debate(
                debate_id,
                EventKind::MatchRecorded {
                    winner: record.winner.clone(),
                    elo_changes: deltas,
                    domain: domain.to_string(),
                },
            ))
            .map_err(|e| RankingError::Emit(e.to_string()))?;

        info!(
            debate_id,
            domain,
            participants = participants.len(),
            "match recorded"
        );
        Ok(record)
    }

    /// Persist a new position and detect flips against the agent's
    /// prior positions (same domain first, all domains as fallback).
    pub async fn track_position(&self, mut position: Position) -> RankingResult<Vec<Flip>> {
        if position.embedding.is_empty() {
            position.embedding = self
                .similarity
                .embed(&position.claim)
                .await
                .map_err(|e| RankingError::Similarity(e.to_string()))?;
        }
        let position_id = self
            .store
            .insert_position(&position)
            .map_err(RankingError::Store)?;

        let not_self = |positions: Vec<Position>| -> Vec<Position> {
            positions
                .into_iter()
                .filter(|p| p.id != Some(position_id))
                .collect()
        };
        let mut priors = not_self(
            self.store
                .recent_positions(
                    &position.agent,
                    Some(&position.domain),
                    self.flip_settings.scan_limit,
                )
                .map_err(RankingError::Store)?,
        );
        if priors.is_empty() {
            priors = not_self(
                self.store
                    .recent_positions(&position.agent, None, self.flip_settings.scan_limit)
                    .map_err(RankingError::Store)?,
            );
        }

        let mut detected = Vec::new();
        for prior in priors {
            let Some(prior_id) = prior.id else { continue };
            let similarity = cosine(&prior.embedding, &position.embedding).max(0.0);
            let Some(kind) = flips::classify(&self.flip_settings, &prior, &position, similarity)
            else {
                continue;
            };
            let flip = Flip {
                agent: position.agent.clone(),
                original_position_id: prior_id,
                new_position_id: position_id,
                similarity,
                kind,
                domain: position.domain.clone(),
                created_at: Utc::now(),
            };
            self.store.insert_flip(&flip).map_err(RankingError::Store)?;
            self.sink
                .publish(
                    DebateEvent::debate(
                        &position.debate_id,
                        EventKind::FlipDetected {
                            kind: kind.as_str().to_string(),
                            similarity,
                            domain: position.domain.clone(),
                        },
                    )
                    .with_round(position.round)
                    .with_agent(&position.agent),
                )
                .map_err(|e| RankingError::Emit(e.to_string()))?;
            debug!(agent = %position.agent, kind = %kind, similarity, "flip detected");
            detected.push(flip);
        }
        Ok(detected)
    }

    /// Current consistency report for an agent.
    pub fn consistency(&self, agent: &str) -> RankingResult<ConsistencyReport> {
        let counts = self
            .store
            .consistency_counts(agent)
            .map_err(RankingError::Store)?;
        Ok(ConsistencyReport {
            agent: agent.to_string(),
            consistency: flips::consistency_score(
                counts.contradictions + counts.retractions,
                counts.qualifications,
                counts.total_positions,
                self.flip_settings.qualification_weight,
            ),
            contradictions: counts.contradictions,
            retractions: counts.retractions,
            qualifications: counts.qualifications,
            total_positions: counts.total_positions,
        })
    }

    /// ELO-derived vote weights for the `weighted` policy, normalized
    /// so the strongest voter carries weight 1.0.
    pub fn vote_weights(
        &self,
        agents: &[String],
        domain: &str,
    ) -> RankingResult<HashMap<String, f64>> {
        let mut ratings = BTreeMap::new();
        for agent in agents {
            let elo = self
                .store
                .get_rating(agent, domain)
                .map_err(RankingError::Store)?
                .map(|r| r.elo)
                .unwrap_or(self.elo.initial);
            ratings.insert(agent.clone(), elo);
        }
        Ok(elo::vote_weights(&ratings).into_iter().collect())
    }
}
