//! Debate state machine and core data model.
//!
//! States move `Created → Running → Voting → Sealing → terminal` with an
//! explicit legal-transition table; phases within a running round are
//! `Propose → Critique → Revise`. Identity-bearing fields are frozen
//! once the debate is sealed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::DebateOutcome;

/// Top-level debate lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateState {
    Created,
    Running,
    Voting,
    Sealing,
    /// Terminal: consensus reached.
    Consensus,
    /// Terminal: all rounds used without agreement.
    NoConsensus,
    /// Terminal: canceled cooperatively.
    Canceled,
    /// Terminal: deadline, storage failure, or agent exhaustion.
    Failed,
}

impl DebateState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Consensus | Self::NoConsensus | Self::Canceled | Self::Failed
        )
    }

    /// Legal transitions out of this state.
    pub fn valid_transitions(self) -> &'static [DebateState] {
        match self {
            Self::Created => &[Self::Running, Self::Canceled, Self::Failed],
            Self::Running => &[Self::Voting, Self::Canceled, Self::Failed],
            Self::Voting => &[Self::Sealing, Self::Canceled, Self::Failed],
            Self::Sealing => &[
                Self::Consensus,
                Self::NoConsensus,
                Self::Canceled,
                Self::Failed,
            ],
            _ => &[],
        }
    }

    /// Outcome label for a terminal state.
    pub fn outcome(self) -> Option<DebateOutcome> {
        match self {
            Self::Consensus => Some(DebateOutcome::Consensus),
            Self::NoConsensus => Some(DebateOutcome::NoConsensus),
            Self::Canceled => Some(DebateOutcome::Canceled),
            Self::Failed => Some(DebateOutcome::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for DebateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Voting => "voting",
            Self::Sealing => "sealing",
            Self::Consensus => "consensus",
            Self::NoConsensus => "no_consensus",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Error for illegal state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} → {to}")]
pub struct TransitionError {
    pub from: DebateState,
    pub to: DebateState,
}

/// Phase within one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStep {
    Propose,
    Critique,
    Revise,
}

impl PhaseStep {
    /// Role label agents carry in this phase.
    pub fn role(self) -> &'static str {
        match self {
            Self::Propose => "proposer",
            Self::Critique => "critic",
            Self::Revise => "reviser",
        }
    }

    /// Whether skipping this phase under a round soft-budget breach is
    /// allowed. Propose is mandatory; the rest are optional refinement.
    pub fn is_optional(self) -> bool {
        !matches!(self, Self::Propose)
    }
}

impl std::fmt::Display for PhaseStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.role())
    }
}

/// How the debate decides whether agents agreed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusPolicy {
    Majority,
    Supermajority,
    Unanimous,
    Judge,
    Weighted,
}

impl ConsensusPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "majority" => Some(Self::Majority),
            "supermajority" => Some(Self::Supermajority),
            "unanimous" => Some(Self::Unanimous),
            "judge" => Some(Self::Judge),
            "weighted" => Some(Self::Weighted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConsensusPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Majority => "majority",
            Self::Supermajority => "supermajority",
            Self::Unanimous => "unanimous",
            Self::Judge => "judge",
            Self::Weighted => "weighted",
        };
        write!(f, "{s}")
    }
}

/// Similarity-based early-stop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceSettings {
    pub enabled: bool,
    pub similarity_threshold: f64,
    /// Rounds that must fully run before early stop may fire.
    pub min_rounds: u32,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: 0.85,
            min_rounds: 2,
        }
    }
}

/// Role assignment across a round, optionally rotating per round.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RolePlan {
    /// When true, one agent is the proposer per round (rotating through
    /// the agent list) and the rest critique. When false, every agent
    /// participates in every phase.
    pub rotate: bool,
}

impl RolePlan {
    /// Agents acting in `phase` for `round` (1-indexed), in configured
    /// agent order.
    pub fn agents_for_phase<'a>(
        &self,
        agents: &'a [String],
        phase: PhaseStep,
        round: u32,
    ) -> Vec<&'a String> {
        if !self.rotate || agents.len() < 2 {
            return agents.iter().collect();
        }
        let proposer = ((round.saturating_sub(1)) as usize) % agents.len();
        match phase {
            PhaseStep::Propose | PhaseStep::Revise => vec![&agents[proposer]],
            PhaseStep::Critique => agents
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != proposer)
                .map(|(_, a)| a)
                .collect(),
        }
    }
}

/// Full configuration for one debate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateSettings {
    pub rounds_planned: u32,
    pub phases_per_round: Vec<PhaseStep>,
    pub roles: RolePlan,
    pub consensus_policy: ConsensusPolicy,
    pub consensus_threshold: f64,
    pub convergence: ConvergenceSettings,
    /// Debate continues only while at least this many agents remain.
    pub min_participants: usize,
    /// Total wall-clock budget in seconds.
    pub timeout_seconds: u64,
    /// Soft per-round budget; breaching it skips optional phases.
    pub round_budget_seconds: u64,
    /// Pre-round research micro-phase (external tools).
    pub research_enabled: bool,
    /// Topic domain for positions and ranking.
    pub domain: String,
}

impl Default for DebateSettings {
    fn default() -> Self {
        Self {
            rounds_planned: 3,
            phases_per_round: vec![PhaseStep::Propose, PhaseStep::Critique, PhaseStep::Revise],
            roles: RolePlan::default(),
            consensus_policy: ConsensusPolicy::Majority,
            consensus_threshold: 0.66,
            convergence: ConvergenceSettings::default(),
            min_participants: 2,
            timeout_seconds: 600,
            round_budget_seconds: 180,
            research_enabled: false,
            domain: "general".to_string(),
        }
    }
}

/// Persisted debate row. Identity-bearing fields are frozen on seal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateRecord {
    pub debate_id: String,
    pub slug: String,
    pub task: String,
    pub agents: Vec<String>,
    pub rounds_planned: u32,
    pub rounds_used: u32,
    pub consensus_reached: bool,
    /// Defined iff `consensus_reached`.
    pub confidence: Option<f64>,
    pub final_artifact: Option<serde_json::Value>,
    pub state: DebateState,
    pub created_at: DateTime<Utc>,
    pub sealed_at: Option<DateTime<Utc>>,
}

impl DebateRecord {
    pub fn new(debate_id: &str, slug: &str, task: &str, agents: &[String], rounds: u32) -> Self {
        Self {
            debate_id: debate_id.to_string(),
            slug: slug.to_string(),
            task: task.to_string(),
            agents: agents.to_vec(),
            rounds_planned: rounds,
            rounds_used: 0,
            consensus_reached: false,
            confidence: None,
            final_artifact: None,
            state: DebateState::Created,
            created_at: Utc::now(),
            sealed_at: None,
        }
    }
}

/// One agent message, unique per `(debate_id, round, agent, role)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateMessage {
    pub debate_id: String,
    pub round: u32,
    pub agent: String,
    pub role: String,
    pub content: String,
    pub confidence: Option<f64>,
    pub citations: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Tracks the live state with legal-transition enforcement.
#[derive(Debug, Clone)]
pub struct StateTracker {
    state: DebateState,
    history: Vec<(DebateState, DebateState, DateTime<Utc>)>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            state: DebateState::Created,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> DebateState {
        self.state
    }

    pub fn transition(&mut self, to: DebateState) -> Result<(), TransitionError> {
        if !self.state.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.history.push((self.state, to, Utc::now()));
        self.state = to;
        Ok(())
    }

    pub fn history(&self) -> &[(DebateState, DebateState, DateTime<Utc>)] {
        &self.history
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut tracker = StateTracker::new();
        tracker.transition(DebateState::Running).unwrap();
        tracker.transition(DebateState::Voting).unwrap();
        tracker.transition(DebateState::Sealing).unwrap();
        tracker.transition(DebateState::Consensus).unwrap();
        assert!(tracker.state().is_terminal());
        assert_eq!(tracker.history().len(), 4);
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        for path in [
            vec![],
            vec![DebateState::Running],
            vec![DebateState::Running, DebateState::Voting],
        ] {
            let mut tracker = StateTracker::new();
            for state in path {
                tracker.transition(state).unwrap();
            }
            tracker.transition(DebateState::Canceled).unwrap();
            assert_eq!(tracker.state().outcome(), Some(DebateOutcome::Canceled));
        }
    }

    #[test]
    fn test_illegal_transition_rejected() {
        let mut tracker = StateTracker::new();
        let err = tracker.transition(DebateState::Consensus).unwrap_err();
        assert_eq!(err.from, DebateState::Created);
        assert_eq!(err.to, DebateState::Consensus);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for state in [
            DebateState::Consensus,
            DebateState::NoConsensus,
            DebateState::Canceled,
            DebateState::Failed,
        ] {
            assert!(state.valid_transitions().is_empty());
            assert!(state.outcome().is_some());
        }
    }

    #[test]
    fn test_role_plan_no_rotation_includes_all() {
        let agents: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let plan = RolePlan { rotate: false };
        for phase in [PhaseStep::Propose, PhaseStep::Critique, PhaseStep::Revise] {
            assert_eq!(plan.agents_for_phase(&agents, phase, 1).len(), 3);
        }
    }

    #[test]
    fn test_role_plan_rotation() {
        let agents: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let plan = RolePlan { rotate: true };

        assert_eq!(
            plan.agents_for_phase(&agents, PhaseStep::Propose, 1),
            vec!["a"]
        );
        assert_eq!(
            plan.agents_for_phase(&agents, PhaseStep::Critique, 1),
            vec!["b", "c"]
        );
        // Round 2 rotates the proposer.
        assert_eq!(
            plan.agents_for_phase(&agents, PhaseStep::Propose, 2),
            vec!["b"]
        );
        assert_eq!(
            plan.agents_for_phase(&agents, PhaseStep::Revise, 2),
            vec!["b"]
        );
    }

    #[test]
    fn test_policy_parse_roundtrip() {
        for policy in [
            ConsensusPolicy::Majority,
            ConsensusPolicy::Supermajority,
            ConsensusPolicy::Unanimous,
            ConsensusPolicy::Judge,
            ConsensusPolicy::Weighted,
        ] {
            assert_eq!(ConsensusPolicy::parse(&policy.to_string()), Some(policy));
        }
        assert_eq!(ConsensusPolicy::parse("hybrid"), None);
    }

    #[test]
    fn test_phase_optionality() {
        assert!(!PhaseStep::Propose.is_optional());
        assert!(PhaseStep::Critique.is_optional());
        assert!(PhaseStep::Revise.is_optional());
    }
}
