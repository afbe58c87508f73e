//! The debate engine: state machine, orchestration, voting, convergence.

pub mod convergence;
pub mod orchestrator;
pub mod state;
pub mod voting;

pub use convergence::{ConvergenceTracker, LexicalBackend, SharedSimilarity, SimilarityBackend};
pub use orchestrator::{
    DebateAgent, Orchestrator, OrchestratorError, OrchestratorResult, ResearchHook,
};
pub use state::{
    ConsensusPolicy, ConvergenceSettings, DebateMessage, DebateRecord, DebateSettings,
    DebateState, PhaseStep, RolePlan, StateTracker,
};
pub use voting::{Ballot, VoteTally};
