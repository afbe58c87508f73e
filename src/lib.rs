//! Aragora: multi-agent debate engine.
//!
//! A coordinator drives heterogeneous LLM agents through rounds of
//! proposal, critique, and revision until consensus or termination,
//! records every step durably, and streams the debate to observers in
//! real time.
//!
//! Core pieces:
//! - [`debate::Orchestrator`]: the round/phase/voting state machine
//! - [`invoker::AgentInvoker`]: one streamed provider call per turn,
//!   with retries, budgets, and cancellation
//! - [`events::EventBus`]: durable append-then-broadcast pub/sub
//! - [`server`]: REST + WebSocket surface with auth and rate limiting
//! - [`ranking::RankingEngine`]: ELO matches, position flips,
//!   consistency
//! - [`store::SqliteStore`]: versioned relational persistence

pub mod cache;
pub mod cancel;
pub mod config;
pub mod debate;
pub mod engine;
pub mod events;
pub mod export;
pub mod invoker;
pub mod providers;
pub mod ranking;
pub mod server;
pub mod store;

pub use cancel::CancellationToken;
pub use config::AragoraConfig;
pub use debate::{
    ConsensusPolicy, DebateAgent, DebateRecord, DebateSettings, DebateState, Orchestrator,
    PhaseStep,
};
pub use engine::{AgentSpec, DebateRequest, Engine, EngineError};
pub use events::{DebateEvent, DebateOutcome, EventBus, EventKind, EventSink};
pub use invoker::{AgentInvoker, InvokerConfig};
pub use providers::{ProviderClient, ProviderError, ScriptedProvider, StreamOptions};
pub use ranking::{AgentRating, Flip, FlipKind, MatchRecord, Position, RankingEngine};
pub use store::{SqliteStore, StoreError};
