//! Shared fixtures: an engine over in-memory storage and scripted
//! agents that never touch a real provider.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use aragora::cancel::CancellationToken;
use aragora::config::AragoraConfig;
use aragora::debate::orchestrator::DebateAgent;
use aragora::debate::state::{
    ConsensusPolicy, ConvergenceSettings, DebateSettings, PhaseStep,
};
use aragora::engine::Engine;
use aragora::events::DebateEvent;
use aragora::invoker::{AgentInvoker, InvokerConfig};
use aragora::providers::scripted::{ScriptedProvider, ScriptedTurn};
use aragora::providers::StreamOptions;
use aragora::store::SqliteStore;

pub fn test_engine() -> Arc<Engine> {
    let store = SqliteStore::open_in_memory().unwrap().shared();
    Engine::with_store(AragoraConfig::from_env(), store).unwrap()
}

pub fn scripted_agent(engine: &Arc<Engine>, name: &str, replies: &[&str]) -> DebateAgent {
    scripted_agent_turns(
        engine,
        name,
        replies.iter().map(|r| ScriptedTurn::reply(*r)).collect(),
    )
}

pub fn scripted_agent_turns(
    engine: &Arc<Engine>,
    name: &str,
    turns: Vec<ScriptedTurn>,
) -> DebateAgent {
    let provider = Arc::new(ScriptedProvider::new(name, turns));
    let invoker = Arc::new(AgentInvoker::new(
        provider,
        engine.sink(),
        InvokerConfig {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            ..InvokerConfig::default()
        },
    ));
    DebateAgent {
        name: name.to_string(),
        invoker,
        options: StreamOptions::default(),
    }
}

/// Single-phase settings keep scripts simple: one turn per agent per
/// round.
pub fn propose_only(rounds: u32, policy: ConsensusPolicy) -> DebateSettings {
    DebateSettings {
        rounds_planned: rounds,
        phases_per_round: vec![PhaseStep::Propose],
        consensus_policy: policy,
        convergence: ConvergenceSettings {
            enabled: false,
            ..ConvergenceSettings::default()
        },
        ..DebateSettings::default()
    }
}

pub async fn run_debate(
    engine: &Arc<Engine>,
    task: &str,
    agents: &[DebateAgent],
    settings: &DebateSettings,
) -> aragora::debate::state::DebateRecord {
    let debate_id = uuid::Uuid::new_v4().to_string();
    engine
        .run_debate_with_agents(
            &debate_id,
            task,
            agents,
            settings,
            &CancellationToken::new(),
        )
        .await
        .expect("debate run failed")
}

/// Drain the durable event log for a debate.
pub fn all_events(engine: &Arc<Engine>, debate_id: &str) -> Vec<DebateEvent> {
    let mut events = Vec::new();
    let mut cursor = 0;
    loop {
        let page = engine.store.events_after(debate_id, cursor, 500).unwrap();
        if page.is_empty() {
            break;
        }
        cursor = page.last().unwrap().seq;
        events.extend(page);
    }
    events
}
