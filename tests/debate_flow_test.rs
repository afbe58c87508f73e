//! End-to-end debate scenarios with deterministic scripted agents:
//! orchestrator, invoker, bus, storage, voting, and ranking running
//! together against in-memory SQLite.

mod common;

use std::time::Duration;

use aragora::cancel::CancellationToken;
use aragora::debate::state::{ConsensusPolicy, ConvergenceSettings, DebateState};
use aragora::events::{DebateOutcome, EventKind};
use aragora::providers::scripted::ScriptedTurn;
use aragora::providers::ProviderError;

use common::{all_events, propose_only, run_debate, scripted_agent, scripted_agent_turns, test_engine};

// ── S1: unanimous agreement ────────────────────────────────────────

#[tokio::test]
async fn test_unanimous_agreement_records_draw_match() {
    let engine = test_engine();
    let agents = vec![
        scripted_agent(&engine, "a", &["Choose X. Confidence: 1.0"]),
        scripted_agent(&engine, "b", &["Choose X. Confidence: 1.0"]),
    ];
    let settings = propose_only(2, ConsensusPolicy::Unanimous);

    let record = run_debate(&engine, "Pick X or Y", &agents, &settings).await;

    assert!(record.consensus_reached);
    assert_eq!(record.state, DebateState::Consensus);
    assert_eq!(record.confidence, Some(1.0));
    let artifact = record.final_artifact.as_ref().unwrap();
    assert!(artifact["choice"].as_str().unwrap().contains("Choose X"));

    // Agreement is a draw: one match, zero-sum, no single winner.
    let matches = engine.store.recent_matches(10).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].winner, None);
    let total: f64 = matches[0].elo_changes.values().sum();
    assert!(total.abs() < 1e-6);

    let board = engine.store.leaderboard(None, 10).unwrap();
    assert_eq!(board.len(), 2);
    assert!(board.iter().all(|r| r.draws == 1));
}

// ── S2: majority, count beats confidence ───────────────────────────

#[tokio::test]
async fn test_majority_count_wins_confidence_is_winner_mean() {
    let engine = test_engine();
    let agents = vec![
        scripted_agent(&engine, "a", &["Choose option X. Confidence: 0.6"]),
        scripted_agent(&engine, "b", &["Choose option X. Confidence: 0.7"]),
        scripted_agent(&engine, "c", &["Pick totally different option Y instead. Confidence: 0.95"]),
    ];
    let settings = propose_only(1, ConsensusPolicy::Majority);

    let record = run_debate(&engine, "Pick X or Y", &agents, &settings).await;

    assert!(record.consensus_reached);
    let artifact = record.final_artifact.as_ref().unwrap();
    assert!(artifact["choice"].as_str().unwrap().contains("X"));
    let confidence = record.confidence.unwrap();
    assert!((confidence - 0.65).abs() < 1e-9, "confidence was {confidence}");

    // X's backers win, Y's backer loses.
    let board = engine.store.leaderboard(None, 10).unwrap();
    let by_name = |n: &str| board.iter().find(|r| r.agent == n).unwrap();
    assert_eq!(by_name("a").wins, 1);
    assert_eq!(by_name("b").wins, 1);
    assert_eq!(by_name("c").losses, 1);
    assert!(by_name("c").elo < by_name("a").elo);
}

// ── S3: no consensus under unanimity ───────────────────────────────

#[tokio::test]
async fn test_disagreement_yields_no_consensus_and_no_match() {
    let engine = test_engine();
    let agents = vec![
        scripted_agent(&engine, "a", &["Strongly recommend the X approach. Confidence: 0.9"]),
        scripted_agent(&engine, "b", &["We must go with Y instead, rejecting X. Confidence: 0.9"]),
    ];
    let settings = propose_only(3, ConsensusPolicy::Unanimous);

    let record = run_debate(&engine, "Pick X or Y", &agents, &settings).await;

    assert!(!record.consensus_reached);
    assert_eq!(record.state, DebateState::NoConsensus);
    assert_eq!(record.confidence, None);
    assert_eq!(record.rounds_used, 3);
    assert!(engine.store.recent_matches(10).unwrap().is_empty());

    let events = all_events(&engine, &record.debate_id);
    let end = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::DebateEnd { outcome, .. } => Some(*outcome),
            _ => None,
        })
        .unwrap();
    assert_eq!(end, DebateOutcome::NoConsensus);
}

// ── S7: convergence early stop ─────────────────────────────────────

#[tokio::test]
async fn test_convergence_stops_five_round_debate_at_three() {
    let engine = test_engine();
    let agents = vec![
        scripted_agent(&engine, "a", &["The cache should be exactly 1 MB. Confidence: 0.8"]),
        scripted_agent(&engine, "b", &["The cache should be exactly 1 MB. Confidence: 0.8"]),
    ];
    let mut settings = propose_only(5, ConsensusPolicy::Majority);
    settings.convergence = ConvergenceSettings {
        enabled: true,
        similarity_threshold: 0.99,
        min_rounds: 2,
    };

    let record = run_debate(&engine, "Cache sizing", &agents, &settings).await;

    assert_eq!(record.rounds_used, 3, "expected early stop at round 3");
    assert!(record.consensus_reached);

    let events = all_events(&engine, &record.debate_id);
    let round_ends: Vec<_> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::RoundEnd { round, similarity } => Some((*round, *similarity)),
            _ => None,
        })
        .collect();
    assert_eq!(round_ends.len(), 3);
    assert!(round_ends.iter().all(|(_, s)| s.unwrap() > 0.99));
}

// ── S6: cancellation mid-stream ────────────────────────────────────

#[tokio::test]
async fn test_cancellation_closes_streams_and_seals_debate() {
    let engine = test_engine();
    let agents = vec![
        scripted_agent_turns(
            &engine,
            "a",
            vec![
                ScriptedTurn::reply("Round one answer. Confidence: 0.5"),
                ScriptedTurn::reply("Round two answer. Confidence: 0.5"),
                ScriptedTurn::Stall("thinking hard about".to_string()),
            ],
        ),
        scripted_agent_turns(
            &engine,
            "b",
            vec![
                ScriptedTurn::reply("Round one reply. Confidence: 0.5"),
                ScriptedTurn::reply("Round two reply. Confidence: 0.5"),
                ScriptedTurn::Stall("also pondering".to_string()),
            ],
        ),
    ];
    let settings = propose_only(10, ConsensusPolicy::Majority);
    let cancel = CancellationToken::new();

    let debate_id = uuid::Uuid::new_v4().to_string();
    let runner = {
        let engine = engine.clone();
        let agents = agents.clone();
        let settings = settings.clone();
        let cancel = cancel.clone();
        let debate_id = debate_id.clone();
        tokio::spawn(async move {
            engine
                .run_debate_with_agents(&debate_id, "Long debate", &agents, &settings, &cancel)
                .await
        })
    };

    // Let rounds 1-2 finish and round 3 stall mid-stream, then cancel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    let record = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("cancellation must terminate the debate promptly")
        .unwrap()
        .unwrap();

    assert_eq!(record.state, DebateState::Canceled);
    assert!(!record.consensus_reached);
    assert!(engine.store.recent_matches(10).unwrap().is_empty());

    // Durable state is readable by slug after cancellation.
    let reread = engine
        .store
        .get_debate_by_slug(&record.slug)
        .unwrap()
        .unwrap();
    assert_eq!(reread.state, DebateState::Canceled);
    assert!(reread.rounds_used >= 2);

    let events = all_events(&engine, &record.debate_id);
    let partial_ends = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::TokenEnd { partial: true, .. }))
        .count();
    assert!(partial_ends >= 1, "in-flight streams must close with partial token_end");
    let debate_ends = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::DebateEnd { .. }))
        .count();
    assert_eq!(debate_ends, 1);
    let end_outcome = events
        .iter()
        .find_map(|e| match &e.kind {
            EventKind::DebateEnd { outcome, .. } => Some(*outcome),
            _ => None,
        })
        .unwrap();
    assert_eq!(end_outcome, DebateOutcome::Canceled);
}

// ── Agent failure becomes abstention ───────────────────────────────

#[tokio::test]
async fn test_permanently_failing_agent_abstains_and_debate_continues() {
    let engine = test_engine();
    let agents = vec![
        scripted_agent(&engine, "a", &["Answer is X. Confidence: 0.9"]),
        scripted_agent(&engine, "b", &["Answer is X. Confidence: 0.8"]),
        scripted_agent_turns(
            &engine,
            "c",
            vec![ScriptedTurn::Fail(ProviderError::Permanent(
                "safety rejection".to_string(),
            ))],
        ),
    ];
    let settings = propose_only(1, ConsensusPolicy::Majority);

    let record = run_debate(&engine, "Pick X", &agents, &settings).await;

    assert!(record.consensus_reached);
    // Only the two live agents produced messages.
    let messages = engine.store.messages_for(&record.debate_id).unwrap();
    let authors: Vec<_> = messages.iter().map(|m| m.agent.as_str()).collect();
    assert!(authors.contains(&"a"));
    assert!(authors.contains(&"b"));
    assert!(!authors.contains(&"c"));
}

// ── S4 / S5: flip classification across debates ────────────────────

#[tokio::test]
async fn test_refinement_and_contradiction_flips_via_engine() {
    let engine = test_engine();

    // S4: same claim with an added assumption and higher confidence.
    let agents = vec![
        scripted_agent(&engine, "alice", &["Cache size 1 MB is best. Confidence: 0.8"]),
        scripted_agent(&engine, "observer", &["Whatever works. Confidence: 0.3"]),
    ];
    let settings = propose_only(1, ConsensusPolicy::Majority);
    run_debate(&engine, "Cache sizing round one", &agents, &settings).await;

    let agents = vec![
        scripted_agent(
            &engine,
            "alice",
            &["Cache size 1 MB is best, assuming workload W. Confidence: 0.82"],
        ),
        scripted_agent(&engine, "observer", &["Still whatever works. Confidence: 0.3"]),
    ];
    run_debate(&engine, "Cache sizing round two", &agents, &settings).await;

    let flips = engine.store.recent_flips(50).unwrap();
    let alice_flips: Vec<_> = flips.iter().filter(|f| f.agent == "alice").collect();
    assert!(alice_flips
        .iter()
        .any(|f| f.kind == aragora::ranking::FlipKind::Refinement));

    // S5: outright reversal with negation.
    let agents = vec![
        scripted_agent(&engine, "bob", &["Use microservices. Confidence: 0.9"]),
        scripted_agent(&engine, "observer", &["No strong view here. Confidence: 0.2"]),
    ];
    run_debate(&engine, "Architecture round one", &agents, &settings).await;
    let before = engine.ranking.consistency("bob").unwrap().consistency;

    let agents = vec![
        scripted_agent(&engine, "bob", &["Do not use microservices. Confidence: 0.9"]),
        scripted_agent(&engine, "observer", &["Still no view. Confidence: 0.2"]),
    ];
    run_debate(&engine, "Architecture round two", &agents, &settings).await;

    let flips = engine.store.recent_flips(50).unwrap();
    assert!(flips
        .iter()
        .any(|f| f.agent == "bob" && f.kind == aragora::ranking::FlipKind::Contradiction));

    let after = engine.ranking.consistency("bob").unwrap();
    assert!(after.consistency < before);
    assert!(after.consistency >= 0.0 && after.consistency <= 1.0);

    // Flip edges always point from older to newer positions.
    for flip in &flips {
        assert!(flip.original_position_id < flip.new_position_id);
    }
}

// ── Weighted policy uses ELO-derived weights ───────────────────────

#[tokio::test]
async fn test_weighted_policy_runs_to_outcome() {
    let engine = test_engine();
    let agents = vec![
        scripted_agent(&engine, "a", &["Alternative A is right. Confidence: 0.8"]),
        scripted_agent(&engine, "b", &["Alternative A is right. Confidence: 0.7"]),
        scripted_agent(&engine, "c", &["Counterproposal B only. Confidence: 0.9"]),
    ];
    let mut settings = propose_only(1, ConsensusPolicy::Weighted);
    settings.consensus_threshold = 0.5;

    let record = run_debate(&engine, "Weighted choice", &agents, &settings).await;
    assert!(record.consensus_reached);
    let artifact = record.final_artifact.as_ref().unwrap();
    assert!(artifact["choice"].as_str().unwrap().contains("Alternative A"));
}

// ── Judge policy ───────────────────────────────────────────────────

#[tokio::test]
async fn test_judge_policy_first_agent_decides() {
    let engine = test_engine();
    let agents = vec![
        // Judge proposes in round 1, then casts the judge vote when
        // the voting phase asks.
        scripted_agent_turns(
            &engine,
            "judge",
            vec![
                ScriptedTurn::reply("My own take. Confidence: 0.5"),
                ScriptedTurn::reply("VOTE: challenger\nConfidence: 0.85"),
            ],
        ),
        scripted_agent(&engine, "challenger", &["The challenger plan. Confidence: 0.6"]),
    ];
    let settings = propose_only(1, ConsensusPolicy::Judge);

    let record = run_debate(&engine, "Judge call", &agents, &settings).await;
    assert!(record.consensus_reached);
    assert_eq!(record.confidence, Some(0.85));
    let artifact = record.final_artifact.as_ref().unwrap();
    assert!(artifact["choice"].as_str().unwrap().contains("challenger plan"));
}
