//! Debate orchestrator: runs one debate from task to sealed artifact.
//!
//! Drives the state machine through rounds and phases, gathers parallel
//! agent turns in deterministic order, detects convergence, runs the
//! vote, records the match, and seals the debate. Every exit path
//! (consensus, no-consensus, cancellation, failure) leaves a durable,
//! readable record and exactly one `debate_end` event.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{info, warn};

use super::convergence::{round_similarity, ConvergenceTracker, SharedSimilarity};
use super::state::{
    ConsensusPolicy, DebateMessage, DebateRecord, DebateSettings, DebateState, PhaseStep,
    StateTracker,
};
use super::voting::{group_ballots, tally, Ballot, VoteTally, VOTE_GROUPING_THRESHOLD};
use crate::cancel::CancellationToken;
use crate::events::{DebateEvent, DebateOutcome, EventKind, EventSink};
use crate::invoker::{strip_confidence, AgentInvoker, InvokeError, TurnRequest};
use crate::providers::{ChatMessage, ProviderError, StreamOptions};
use crate::ranking::{Position, PositionOutcome, RankingEngine};
use crate::store::{DebateSeal, SharedStore, StoreError};

/// Consecutive failed rounds after which an agent is dropped.
const MAX_CONSECUTIVE_AGENT_FAILURES: u32 = 2;

/// Claim text is bounded when extracting positions.
const MAX_CLAIM_LEN: usize = 240;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("storage failure: {0}")]
    Store(#[from] StoreError),
    #[error("event emission failed: {0}")]
    Emit(String),
    #[error("debate needs at least {need} agents, got {got}")]
    TooFewAgents { need: usize, got: usize },
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Pre-round research micro-phase, implemented by external tooling.
#[async_trait]
pub trait ResearchHook: Send + Sync {
    /// Returns extra context to inject into the round, if any.
    async fn research(
        &self,
        task: &str,
        round: u32,
        cancel: &CancellationToken,
    ) -> Option<String>;
}

/// One participating agent: a name plus the invoker that reaches its
/// provider and the model options for its turns.
#[derive(Debug, Clone)]
pub struct DebateAgent {
    pub name: String,
    pub invoker: Arc<AgentInvoker>,
    pub options: StreamOptions,
}

/// The winning proposal an agent last put forward.
#[derive(Debug, Clone)]
struct LastProposal {
    content: String,
    confidence: Option<f64>,
    round: u32,
}

/// The debate orchestrator. One instance per engine; `run` executes a
/// single debate to completion.
pub struct Orchestrator {
    store: SharedStore,
    sink: Arc<dyn EventSink>,
    ranking: Arc<RankingEngine>,
    similarity: SharedSimilarity,
    research: Option<Arc<dyn ResearchHook>>,
}

impl Orchestrator {
    pub fn new(
        store: SharedStore,
        sink: Arc<dyn EventSink>,
        ranking: Arc<RankingEngine>,
        similarity: SharedSimilarity,
    ) -> Self {
        Self {
            store,
            sink,
            ranking,
            similarity,
            research: None,
        }
    }

    pub fn with_research(mut self, hook: Arc<dyn ResearchHook>) -> Self {
        self.research = Some(hook);
        self
    }

    /// Run one debate to a terminal state. Returns the sealed record;
    /// cancellation and agent exhaustion are outcomes, not errors.
    /// `debate_id` is caller-allocated so callers can hand out the id
    /// before the debate finishes.
    pub async fn run(
        &self,
        debate_id: &str,
        task: &str,
        agents: &[DebateAgent],
        settings: &DebateSettings,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<DebateRecord> {
        if agents.len() < 2 {
            return Err(OrchestratorError::TooFewAgents {
                need: 2,
                got: agents.len(),
            });
        }
        if settings.rounds_planned == 0 {
            return Err(OrchestratorError::InvalidSettings(
                "rounds_planned must be at least 1".to_string(),
            ));
        }

        let debate_id = debate_id.to_string();
        let agent_names: Vec<String> = agents.iter().map(|a| a.name.clone()).collect();
        let slug = self.create_with_unique_slug(&debate_id, task, &agent_names, settings)?;

        info!(debate_id, slug, agents = agents.len(), "debate created");
        self.emit(DebateEvent::debate(
            &debate_id,
            EventKind::DebateStart {
                task: task.to_string(),
                agents: agent_names.clone(),
                rounds_planned: settings.rounds_planned,
            },
        ))?;

        let mut tracker = StateTracker::new();
        tracker
            .transition(DebateState::Running)
            .expect("created to running");
        self.store
            .update_progress(&debate_id, 0, DebateState::Running)?;

        let deadline = Instant::now() + Duration::from_secs(settings.timeout_seconds);
        let mut convergence = ConvergenceTracker::new(settings.convergence.clone());
        let mut proposals: HashMap<String, LastProposal> = HashMap::new();
        let mut consecutive_failures: HashMap<String, u32> = HashMap::new();
        let mut dropped: HashSet<String> = HashSet::new();
        let mut rounds_used = 0;

        for round in 1..=settings.rounds_planned {
            if cancel.is_canceled() {
                return self.finish(&debate_id, &mut tracker, rounds_used, None, None);
            }
            if Instant::now() >= deadline {
                return self.finish_error(&debate_id, &mut tracker, rounds_used, "deadline");
            }

            rounds_used = round;
            self.emit(
                DebateEvent::debate(&debate_id, EventKind::RoundStart { round })
                    .with_round(round),
            )?;

            let research_context = match (&self.research, settings.research_enabled) {
                (Some(hook), true) => hook.research(task, round, cancel).await,
                _ => None,
            };

            let round_started = Instant::now();
            let round_budget = Duration::from_secs(settings.round_budget_seconds);
            let mut produced_this_round: HashSet<String> = HashSet::new();
            let mut failed_this_round: HashSet<String> = HashSet::new();

            for phase in &settings.phases_per_round {
                if cancel.is_canceled() {
                    return self.finish(&debate_id, &mut tracker, rounds_used, None, None);
                }
                // Breaching the soft budget skips optional phases rather
                // than aborting the round.
                if phase.is_optional() && round_started.elapsed() > round_budget {
                    warn!(debate_id, round, phase = %phase, "round budget breached, phase skipped");
                    continue;
                }

                let phase_agents: Vec<&DebateAgent> = settings
                    .roles
                    .agents_for_phase(&agent_names, *phase, round)
                    .into_iter()
                    .filter(|name| !dropped.contains(*name))
                    .filter_map(|name| agents.iter().find(|a| &a.name == name))
                    .collect();

                let turns = join_all(phase_agents.iter().map(|agent| {
                    let request = TurnRequest {
                        debate_id: debate_id.clone(),
                        agent: agent.name.clone(),
                        round,
                        role: phase.role().to_string(),
                        messages: build_prompt(
                            task,
                            &agent.name,
                            *phase,
                            round,
                            &proposals,
                            research_context.as_deref(),
                        ),
                        options: agent.options.clone(),
                        deadline,
                    };
                    let invoker = agent.invoker.clone();
                    async move { invoker.invoke(&request, cancel).await }
                }))
                .await;

                // Results arrive in configured agent order regardless of
                // completion order, so the event stream is reproducible.
                for (agent, result) in phase_agents.iter().zip(turns) {
                    match result {
                        Ok(turn) => {
                            let message = DebateMessage {
                                debate_id: debate_id.clone(),
                                round,
                                agent: agent.name.clone(),
                                role: phase.role().to_string(),
                                content: turn.content.clone(),
                                confidence: turn.confidence,
                                citations: turn.citations.clone(),
                                created_at: Utc::now(),
                            };
                            self.store.append_message(&message)?;
                            self.emit(
                                DebateEvent::debate(
                                    &debate_id,
                                    EventKind::AgentMessage {
                                        role: phase.role().to_string(),
                                        content: turn.content.clone(),
                                        confidence: turn.confidence,
                                    },
                                )
                                .with_round(round)
                                .with_agent(&agent.name),
                            )?;
                            if *phase == PhaseStep::Critique {
                                self.emit(
                                    DebateEvent::debate(
                                        &debate_id,
                                        EventKind::Critique {
                                            target: "all".to_string(),
                                            content: summarize(&turn.content),
                                        },
                                    )
                                    .with_round(round)
                                    .with_agent(&agent.name),
                                )?;
                            }
                            if matches!(phase, PhaseStep::Propose | PhaseStep::Revise) {
                                proposals.insert(
                                    agent.name.clone(),
                                    LastProposal {
                                        content: turn.content.clone(),
                                        confidence: turn.confidence,
                                        round,
                                    },
                                );
                            }
                            produced_this_round.insert(agent.name.clone());
                            consecutive_failures.remove(&agent.name);
                        }
                        Err(InvokeError::Provider(ProviderError::Canceled)) => {
                            if cancel.is_canceled() {
                                return self.finish(
                                    &debate_id,
                                    &mut tracker,
                                    rounds_used,
                                    None,
                                    None,
                                );
                            }
                            failed_this_round.insert(agent.name.clone());
                        }
                        Err(InvokeError::Emit(e)) => {
                            // Storage is down; fatal to the debate.
                            warn!(debate_id, error = %e, "event emission failed");
                            return self.finish_error(
                                &debate_id,
                                &mut tracker,
                                rounds_used,
                                "storage",
                            );
                        }
                        Err(InvokeError::DeadlineExceeded) => {
                            return self.finish_error(
                                &debate_id,
                                &mut tracker,
                                rounds_used,
                                "deadline",
                            );
                        }
                        Err(InvokeError::Provider(e)) => {
                            // Abstention for this phase.
                            warn!(
                                debate_id,
                                agent = %agent.name,
                                round,
                                error = %e,
                                "agent abstained after retries"
                            );
                            failed_this_round.insert(agent.name.clone());
                        }
                    }
                }
            }

            for name in &failed_this_round {
                if produced_this_round.contains(name) {
                    continue;
                }
                let failures = consecutive_failures.entry(name.clone()).or_insert(0);
                *failures += 1;
                if *failures >= MAX_CONSECUTIVE_AGENT_FAILURES {
                    warn!(debate_id, agent = %name, "agent dropped from debate");
                    dropped.insert(name.clone());
                }
            }

            let active = agent_names.len() - dropped.len();
            if produced_this_round.is_empty() || active < settings.min_participants {
                return self.finish_error(
                    &debate_id,
                    &mut tracker,
                    rounds_used,
                    "insufficient_participants",
                );
            }

            // Positions from each agent's final message this round feed
            // flip detection; matches wait for the vote.
            for agent in &agent_names {
                let Some(proposal) = proposals.get(agent) else {
                    continue;
                };
                if proposal.round != round {
                    continue;
                }
                let position = Position {
                    id: None,
                    agent: agent.clone(),
                    claim: extract_claim(&proposal.content),
                    confidence: proposal.confidence.unwrap_or(0.5),
                    domain: settings.domain.clone(),
                    debate_id: debate_id.clone(),
                    round,
                    outcome: PositionOutcome::Pending,
                    embedding: Vec::new(),
                    created_at: Utc::now(),
                };
                if let Err(e) = self.ranking.track_position(position).await {
                    warn!(debate_id, agent = %agent, error = %e, "position tracking failed");
                }
            }

            let finals: Vec<&str> = agent_names
                .iter()
                .filter_map(|a| proposals.get(a))
                .filter(|p| p.round == round)
                .map(|p| p.content.as_str())
                .collect();
            let similarity = round_similarity(self.similarity.as_ref(), &finals)
                .await
                .unwrap_or(None);

            self.emit(
                DebateEvent::debate(&debate_id, EventKind::RoundEnd { round, similarity })
                    .with_round(round),
            )?;
            self.store
                .update_progress(&debate_id, round, DebateState::Running)?;

            convergence.observe(similarity);
            if convergence.should_stop(round) {
                info!(debate_id, round, "convergence early stop");
                break;
            }
        }

        if cancel.is_canceled() {
            return self.finish(&debate_id, &mut tracker, rounds_used, None, None);
        }

        // Voting.
        tracker
            .transition(DebateState::Voting)
            .expect("running to voting");
        let tally = self
            .collect_votes(&debate_id, task, agents, settings, &proposals, &dropped, cancel)
            .await?;

        self.emit(DebateEvent::debate(
            &debate_id,
            EventKind::Consensus {
                reached: tally.reached,
                choice: tally.choice.clone(),
                confidence: tally.confidence,
                policy: settings.consensus_policy.to_string(),
            },
        ))?;

        // Match recording: consensus always ranks; without consensus only
        // policies that produce a strict plurality do.
        let rankable = tally.reached
            || (matches!(
                settings.consensus_policy,
                ConsensusPolicy::Majority | ConsensusPolicy::Supermajority | ConsensusPolicy::Weighted
            ) && tally.has_strict_plurality());
        if rankable && !tally.winners().is_empty() {
            let participants: Vec<String> = agent_names
                .iter()
                .filter(|a| !dropped.contains(*a))
                .cloned()
                .collect();
            if participants.len() >= 2 {
                if let Err(e) = self.ranking.record_debate_match(
                    &debate_id,
                    &settings.domain,
                    &participants,
                    &tally.winners(),
                ) {
                    warn!(debate_id, error = %e, "match recording failed");
                }
            }
        }

        self.finish(&debate_id, &mut tracker, rounds_used, Some(tally), None)
    }

    async fn collect_votes(
        &self,
        debate_id: &str,
        task: &str,
        agents: &[DebateAgent],
        settings: &DebateSettings,
        proposals: &HashMap<String, LastProposal>,
        dropped: &HashSet<String>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<VoteTally> {
        let mut ballots: Vec<Ballot> = Vec::new();

        if settings.consensus_policy == ConsensusPolicy::Judge {
            // The first configured agent is the designated judge.
            let judge = &agents[0];
            let candidates: Vec<(String, String)> = agents
                .iter()
                .filter(|a| !dropped.contains(&a.name))
                .filter_map(|a| {
                    proposals
                        .get(&a.name)
                        .map(|p| (a.name.clone(), p.content.clone()))
                })
                .collect();
            let request = TurnRequest {
                debate_id: debate_id.to_string(),
                agent: judge.name.clone(),
                round: 0,
                role: "judge".to_string(),
                messages: build_judge_prompt(task, &candidates),
                options: judge.options.clone(),
                deadline: Instant::now() + Duration::from_secs(60),
            };
            if let Ok(turn) = judge.invoker.invoke(&request, cancel).await {
                let chosen = parse_judge_vote(&turn.content, &candidates)
                    .unwrap_or_else(|| judge.name.clone());
                let choice = proposals
                    .get(&chosen)
                    .map(|p| strip_confidence(&p.content))
                    .unwrap_or_else(|| chosen.clone());
                ballots.push(Ballot {
                    agent: judge.name.clone(),
                    choice,
                    confidence: turn.confidence,
                    proposal_round: proposals.get(&chosen).map(|p| p.round).unwrap_or(1),
                });
            }
            for ballot in &ballots {
                self.emit(
                    DebateEvent::debate(
                        debate_id,
                        EventKind::Vote {
                            choice: summarize(&ballot.choice),
                            confidence: ballot.confidence,
                        },
                    )
                    .with_agent(&ballot.agent),
                )?;
            }
            return Ok(tally(
                settings.consensus_policy,
                settings.consensus_threshold,
                &ballots,
                &HashMap::new(),
                Some(&agents[0].name),
            ));
        }

        // Default voting: each agent stands behind its final proposal;
        // grouping merges semantically equivalent wording first.
        for agent in agents.iter().filter(|a| !dropped.contains(&a.name)) {
            if let Some(proposal) = proposals.get(&agent.name) {
                ballots.push(Ballot {
                    agent: agent.name.clone(),
                    choice: strip_confidence(&proposal.content),
                    confidence: proposal.confidence,
                    proposal_round: proposal.round,
                });
            }
        }
        let ballots = group_ballots(self.similarity.as_ref(), ballots, VOTE_GROUPING_THRESHOLD)
            .await
            .unwrap_or_default();
        for ballot in &ballots {
            self.emit(
                DebateEvent::debate(
                    debate_id,
                    EventKind::Vote {
                        choice: summarize(&ballot.choice),
                        confidence: ballot.confidence,
                    },
                )
                .with_agent(&ballot.agent),
            )?;
        }

        let weights = if settings.consensus_policy == ConsensusPolicy::Weighted {
            let names: Vec<String> = ballots.iter().map(|b| b.agent.clone()).collect();
            self.ranking
                .vote_weights(&names, &settings.domain)
                .unwrap_or_default()
        } else {
            HashMap::new()
        };

        Ok(tally(
            settings.consensus_policy,
            settings.consensus_threshold,
            &ballots,
            &weights,
            None,
        ))
    }

    /// Seal the debate and emit the single terminal event.
    fn finish(
        &self,
        debate_id: &str,
        tracker: &mut StateTracker,
        rounds_used: u32,
        tally: Option<VoteTally>,
        error_code: Option<&str>,
    ) -> OrchestratorResult<DebateRecord> {
        let state = match (&tally, error_code) {
            (_, Some(_)) => DebateState::Failed,
            (Some(t), None) if t.reached => DebateState::Consensus,
            (Some(_), None) => DebateState::NoConsensus,
            (None, None) => DebateState::Canceled,
        };
        for step in [DebateState::Voting, DebateState::Sealing] {
            // Walk forward through whatever remains of the happy path;
            // terminal jumps from Running/Voting are legal for
            // cancel/error.
            let _ = tracker.transition(step);
        }
        tracker
            .transition(state)
            .map_err(|e| OrchestratorError::Emit(e.to_string()))?;

        let (reached, confidence, artifact) = match &tally {
            Some(t) => (
                t.reached,
                t.reached.then_some(t.confidence),
                Some(serde_json::json!({
                    "choice": t.choice,
                    "policy": t.policy.to_string(),
                    "confidence": t.confidence,
                    "distribution": t.distribution,
                })),
            ),
            None => (false, None, None),
        };

        if let Some(code) = error_code {
            self.emit(DebateEvent::debate(
                debate_id,
                EventKind::Error {
                    code: code.to_string(),
                    message: format!("debate failed: {code}"),
                },
            ))?;
        }

        self.store.seal_debate(
            debate_id,
            &DebateSeal {
                rounds_used,
                consensus_reached: reached,
                confidence,
                final_artifact: artifact,
                state,
            },
        )?;

        let outcome = state.outcome().unwrap_or(DebateOutcome::Error);
        self.emit(DebateEvent::debate(
            debate_id,
            EventKind::DebateEnd {
                outcome,
                rounds_used,
            },
        ))?;
        info!(debate_id, %outcome, rounds_used, "debate sealed");

        let record = self
            .store
            .get_debate_by_slug(debate_id)?
            .ok_or_else(|| OrchestratorError::Emit("sealed debate vanished".to_string()))?;
        Ok(record)
    }

    fn finish_error(
        &self,
        debate_id: &str,
        tracker: &mut StateTracker,
        rounds_used: u32,
        code: &str,
    ) -> OrchestratorResult<DebateRecord> {
        self.finish(debate_id, tracker, rounds_used, None, Some(code))
    }

    fn create_with_unique_slug(
        &self,
        debate_id: &str,
        task: &str,
        agents: &[String],
        settings: &DebateSettings,
    ) -> OrchestratorResult<String> {
        for _ in 0..3 {
            let slug = make_slug(task);
            let record =
                DebateRecord::new(debate_id, &slug, task, agents, settings.rounds_planned);
            match self.store.create_debate(&record) {
                Ok(()) => return Ok(slug),
                Err(StoreError::DuplicateSlug(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(OrchestratorError::InvalidSettings(
            "could not allocate a unique slug".to_string(),
        ))
    }

    fn emit(&self, event: DebateEvent) -> OrchestratorResult<DebateEvent> {
        self.sink
            .publish(event)
            .map_err(|e| OrchestratorError::Emit(e.to_string()))
    }
}

/// Human-readable unique slug from the task text.
pub fn make_slug(task: &str) -> String {
    let base: String = task
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .take(6)
        .collect::<Vec<_>>()
        .join("-");
    let suffix = &uuid::Uuid::new_v4().to_string()[..8];
    if base.is_empty() {
        format!("debate-{suffix}")
    } else {
        format!("{base}-{suffix}")
    }
}

/// First sentence of a proposal, bounded, as the position claim.
pub fn extract_claim(content: &str) -> String {
    let first = content
        .split(['\n', '.', '!', '?'])
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(content);
    let mut claim: String = first.chars().take(MAX_CLAIM_LEN).collect();
    if claim.is_empty() {
        claim = content.chars().take(MAX_CLAIM_LEN).collect();
    }
    claim
}

fn summarize(content: &str) -> String {
    content.chars().take(200).collect()
}

fn build_prompt(
    task: &str,
    agent: &str,
    phase: PhaseStep,
    round: u32,
    proposals: &HashMap<String, LastProposal>,
    research: Option<&str>,
) -> Vec<ChatMessage> {
    let role_line = match phase {
        PhaseStep::Propose => "Propose your best answer to the task.",
        PhaseStep::Critique => "Critique the other proposals: name concrete weaknesses.",
        PhaseStep::Revise => "Revise your proposal in light of the critiques.",
    };
    let mut context = String::new();
    for (name, proposal) in proposals {
        if name != agent {
            context.push_str(&format!("{name} proposed: {}\n", summarize(&proposal.content)));
        }
    }
    let mut user = format!("Task: {task}\nRound {round}. {role_line}\n");
    if !context.is_empty() {
        user.push_str(&format!("\nOther proposals so far:\n{context}"));
    }
    if let Some(research) = research {
        user.push_str(&format!("\nResearch notes:\n{research}\n"));
    }
    user.push_str("\nEnd your reply with `Confidence: <0..1>`.");
    vec![
        ChatMessage::system(format!(
            "You are {agent}, one voice in a structured multi-agent debate. Be concrete and brief."
        )),
        ChatMessage::user(user),
    ]
}

fn build_judge_prompt(task: &str, candidates: &[(String, String)]) -> Vec<ChatMessage> {
    let mut listing = String::new();
    for (name, content) in candidates {
        listing.push_str(&format!("- {name}: {}\n", summarize(content)));
    }
    vec![
        ChatMessage::system(
            "You are the designated judge of a multi-agent debate. Pick exactly one proposal.",
        ),
        ChatMessage::user(format!(
            "Task: {task}\n\nCandidate proposals:\n{listing}\nReply with `VOTE: <agent name>` \
             and `Confidence: <0..1>`."
        )),
    ]
}

/// Parse the judge's `VOTE: <agent>` line against the candidate list.
pub fn parse_judge_vote(content: &str, candidates: &[(String, String)]) -> Option<String> {
    let re = regex::Regex::new(r"(?im)^\s*VOTE:\s*(.+?)\s*$").ok()?;
    let vote = re.captures(content)?.get(1)?.as_str().trim().to_lowercase();
    candidates
        .iter()
        .find(|(name, _)| name.to_lowercase() == vote || vote.contains(&name.to_lowercase()))
        .map(|(name, _)| name.clone())
}
