//! Event envelope for the debate stream.
//!
//! Events are a closed set of variants behind a common header. The wire
//! format is the serde projection of [`DebateEvent`]: header fields plus
//! the flattened `type`-tagged payload. Everything the engine emits
//! (lifecycle, token streaming, voting, ranking, system) goes through
//! this one type.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-debate monotone sequence number, assigned on durable append.
pub type EventSeq = u64;

/// Why a debate ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateOutcome {
    Consensus,
    NoConsensus,
    Canceled,
    Error,
}

impl std::fmt::Display for DebateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consensus => write!(f, "consensus"),
            Self::NoConsensus => write!(f, "no_consensus"),
            Self::Canceled => write!(f, "canceled"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Payload variants for the debate stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    DebateStart {
        task: String,
        agents: Vec<String>,
        rounds_planned: u32,
    },
    RoundStart {
        round: u32,
    },
    RoundEnd {
        round: u32,
        similarity: Option<f64>,
    },
    /// Authoritative per-turn record, emitted by the orchestrator after
    /// the turn's token stream has closed.
    AgentMessage {
        role: String,
        content: String,
        confidence: Option<f64>,
    },
    TokenStart {},
    TokenDelta {
        text: String,
    },
    TokenEnd {
        tokens: u32,
        partial: bool,
    },
    Critique {
        target: String,
        content: String,
    },
    Vote {
        choice: String,
        confidence: Option<f64>,
    },
    Consensus {
        reached: bool,
        choice: Option<String>,
        confidence: f64,
        policy: String,
    },
    MatchRecorded {
        winner: Option<String>,
        elo_changes: BTreeMap<String, f64>,
        domain: String,
    },
    FlipDetected {
        kind: String,
        similarity: f64,
        domain: String,
    },
    DebateEnd {
        outcome: DebateOutcome,
        rounds_used: u32,
    },
    /// Initial snapshot sent to a new subscriber before live events.
    Sync {
        snapshot: serde_json::Value,
    },
    Error {
        code: String,
        message: String,
    },
}

impl EventKind {
    /// Wire name of this variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DebateStart { .. } => "debate_start",
            Self::RoundStart { .. } => "round_start",
            Self::RoundEnd { .. } => "round_end",
            Self::AgentMessage { .. } => "agent_message",
            Self::TokenStart {} => "token_start",
            Self::TokenDelta { .. } => "token_delta",
            Self::TokenEnd { .. } => "token_end",
            Self::Critique { .. } => "critique",
            Self::Vote { .. } => "vote",
            Self::Consensus { .. } => "consensus",
            Self::MatchRecorded { .. } => "match_recorded",
            Self::FlipDetected { .. } => "flip_detected",
            Self::DebateEnd { .. } => "debate_end",
            Self::Sync { .. } => "sync",
            Self::Error { .. } => "error",
        }
    }
}

/// One event in the debate stream: common header + typed payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateEvent {
    /// Monotone per-debate sequence number; 0 until durably appended.
    #[serde(default)]
    pub seq: EventSeq,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debate_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DebateEvent {
    /// Build an event scoped to a debate.
    pub fn debate(debate_id: &str, kind: EventKind) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            debate_id: Some(debate_id.to_string()),
            round: None,
            agent: None,
            kind,
        }
    }

    /// Build an unscoped system event.
    pub fn system(kind: EventKind) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            debate_id: None,
            round: None,
            agent: None,
            kind,
        }
    }

    pub fn with_round(mut self, round: u32) -> Self {
        self.round = Some(round);
        self
    }

    pub fn with_agent(mut self, agent: &str) -> Self {
        self.agent = Some(agent.to_string());
        self
    }

    /// Wire name of the payload variant.
    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Whether this is an incremental token frame (subject to coalescing
    /// in the fan-out layer).
    pub fn is_token_delta(&self) -> bool {
        matches!(self.kind, EventKind::TokenDelta { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_flattens_type_tag() {
        let event = DebateEvent::debate(
            "d-1",
            EventKind::RoundStart { round: 2 },
        )
        .with_round(2);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "round_start");
        assert_eq!(json["debate_id"], "d-1");
        assert_eq!(json["round"], 2);
    }

    #[test]
    fn test_event_roundtrip() {
        let event = DebateEvent::debate(
            "d-2",
            EventKind::TokenDelta {
                text: "hello".into(),
            },
        )
        .with_agent("claude");

        let json = serde_json::to_string(&event).unwrap();
        let parsed: DebateEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.type_name(), "token_delta");
        assert_eq!(parsed.agent.as_deref(), Some("claude"));
        assert!(parsed.is_token_delta());
    }

    #[test]
    fn test_type_names() {
        let kinds = [
            (
                EventKind::DebateStart {
                    task: String::new(),
                    agents: vec![],
                    rounds_planned: 1,
                },
                "debate_start",
            ),
            (
                EventKind::DebateEnd {
                    outcome: DebateOutcome::Consensus,
                    rounds_used: 1,
                },
                "debate_end",
            ),
            (EventKind::TokenStart {}, "token_start"),
            (
                EventKind::Sync {
                    snapshot: serde_json::Value::Null,
                },
                "sync",
            ),
        ];
        for (kind, name) in kinds {
            assert_eq!(kind.type_name(), name);
        }
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(DebateOutcome::Consensus.to_string(), "consensus");
        assert_eq!(DebateOutcome::NoConsensus.to_string(), "no_consensus");
        assert_eq!(DebateOutcome::Canceled.to_string(), "canceled");
        assert_eq!(DebateOutcome::Error.to_string(), "error");
    }
}
