//! Agent invocation layer.
//!
//! Wraps one provider call per agent turn with the engine's policy:
//! bounded retries with exponential backoff and jitter, a per-call token
//! budget with synthetic truncation, deadline enforcement, cooperative
//! cancellation, and real-time `token_*` emission on the event bus.
//!
//! Retry rules:
//! - `Transient` errors retry up to `max_attempts`.
//! - `Permanent` and `Canceled` never retry.
//! - `Timeout` retries only while partial output is below the safety
//!   threshold; past it the partial is worth keeping and the turn fails.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::events::{DebateEvent, EventKind, EventSink};
use crate::providers::{
    approx_tokens, ChatMessage, ProviderError, SharedProvider, StreamItem, StreamOptions,
};

/// Marker appended when the token budget truncates a turn.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The provider failed after the retry policy was exhausted.
    #[error("agent turn failed: {0}")]
    Provider(#[from] ProviderError),
    /// Event emission failed; storage is down and the debate cannot
    /// continue.
    #[error("event emission failed: {0}")]
    Emit(String),
    /// The turn's deadline passed before the call could start.
    #[error("turn deadline exceeded")]
    DeadlineExceeded,
}

pub type InvokeResult<T> = Result<T, InvokeError>;

/// Invocation policy knobs.
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// Attempts per turn, including the first.
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Hard completion-token budget per call.
    pub token_budget: u32,
    /// A timeout with at least this fraction of the budget already
    /// streamed is not retried.
    pub partial_retry_threshold: f64,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            token_budget: 4096,
            partial_retry_threshold: 0.2,
        }
    }
}

/// One agent turn to execute.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub debate_id: String,
    pub agent: String,
    pub round: u32,
    /// Phase role label (proposer, critic, ...).
    pub role: String,
    pub messages: Vec<ChatMessage>,
    pub options: StreamOptions,
    /// Absolute wall-clock limit for this turn.
    pub deadline: Instant,
}

/// Materialized result of a completed turn.
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub content: String,
    pub confidence: Option<f64>,
    pub citations: Vec<String>,
    pub tokens: u32,
    pub truncated: bool,
}

/// Executes agent turns against a provider, emitting token events.
#[derive(Debug)]
pub struct AgentInvoker {
    provider: SharedProvider,
    sink: Arc<dyn EventSink>,
    config: InvokerConfig,
}

impl AgentInvoker {
    pub fn new(provider: SharedProvider, sink: Arc<dyn EventSink>, config: InvokerConfig) -> Self {
        Self {
            provider,
            sink,
            config,
        }
    }

    /// Run one agent turn to completion.
    pub async fn invoke(
        &self,
        request: &TurnRequest,
        cancel: &CancellationToken,
    ) -> InvokeResult<AgentTurn> {
        let mut started = false;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_canceled() {
                return self.finish_canceled(request, started, 0).await;
            }
            let remaining = request.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                if started {
                    self.emit_error(request, "deadline", "turn deadline exceeded")?;
                }
                return Err(InvokeError::DeadlineExceeded);
            }

            let mut options = request.options.clone();
            options.timeout = options.timeout.min(remaining);

            match self
                .run_attempt(request, &options, cancel, &mut started)
                .await
            {
                AttemptOutcome::Complete(turn) => {
                    self.emit(
                        DebateEvent::debate(
                            &request.debate_id,
                            EventKind::TokenEnd {
                                tokens: turn.tokens,
                                partial: false,
                            },
                        )
                        .with_round(request.round)
                        .with_agent(&request.agent),
                    )?;
                    return Ok(turn);
                }
                AttemptOutcome::Canceled { tokens } => {
                    return self.finish_canceled(request, started, tokens).await;
                }
                AttemptOutcome::EmitFailed(reason) => {
                    return Err(InvokeError::Emit(reason));
                }
                AttemptOutcome::Failed { error, tokens } => {
                    let retriable = match &error {
                        ProviderError::Transient(_) => true,
                        ProviderError::Timeout(_) => {
                            let threshold = (self.config.token_budget as f64
                                * self.config.partial_retry_threshold)
                                as u32;
                            tokens < threshold
                        }
                        ProviderError::Permanent(_) | ProviderError::Canceled => false,
                    };
                    if !retriable || attempt >= self.config.max_attempts {
                        warn!(
                            agent = %request.agent,
                            round = request.round,
                            attempt,
                            error = %error,
                            "agent turn failed"
                        );
                        if started {
                            self.emit_error(request, "agent_failure", &error.to_string())?;
                        }
                        return Err(error.into());
                    }
                    let backoff = self.backoff(attempt);
                    debug!(
                        agent = %request.agent,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying agent turn"
                    );
                    tokio::select! {
                        _ = cancel.canceled() => {
                            return self.finish_canceled(request, started, tokens).await;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        request: &TurnRequest,
        options: &StreamOptions,
        cancel: &CancellationToken,
        started: &mut bool,
    ) -> AttemptOutcome {
        let mut stream = match self
            .provider
            .stream(&request.messages, options, cancel)
            .await
        {
            Ok(stream) => stream,
            Err(ProviderError::Canceled) => return AttemptOutcome::Canceled { tokens: 0 },
            Err(error) => return AttemptOutcome::Failed { error, tokens: 0 },
        };

        let mut content = String::new();
        let mut tokens: u32 = 0;
        let mut truncated = false;

        loop {
            let item = tokio::select! {
                _ = cancel.canceled() => return AttemptOutcome::Canceled { tokens },
                item = stream.next() => item,
            };
            match item {
                Some(Ok(StreamItem::Delta(delta))) => {
                    if !*started {
                        *started = true;
                        if let Err(e) = self.emit(
                            DebateEvent::debate(&request.debate_id, EventKind::TokenStart {})
                                .with_round(request.round)
                                .with_agent(&request.agent),
                        ) {
                            return AttemptOutcome::EmitFailed(e.to_string());
                        }
                    }
                    tokens += approx_tokens(&delta);
                    content.push_str(&delta);
                    if self
                        .emit(
                            DebateEvent::debate(
                                &request.debate_id,
                                EventKind::TokenDelta { text: delta },
                            )
                            .with_round(request.round)
                            .with_agent(&request.agent),
                        )
                        .is_err()
                    {
                        return AttemptOutcome::EmitFailed(
                            "token delta append rejected".to_string(),
                        );
                    }
                    if tokens >= self.config.token_budget {
                        // Hard budget: close the stream and truncate with a
                        // synthetic stop marker.
                        content.push_str(TRUNCATION_MARKER);
                        truncated = true;
                        break;
                    }
                }
                Some(Ok(StreamItem::Done(usage))) => {
                    if usage.completion_tokens > 0 {
                        tokens = usage.completion_tokens;
                    }
                    break;
                }
                Some(Err(ProviderError::Canceled)) => {
                    return AttemptOutcome::Canceled { tokens }
                }
                Some(Err(error)) => return AttemptOutcome::Failed { error, tokens },
                None => break,
            }
        }

        let confidence = extract_confidence(&content);
        let citations = extract_citations(&content);
        AttemptOutcome::Complete(AgentTurn {
            content,
            confidence,
            citations,
            tokens,
            truncated,
        })
    }

    /// Close the subscriber-visible stream on cancellation. The partial
    /// content is discarded; only the terminal frame goes out.
    async fn finish_canceled(
        &self,
        request: &TurnRequest,
        started: bool,
        tokens: u32,
    ) -> InvokeResult<AgentTurn> {
        if started {
            self.emit(
                DebateEvent::debate(
                    &request.debate_id,
                    EventKind::TokenEnd {
                        tokens,
                        partial: true,
                    },
                )
                .with_round(request.round)
                .with_agent(&request.agent),
            )?;
        }
        Err(ProviderError::Canceled.into())
    }

    fn emit(&self, event: DebateEvent) -> Result<DebateEvent, InvokeError> {
        self.sink
            .publish(event)
            .map_err(|e| InvokeError::Emit(e.to_string()))
    }

    fn emit_error(&self, request: &TurnRequest, code: &str, message: &str) -> InvokeResult<()> {
        self.emit(
            DebateEvent::debate(
                &request.debate_id,
                EventKind::Error {
                    code: code.to_string(),
                    message: message.to_string(),
                },
            )
            .with_round(request.round)
            .with_agent(&request.agent),
        )?;
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .min(self.config.max_backoff);
        let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis().max(1) as u64 / 2);
        exp + Duration::from_millis(jitter_ms)
    }
}

/// Pull a trailing self-reported confidence out of the turn text.
pub fn extract_confidence(content: &str) -> Option<f64> {
    let re = regex::Regex::new(r"(?i)confidence[:=]\s*(1(?:\.0+)?|0?\.\d+|0|1)").ok()?;
    re.captures_iter(content)
        .last()
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 1.0))
}

/// Drop trailing self-reported confidence markers from turn text. The
/// marker is turn metadata; vote choices and claims compare without it.
pub fn strip_confidence(content: &str) -> String {
    let re = regex::Regex::new(r"(?is)\s*confidence[:=]\s*[0-9.]+\s*$").expect("strip regex");
    re.replace(content, "").trim().to_string()
}

/// Collect cited URLs and bracketed reference markers.
pub fn extract_citations(content: &str) -> Vec<String> {
    let re = regex::Regex::new(r"https?://[^\s)\]>]+").expect("citation regex");
    re.find_iter(content).map(|m| m.as_str().to_string()).collect()
}

enum AttemptOutcome {
    Complete(AgentTurn),
    Canceled { tokens: u32 },
    Failed { error: ProviderError, tokens: u32 },
    /// Durable event append failed; fatal to the debate, never retried.
    EmitFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{BusResult, DebateEvent};
    use crate::providers::scripted::{ScriptedProvider, ScriptedTurn};
    use std::sync::Mutex;

    /// Sink that records events in order.
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<DebateEvent>>,
    }

    impl EventSink for RecordingSink {
        fn publish(&self, event: DebateEvent) -> BusResult<DebateEvent> {
            self.events.lock().unwrap().push(event.clone());
            Ok(event)
        }
    }

    impl RecordingSink {
        fn types(&self) -> Vec<&'static str> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.type_name())
                .collect()
        }
    }

    fn request(agent: &str) -> TurnRequest {
        TurnRequest {
            debate_id: "d-1".to_string(),
            agent: agent.to_string(),
            round: 1,
            role: "proposer".to_string(),
            messages: vec![ChatMessage::user("task")],
            options: StreamOptions::default(),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    fn invoker(provider: ScriptedProvider, sink: Arc<RecordingSink>) -> AgentInvoker {
        AgentInvoker::new(
            Arc::new(provider),
            sink,
            InvokerConfig {
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                ..InvokerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_successful_turn_emits_ordered_token_events() {
        let sink = Arc::new(RecordingSink::default());
        let invoker = invoker(
            ScriptedProvider::replies("s", &["I propose X. Confidence: 0.8"]),
            sink.clone(),
        );

        let turn = invoker
            .invoke(&request("claude"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(turn.content.contains("I propose X"));
        assert_eq!(turn.confidence, Some(0.8));
        assert!(!turn.truncated);

        let types = sink.types();
        assert_eq!(types.first(), Some(&"token_start"));
        assert_eq!(types.last(), Some(&"token_end"));
        assert!(types[1..types.len() - 1]
            .iter()
            .all(|t| *t == "token_delta"));
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_succeeds() {
        let sink = Arc::new(RecordingSink::default());
        let invoker = invoker(
            ScriptedProvider::new(
                "s",
                vec![
                    ScriptedTurn::Fail(ProviderError::Transient("blip".to_string())),
                    ScriptedTurn::reply("recovered answer"),
                ],
            ),
            sink.clone(),
        );

        let turn = invoker
            .invoke(&request("gpt"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(turn.content, "recovered answer");
    }

    #[tokio::test]
    async fn test_permanent_failure_does_not_retry() {
        let sink = Arc::new(RecordingSink::default());
        let invoker = invoker(
            ScriptedProvider::new(
                "s",
                vec![
                    ScriptedTurn::Fail(ProviderError::Permanent("safety block".to_string())),
                    ScriptedTurn::reply("should never be reached"),
                ],
            ),
            sink.clone(),
        );

        let err = invoker
            .invoke(&request("gpt"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Provider(ProviderError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn test_budget_truncates_with_marker() {
        let sink = Arc::new(RecordingSink::default());
        let long = "word ".repeat(200);
        let invoker = AgentInvoker::new(
            Arc::new(ScriptedProvider::replies("s", &[&long])),
            sink.clone(),
            InvokerConfig {
                token_budget: 10,
                ..InvokerConfig::default()
            },
        );

        let turn = invoker
            .invoke(&request("claude"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(turn.truncated);
        assert!(turn.content.ends_with(TRUNCATION_MARKER));
        assert!(turn.tokens >= 10);
    }

    #[tokio::test]
    async fn test_cancellation_closes_stream_with_partial_end() {
        let sink = Arc::new(RecordingSink::default());
        let invoker = invoker(
            ScriptedProvider::new("s", vec![ScriptedTurn::Stall("thinking ".to_string())]),
            sink.clone(),
        );

        let cancel = CancellationToken::new();
        let req = request("claude");
        let cancel_for_task = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_for_task.cancel();
        });

        let err = invoker.invoke(&req, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            InvokeError::Provider(ProviderError::Canceled)
        ));

        let events = sink.events.lock().unwrap();
        let ends: Vec<_> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::TokenEnd { partial, .. } => Some(*partial),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![true]);
    }

    #[tokio::test]
    async fn test_deadline_exceeded_before_start() {
        let sink = Arc::new(RecordingSink::default());
        let invoker = invoker(ScriptedProvider::replies("s", &["late"]), sink);

        let mut req = request("claude");
        req.deadline = Instant::now();
        let err = invoker
            .invoke(&req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::DeadlineExceeded));
    }

    #[test]
    fn test_extract_confidence() {
        assert_eq!(extract_confidence("Confidence: 0.85"), Some(0.85));
        assert_eq!(extract_confidence("confidence=1"), Some(1.0));
        assert_eq!(
            extract_confidence("first Confidence: 0.2 then Confidence: 0.9"),
            Some(0.9)
        );
        assert_eq!(extract_confidence("no marker here"), None);
    }

    #[test]
    fn test_strip_confidence() {
        assert_eq!(strip_confidence("Choose X. Confidence: 0.6"), "Choose X.");
        assert_eq!(
            strip_confidence("Choose X.\nConfidence: 1.0"),
            "Choose X."
        );
        assert_eq!(strip_confidence("no marker"), "no marker");
    }

    #[test]
    fn test_extract_citations() {
        let cites = extract_citations("see https://example.com/a and (https://b.io/x).");
        assert_eq!(cites, vec!["https://example.com/a", "https://b.io/x"]);
    }
}
