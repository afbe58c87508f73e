//! Deterministic scripted provider for tests and offline replay.
//!
//! Each call pops the next scripted turn; once the script is exhausted
//! the last turn repeats, which is exactly what convergence tests need.
//! Turns can also inject failures to exercise retry paths.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{
    approx_tokens, ChatMessage, ProviderClient, ProviderError, ProviderResult, ProviderStream,
    StreamItem, StreamOptions, TokenUsage,
};
use crate::cancel::CancellationToken;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum ScriptedTurn {
    /// Stream this text in small chunks, then finish.
    Reply(String),
    /// Fail the call with this error before any bytes.
    Fail(ProviderError),
    /// Stream a prefix, then hang until the call is canceled or times out.
    Stall(String),
}

impl ScriptedTurn {
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }
}

/// Deterministic provider that replays a fixed script.
#[derive(Debug)]
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ScriptedTurn>>,
    last: Mutex<Option<ScriptedTurn>>,
    /// Delay between chunks; zero by default so tests stay fast.
    chunk_delay: Duration,
}

impl ScriptedProvider {
    pub fn new(name: &str, turns: Vec<ScriptedTurn>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(turns.into()),
            last: Mutex::new(None),
            chunk_delay: Duration::ZERO,
        }
    }

    /// Convenience: a provider that always answers with fixed replies.
    pub fn replies(name: &str, replies: &[&str]) -> Self {
        Self::new(
            name,
            replies.iter().map(|r| ScriptedTurn::reply(*r)).collect(),
        )
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn next_turn(&self) -> Option<ScriptedTurn> {
        let mut script = self.script.lock().expect("script lock poisoned");
        match script.pop_front() {
            Some(turn) => {
                *self.last.lock().expect("last lock poisoned") = Some(turn.clone());
                Some(turn)
            }
            None => self.last.lock().expect("last lock poisoned").clone(),
        }
    }
}

#[async_trait::async_trait]
impl ProviderClient for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        _messages: &[ChatMessage],
        _options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<ProviderStream> {
        if cancel.is_canceled() {
            return Err(ProviderError::Canceled);
        }
        let turn = self
            .next_turn()
            .ok_or_else(|| ProviderError::Permanent("empty script".to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        let cancel = cancel.clone();
        let delay = self.chunk_delay;

        tokio::spawn(async move {
            match turn {
                ScriptedTurn::Fail(err) => {
                    let _ = tx.send(Err(err)).await;
                }
                ScriptedTurn::Reply(text) => {
                    for chunk in chunks(&text) {
                        if cancel.is_canceled() {
                            let _ = tx.send(Err(ProviderError::Canceled)).await;
                            return;
                        }
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if tx.send(Ok(StreamItem::Delta(chunk))).await.is_err() {
                            return;
                        }
                    }
                    let usage = TokenUsage {
                        prompt_tokens: 0,
                        completion_tokens: approx_tokens(&text),
                    };
                    let _ = tx.send(Ok(StreamItem::Done(usage))).await;
                }
                ScriptedTurn::Stall(prefix) => {
                    for chunk in chunks(&prefix) {
                        if tx.send(Ok(StreamItem::Delta(chunk))).await.is_err() {
                            return;
                        }
                    }
                    cancel.canceled().await;
                    let _ = tx.send(Err(ProviderError::Canceled)).await;
                }
            }
        });

        Ok(ProviderStream::new(rx))
    }
}

fn chunks(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(8)
        .map(|c| c.iter().collect::<String>())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn collect(mut stream: ProviderStream) -> (String, bool) {
        let mut text = String::new();
        let mut done = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamItem::Delta(d)) => text.push_str(&d),
                Ok(StreamItem::Done(_)) => done = true,
                Err(_) => break,
            }
        }
        (text, done)
    }

    #[tokio::test]
    async fn test_reply_streams_full_text() {
        let provider = ScriptedProvider::replies("test", &["the answer is X"]);
        let stream = provider
            .stream(&[], &StreamOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        let (text, done) = collect(stream).await;
        assert_eq!(text, "the answer is X");
        assert!(done);
    }

    #[tokio::test]
    async fn test_script_exhaustion_repeats_last() {
        let provider = ScriptedProvider::replies("test", &["first", "second"]);
        let opts = StreamOptions::default();
        let cancel = CancellationToken::new();
        for expected in ["first", "second", "second", "second"] {
            let stream = provider.stream(&[], &opts, &cancel).await.unwrap();
            let (text, _) = collect(stream).await;
            assert_eq!(text, expected);
        }
    }

    #[tokio::test]
    async fn test_fail_turn_surfaces_error() {
        let provider = ScriptedProvider::new(
            "test",
            vec![
                ScriptedTurn::Fail(ProviderError::Transient("flaky".to_string())),
                ScriptedTurn::reply("recovered"),
            ],
        );
        let opts = StreamOptions::default();
        let cancel = CancellationToken::new();

        let mut stream = provider.stream(&[], &opts, &cancel).await.unwrap();
        assert!(matches!(
            stream.next().await,
            Some(Err(ProviderError::Transient(_)))
        ));

        let stream = provider.stream(&[], &opts, &cancel).await.unwrap();
        let (text, _) = collect(stream).await;
        assert_eq!(text, "recovered");
    }

    #[tokio::test]
    async fn test_stall_ends_on_cancel() {
        let provider =
            ScriptedProvider::new("test", vec![ScriptedTurn::Stall("partial ".to_string())]);
        let cancel = CancellationToken::new();
        let mut stream = provider
            .stream(&[], &StreamOptions::default(), &cancel)
            .await
            .unwrap();

        let mut text = String::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamItem::Delta(d)) => {
                    text.push_str(&d);
                    cancel.cancel();
                }
                Ok(StreamItem::Done(_)) => panic!("stalled stream must not complete"),
                Err(ProviderError::Canceled) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(text.starts_with("partial"));
    }
}
