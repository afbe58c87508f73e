//! Streaming LLM provider clients.
//!
//! One contract: [`ProviderClient::stream`] turns a chat prompt into a
//! finite, non-restartable sequence of text deltas followed by a usage
//! summary. Vendor differences (OpenAI-compatible chat completions,
//! Anthropic messages) live behind the trait; retries and budgets live
//! above it in the invoker.
//!
//! Clients never log request or response bodies, and never log keys.

pub mod anthropic;
pub mod openai;
pub mod scripted;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cancel::CancellationToken;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;
pub use scripted::ScriptedProvider;

/// Provider failure taxonomy. The invoker's retry policy keys off these
/// variants, so classification here is the contract.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Network failure, 5xx, or 429; retriable.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// 4xx semantic rejection; never retried.
    #[error("permanent provider rejection: {0}")]
    Permanent(String),
    /// No bytes within the inactivity window or total budget exceeded.
    #[error("provider timed out after {0:?}")]
    Timeout(Duration),
    /// Explicit cancellation from the debate's token.
    #[error("provider call canceled")]
    Canceled,
}

impl ProviderError {
    /// Classify an HTTP status the way the invoker expects.
    pub fn from_status(status: u16, detail: &str) -> Self {
        if status == 429 || status >= 500 {
            Self::Transient(format!("status {status}: {detail}"))
        } else {
            Self::Permanent(format!("status {status}: {detail}"))
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message in the prompt transcript.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Options for one streaming call.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub stop_sequences: Vec<String>,
    /// Total wall-clock budget for the call.
    pub timeout: Duration,
    /// Inactivity window: no bytes for this long fails the stream.
    pub inactivity_timeout: Duration,
    pub system_prompt: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.7,
            max_tokens: 2048,
            stop_sequences: Vec::new(),
            timeout: Duration::from_secs(120),
            inactivity_timeout: Duration::from_secs(30),
            system_prompt: None,
        }
    }
}

/// Final accounting for a completed stream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// One item in a provider stream.
#[derive(Debug, Clone)]
pub enum StreamItem {
    /// Incremental text.
    Delta(String),
    /// Terminal marker with usage; nothing follows it.
    Done(TokenUsage),
}

/// A finite, non-restartable sequence of stream items.
///
/// Backed by a channel fed by the provider's I/O task; dropping the
/// stream tears the task down.
#[derive(Debug)]
pub struct ProviderStream {
    rx: mpsc::Receiver<ProviderResult<StreamItem>>,
}

impl ProviderStream {
    pub fn new(rx: mpsc::Receiver<ProviderResult<StreamItem>>) -> Self {
        Self { rx }
    }

    /// Next item, or `None` once the stream is exhausted.
    pub async fn next(&mut self) -> Option<ProviderResult<StreamItem>> {
        self.rx.recv().await
    }
}

/// Rough token estimate from raw text. Four characters per token is the
/// conventional approximation for budget enforcement.
pub fn approx_tokens(text: &str) -> u32 {
    (text.chars().count() as u32).div_ceil(4)
}

/// A streaming LLM provider.
#[async_trait]
pub trait ProviderClient: Send + Sync + std::fmt::Debug {
    /// Stable provider name for logs and metrics.
    fn name(&self) -> &str;

    /// Start one streaming completion. The returned stream yields zero or
    /// more `Delta` items then exactly one `Done`, or terminates with an
    /// error item.
    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<ProviderStream>;
}

/// Shared handle to a provider.
pub type SharedProvider = Arc<dyn ProviderClient>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ProviderError::from_status(429, "slow down").is_retriable());
        assert!(ProviderError::from_status(500, "oops").is_retriable());
        assert!(ProviderError::from_status(503, "busy").is_retriable());
        assert!(!ProviderError::from_status(400, "bad request").is_retriable());
        assert!(!ProviderError::from_status(404, "no model").is_retriable());
    }

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens(""), 0);
        assert_eq!(approx_tokens("abcd"), 1);
        assert_eq!(approx_tokens("abcde"), 2);
    }

    #[test]
    fn test_chat_message_builders() {
        assert_eq!(ChatMessage::system("s").role, ChatRole::System);
        assert_eq!(ChatMessage::user("u").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("a").role, ChatRole::Assistant);
    }
}
