//! Anthropic messages API streaming client.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;

use super::{
    ChatMessage, ChatRole, ProviderClient, ProviderError, ProviderResult, ProviderStream,
    StreamItem, StreamOptions, TokenUsage,
};
use crate::cancel::CancellationToken;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";

/// Streaming client for the Anthropic messages API.
#[derive(Debug)]
pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }

    fn request_body(messages: &[ChatMessage], options: &StreamOptions) -> serde_json::Value {
        // Anthropic takes the system prompt out-of-band; system-role
        // transcript messages are folded into it.
        let mut system_parts: Vec<String> =
            options.system_prompt.iter().cloned().collect();
        let mut wire: Vec<serde_json::Value> = Vec::new();
        for message in messages {
            match message.role {
                ChatRole::System => system_parts.push(message.content.clone()),
                ChatRole::User => wire.push(json!({"role": "user", "content": message.content})),
                ChatRole::Assistant => {
                    wire.push(json!({"role": "assistant", "content": message.content}))
                }
            }
        }
        let mut body = json!({
            "model": options.model,
            "messages": wire,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": true,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if !options.stop_sequences.is_empty() {
            body["stop_sequences"] = json!(options.stop_sequences);
        }
        body
    }

    /// Delta text from a `content_block_delta` SSE payload.
    fn parse_delta(payload: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        if value["type"] != "content_block_delta" {
            return None;
        }
        value["delta"]["text"].as_str().map(String::from)
    }

    fn parse_stop(payload: &str) -> Option<TokenUsage> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        match value["type"].as_str()? {
            "message_delta" | "message_stop" => {
                let usage = &value["usage"];
                Some(TokenUsage {
                    prompt_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
                    completion_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
                })
            }
            _ => None,
        }
    }

    fn is_message_stop(payload: &str) -> bool {
        serde_json::from_str::<serde_json::Value>(payload)
            .map(|v| v["type"] == "message_stop")
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl ProviderClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(
        &self,
        messages: &[ChatMessage],
        options: &StreamOptions,
        cancel: &CancellationToken,
    ) -> ProviderResult<ProviderStream> {
        if cancel.is_canceled() {
            return Err(ProviderError::Canceled);
        }

        let url = format!("{}/messages", self.base_url);
        let body = Self::request_body(messages, options);

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .timeout(options.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(options.timeout)
                } else {
                    ProviderError::Transient(format!("request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), "messages"));
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = cancel.clone();
        let inactivity = options.inactivity_timeout;
        let deadline = Instant::now() + options.timeout;

        tokio::spawn(async move {
            let mut body = response;
            let mut buffer = String::new();
            let mut usage = TokenUsage::default();
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    let _ = tx.send(Err(ProviderError::Timeout(inactivity))).await;
                    return;
                }
                let chunk = tokio::select! {
                    _ = cancel.canceled() => {
                        let _ = tx.send(Err(ProviderError::Canceled)).await;
                        return;
                    }
                    read = tokio::time::timeout(inactivity.min(remaining), body.chunk()) => read,
                };
                let chunk = match chunk {
                    Err(_) => {
                        let _ = tx.send(Err(ProviderError::Timeout(inactivity))).await;
                        return;
                    }
                    Ok(Err(e)) => {
                        let _ = tx
                            .send(Err(ProviderError::Transient(format!("stream read: {e}"))))
                            .await;
                        return;
                    }
                    Ok(Ok(None)) => {
                        let _ = tx.send(Ok(StreamItem::Done(usage))).await;
                        return;
                    }
                    Ok(Ok(Some(bytes))) => bytes,
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(newline) = buffer.find('\n') {
                    let line = buffer[..newline].trim().to_string();
                    buffer.drain(..=newline);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if let Some(found) = Self::parse_stop(payload) {
                        if found.completion_tokens > 0 || found.prompt_tokens > 0 {
                            usage = found;
                        }
                    }
                    if Self::is_message_stop(payload) {
                        let _ = tx.send(Ok(StreamItem::Done(usage))).await;
                        return;
                    }
                    if let Some(delta) = Self::parse_delta(payload) {
                        if !delta.is_empty()
                            && tx.send(Ok(StreamItem::Delta(delta))).await.is_err()
                        {
                            return;
                        }
                    }
                }
            }
        });

        Ok(ProviderStream::new(rx))
    }
}
