//! OpenAI-compatible streaming chat client.
//!
//! Covers every vendor that speaks the `/chat/completions` SSE protocol
//! (OpenAI, Grok, DeepSeek, Gemini's compat endpoint, llama.cpp). The
//! base URL is configurable so one client type serves them all.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    ChatMessage, ChatRole, ProviderClient, ProviderError, ProviderResult, ProviderStream,
    StreamItem, StreamOptions, TokenUsage,
};
use crate::cancel::CancellationToken;

/// Streaming client for OpenAI-compatible chat completion APIs.
#[derive(Debug)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    name: String,
}

impl OpenAiClient {
    pub fn new(name: &str, base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            name: name.to_string(),
        }
    }

    fn request_body(messages: &[ChatMessage], options: &StreamOptions) -> serde_json::Value {
        let mut wire: Vec<serde_json::Value> = Vec::new();
        if let Some(system) = &options.system_prompt {
            wire.push(json!({"role": "system", "content": system}));
        }
        for message in messages {
            let role = match message.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
            };
            wire.push(json!({"role": role, "content": message.content}));
        }
        let mut body = json!({
            "model": options.model,
            "messages": wire,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": true,
        });
        if !options.stop_sequences.is_empty() {
            body["stop"] = json!(options.stop_sequences);
        }
        body
    }

    /// Pull the delta text out of one SSE `data:` payload.
    fn parse_delta(payload: &str) -> Option<String> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        value["choices"][0]["delta"]["content"]
            .as_str()
            .map(String::from)
    }

    fn parse_usage(payload: &str) -> Option<TokenUsage> {
        let value: serde_json::Value = serde_json::from_str(payload).ok()?;
        let usage = value.get("usage")?;
        Some(TokenUsage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }
}

#[async_trait::async_trait]
impl ProviderClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.name
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

        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::request_body(messages, options);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
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
            // Body intentionally discarded: error payloads can echo
            // request content, which must never reach logs.
            return Err(ProviderError::from_status(status.as_u16(), "chat completion"));
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = cancel.clone();
        let inactivity = options.inactivity_timeout;
        let deadline = Instant::now() + options.timeout;
        let provider = self.name.clone();

        tokio::spawn(async move {
            let mut body = response;
            let mut buffer = String::new();
            let mut usage = TokenUsage::default();
            let mut emitted: u32 = 0;
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
                        // Server closed without [DONE]; treat what we have
                        // as complete.
                        usage.completion_tokens = usage.completion_tokens.max(emitted);
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
                    if payload == "[DONE]" {
                        usage.completion_tokens = usage.completion_tokens.max(emitted);
                        debug!(provider, "stream complete");
                        let _ = tx.send(Ok(StreamItem::Done(usage))).await;
                        return;
                    }
                    if let Some(found) = Self::parse_usage(payload) {
                        usage = found;
                    }
                    if let Some(delta) = Self::parse_delta(payload) {
                        if !delta.is_empty() {
                            emitted += super::approx_tokens(&delta);
                            if tx.send(Ok(StreamItem::Delta(delta))).await.is_err() {
                                // Consumer dropped the stream; stop reading.
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(ProviderStream::new(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_delta() {
        let payload = r#"{"choices":[{"delta":{"content":"hi"}}]}"#;
        assert_eq!(OpenAiClient::parse_delta(payload), Some("hi".to_string()));

        let empty = r#"{"choices":[{"delta":{}}]}"#;
        assert_eq!(OpenAiClient::parse_delta(empty), None);
    }

    #[test]
    fn test_parse_usage() {
        let payload = r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34}}"#;
        let usage = OpenAiClient::parse_usage(payload).unwrap();
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 34);
    }

    #[test]
    fn test_request_body_includes_system_and_stop() {
        let options = StreamOptions {
            model: "gpt-4o".to_string(),
            system_prompt: Some("be brief".to_string()),
            stop_sequences: vec!["END".to_string()],
            ..StreamOptions::default()
        };
        let body =
            OpenAiClient::request_body(&[ChatMessage::user("q")], &options);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["stop"][0], "END");
    }

    #[tokio::test]
    async fn test_pre_canceled_call_short_circuits() {
        let client = OpenAiClient::new("openai", "http://localhost:0", "k");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .stream(&[ChatMessage::user("q")], &StreamOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Canceled));
    }
}
