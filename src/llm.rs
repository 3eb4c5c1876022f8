//! Streaming LLM: token-streaming chat completions over SSE, with a rolling
//! conversation history trimmed to a token budget.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backoff;
use crate::config::Settings;

const MAX_RETRIES: u32 = 3;

const SYSTEM_PROMPT: &str = "You are a helpful AI assistant in a voice conversation. \
     Keep responses concise and conversational (2-3 sentences max). \
     Remember previous context.";

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),
}

impl LlmError {
    fn is_transient(&self) -> bool {
        match self {
            LlmError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status >= 500,
            LlmError::Stream(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Rolling conversation history bounded by an approximate token budget
/// (4 characters ≈ 1 token). Oldest turns are pruned first; the system
/// prompt is always retained.
pub struct ConversationHistory {
    turns: std::collections::VecDeque<Message>,
    max_tokens: usize,
}

impl ConversationHistory {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            turns: std::collections::VecDeque::new(),
            max_tokens,
        }
    }

    /// Commit a completed exchange. Cancelled exchanges never reach this.
    pub fn commit_turn(&mut self, user_text: &str, agent_text: &str) {
        self.turns.push_back(Message::user(user_text));
        self.turns.push_back(Message::assistant(agent_text));
        self.trim();
    }

    /// Messages for the next request: system prompt, history, new user turn.
    pub fn build_messages(&self, user_text: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(self.turns.len() + 2);
        messages.push(Message::system(SYSTEM_PROMPT));
        messages.extend(self.turns.iter().cloned());
        messages.push(Message::user(user_text));
        messages
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn estimated_tokens(&self) -> usize {
        self.turns
            .iter()
            .map(|m| m.content.len() / 4 + m.role.len() / 4 + 4)
            .sum()
    }

    fn trim(&mut self) {
        while self.estimated_tokens() > self.max_tokens && !self.turns.is_empty() {
            self.turns.pop_front();
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Emit a partial every this many deltas…
    pub partial_every: u64,
    /// …but not more often than this.
    pub partial_min_interval: Duration,
    pub request_timeout: Duration,
}

impl LlmConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_url: settings.llm_base_url.clone(),
            api_key: settings.llm_api_key().to_string(),
            model: settings.llm_model.clone(),
            max_tokens: settings.llm_max_tokens,
            temperature: settings.llm_temperature,
            partial_every: 5,
            partial_min_interval: Duration::from_millis(100),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// How a streaming exchange ended.
#[derive(Debug)]
pub enum LlmOutcome {
    /// Stream closed; `text` is the full response (may be empty).
    Complete { text: String, tokens: u64 },
    /// Barge-in or shutdown; nothing was emitted, nothing should be
    /// committed.
    Cancelled,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

/// Client for the `POST /chat/completions` SSE contract.
pub struct LlmClient {
    client: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, config }
    }

    /// Run one streaming exchange. Accumulated partials are pushed through
    /// `partial_tx` on the configured cadence; the returned outcome carries
    /// the full text. Cancellation aborts the connection mid-stream.
    pub async fn stream_chat(
        &self,
        messages: Vec<Message>,
        partial_tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<LlmOutcome, LlmError> {
        let mut attempt = 0u32;
        let response = loop {
            if cancel.is_cancelled() {
                return Ok(LlmOutcome::Cancelled);
            }
            match self.open_stream(&messages).await {
                Ok(response) => break response,
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    log::warn!("[LLM-RETRY] attempt {}: {}", attempt + 1, e);
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(LlmOutcome::Cancelled),
                        _ = tokio::time::sleep(backoff::delay(attempt)) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let mut stream = response.bytes_stream();
        let mut line_buf = String::new();
        let mut accumulated = String::new();
        let mut tokens = 0u64;
        let mut deltas_since_emit = 0u64;
        let mut last_emit = Instant::now() - self.config.partial_min_interval;

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the stream aborts the connection without
                    // draining the response.
                    return Ok(LlmOutcome::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    // Mid-stream transport loss: surface what we have rather
                    // than dropping a half-spoken answer.
                    log::warn!("[LLM] stream interrupted: {}", e);
                    break;
                }
                None => break,
            };

            line_buf.push_str(&String::from_utf8_lossy(&bytes));
            let mut done = false;

            while let Some(pos) = line_buf.find('\n') {
                let line: String = line_buf.drain(..=pos).collect();
                let line = line.trim();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    done = true;
                    break;
                }
                match serde_json::from_str::<StreamChunk>(data) {
                    Ok(chunk) => {
                        let delta = chunk
                            .choices
                            .first()
                            .and_then(|c| c.delta.content.as_deref())
                            .unwrap_or("");
                        if delta.is_empty() {
                            continue;
                        }
                        accumulated.push_str(delta);
                        tokens += 1;
                        deltas_since_emit += 1;

                        if deltas_since_emit >= self.config.partial_every
                            && last_emit.elapsed() >= self.config.partial_min_interval
                        {
                            deltas_since_emit = 0;
                            last_emit = Instant::now();
                            // A slow consumer drops intermediate partials;
                            // the final always carries the full text.
                            let _ = partial_tx.try_send(accumulated.clone());
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "[LLM] failed to parse chunk: {} ({})",
                            crate::util::preview(data, 100),
                            e
                        );
                    }
                }
            }

            if done {
                break;
            }
        }

        Ok(LlmOutcome::Complete {
            text: accumulated,
            tokens,
        })
    }

    async fn open_stream(&self, messages: &[Message]) -> Result<reqwest::Response, LlmError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let messages_json: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": m.content }))
            .collect();

        let payload = json!({
            "model": self.config.model,
            "messages": messages_json,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "stream": true,
        });

        let mut request = self.client.post(&url).json(&payload);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_constructors() {
        assert_eq!(Message::system("a").role, "system");
        assert_eq!(Message::user("b").role, "user");
        assert_eq!(Message::assistant("c").role, "assistant");
    }

    #[test]
    fn test_history_build_messages() {
        let mut history = ConversationHistory::new(512);
        history.commit_turn("hi", "hello!");

        let messages = history.build_messages("how are you");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "hi");
        assert_eq!(messages[2].content, "hello!");
        assert_eq!(messages[3].content, "how are you");
    }

    #[test]
    fn test_history_trims_oldest_first() {
        // ~25 tokens per turn at 4 chars/token; budget of 60 keeps roughly
        // the two most recent exchanges.
        let mut history = ConversationHistory::new(60);
        for i in 0..10 {
            history.commit_turn(
                &format!("user message number {i} padding padding"),
                &format!("agent message number {i} padding padding"),
            );
        }
        assert!(history.estimated_tokens() <= 60);
        assert!(history.len() < 20);

        let messages = history.build_messages("next");
        // Most recent exchange survives
        assert!(messages.iter().any(|m| m.content.contains("number 9")));
        assert!(!messages.iter().any(|m| m.content.contains("number 0")));
    }

    #[test]
    fn test_history_empty() {
        let history = ConversationHistory::new(512);
        assert!(history.is_empty());
        let messages = history.build_messages("hello");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn test_sse_chunk_parsing() {
        let data = r#"{"choices":[{"delta":{"content":"Hel"}}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));

        // Role-only deltas carry no content
        let data = r#"{"choices":[{"delta":{"role":"assistant"}}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
    }
}
