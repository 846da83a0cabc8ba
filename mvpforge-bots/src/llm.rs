//! Claude API client and the text-generation seam every agent calls through.
//!
//! Agents only ever see [`LanguageModel::generate`], which always returns text:
//! provider failures come back as an `[Error generating response: ...]` string
//! so a build degrades instead of crashing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub const ERROR_PREFIX: &str = "[Error generating response:";
const API_URL: &str = "https://api.anthropic.com/v1/messages";
const MAX_TOKENS: u32 = 4096;

/// One prompt/response pair from an agent's earlier turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub prompt: String,
    pub response: String,
}

/// Anything that turns a prompt into text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier, for logs.
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str, system: &str, history: &[Exchange]) -> String;
}

/// True when `text` is a rendered provider failure rather than model output.
pub fn is_error_response(text: &str) -> bool {
    text.starts_with(ERROR_PREFIX)
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

/// Response from Claude API.
#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

impl ApiResponse {
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Claude API client.
pub struct LlmClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            model: crate::config::DEFAULT_MODEL.to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    /// Send a conversation to Claude and get a response.
    pub async fn chat(
        &self,
        system: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<ApiResponse> {
        let body = serde_json::json!({
            "model": &self.model,
            "max_tokens": max_tokens,
            "system": system,
            "messages": messages,
        });

        let resp = self
            .http
            .post(API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to call Claude API")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Claude API error {status}: {body}");
        }

        resp.json::<ApiResponse>()
            .await
            .context("Failed to parse Claude response")
    }

    /// Single-turn completion with prior exchanges replayed as context.
    pub async fn complete(&self, system: &str, prompt: &str, history: &[Exchange]) -> Result<String> {
        let mut messages = Vec::with_capacity(history.len() * 2 + 1);
        for exchange in history {
            messages.push(ChatMessage::user(&exchange.prompt));
            messages.push(ChatMessage::assistant(&exchange.response));
        }
        messages.push(ChatMessage::user(prompt));

        let resp = self.chat(system, &messages, MAX_TOKENS).await?;
        if let Some(usage) = &resp.usage {
            tracing::debug!(
                model = %self.model,
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                stop_reason = resp.stop_reason.as_deref().unwrap_or("-"),
                "Claude usage"
            );
        }
        Ok(resp.text())
    }
}

#[async_trait]
impl LanguageModel for LlmClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, system: &str, history: &[Exchange]) -> String {
        match self.complete(system, prompt, history).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(model = %self.model, error = %e, "Generation failed");
                format!("{ERROR_PREFIX} {e:#}]")
            }
        }
    }
}

/// Stand-in used when no API key is configured. Deterministic, no network.
pub struct OfflineModel {
    label: String,
}

impl OfflineModel {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl Default for OfflineModel {
    fn default() -> Self {
        Self::new("offline")
    }
}

#[async_trait]
impl LanguageModel for OfflineModel {
    fn name(&self) -> &str {
        &self.label
    }

    async fn generate(&self, prompt: &str, _system: &str, _history: &[Exchange]) -> String {
        let first_line = prompt.lines().next().unwrap_or_default();
        let gist: String = first_line.chars().take(200).collect();
        format!("[Offline response from {}]: I would respond to: {gist}", self.label)
    }
}
