//! Chat-completions client for OpenAI and OpenAI-compatible endpoints
//!
//! Groq, Ollama, LM Studio and most gateways speak the same wire format, so
//! one client serves them all; `provider` in the params is only a label.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::LlmParams;
use super::types::{ChatMessage, ChatResponse, ChatRole, LlmProvider, StopReason};

/// Truncate error bodies in messages
const MAX_ERROR_BODY: usize = 300;

pub struct OpenAiProvider {
    client: Client,
    name: String,
    api_key: String,
    endpoint: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    log_requests_and_responses: bool,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish()
    }
}

impl OpenAiProvider {
    pub fn from_params(params: &LlmParams) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(params.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            name: params.provider.clone(),
            api_key: params.api_key.clone(),
            endpoint: format!("{}/v1/chat/completions", params.base_url.trim_end_matches('/')),
            model: params.model.clone(),
            max_tokens: params.max_tokens,
            temperature: params.temperature,
            log_requests_and_responses: params.log_requests_and_responses,
        })
    }

    fn request<'a>(&'a self, messages: &'a [ChatMessage], system: &'a str) -> CompletionRequest<'a> {
        let mut wire = Vec::with_capacity(messages.len() + 1);
        wire.push(WireMessage {
            role: ChatRole::System,
            content: system,
        });
        // The system prompt is always the dedicated argument
        wire.extend(
            messages
                .iter()
                .filter(|m| m.role != ChatRole::System)
                .map(|m| WireMessage {
                    role: m.role,
                    content: &m.content,
                }),
        );
        CompletionRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            messages: wire,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<ChatResponse> {
        let request = self.request(messages, system);
        if self.log_requests_and_responses {
            debug!("{} request: {}", self.name, serde_json::to_string(&request).unwrap_or_default());
        } else {
            debug!("{} request: model={}, messages={}", self.name, self.model, request.messages.len());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .with_context(|| format!("{} request to {} failed", self.name, self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(MAX_ERROR_BODY).collect();
            return Err(anyhow!("{} returned status {}: {}", self.name, status, body));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .with_context(|| format!("Unreadable {} completion", self.name))?;
        let response = completion.into_chat_response()?;
        if self.log_requests_and_responses {
            debug!("{} response ({:?}): {}", self.name, response.stop_reason, response.text);
        }
        Ok(response)
    }
}

// ── Wire types ──

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: ChatRole,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl CompletionResponse {
    fn into_chat_response(self) -> Result<ChatResponse> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("completion had no choices"))?;
        let stop_reason = match choice.finish_reason.as_deref() {
            Some("stop") => StopReason::EndTurn,
            Some("length") => StopReason::MaxTokens,
            _ => StopReason::Unknown,
        };
        Ok(ChatResponse {
            text: choice.message.content.unwrap_or_default(),
            stop_reason,
        })
    }
}
