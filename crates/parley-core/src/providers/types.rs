//! Provider-agnostic chat types

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub stop_reason: StopReason,
}

impl ChatResponse {
    /// A response that ran to completion
    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stop_reason: StopReason::EndTurn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    /// Cut off by `max_tokens`; structured output is likely incomplete
    MaxTokens,
    Unknown,
}

/// A chat-completion backend used by the classifier and disambiguation stages
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider label from config (e.g. "openai", "groq")
    fn provider_name(&self) -> &str;

    fn model(&self) -> &str;

    async fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<ChatResponse>;

    /// One user prompt in, text out. Truncated answers are errors: every
    /// caller expects a complete JSON object.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let response = self.chat(&[ChatMessage::user(prompt)], system).await?;
        if response.stop_reason == StopReason::MaxTokens {
            bail!(
                "{} ({}) stopped at max_tokens; raise max_tokens for this model",
                self.provider_name(),
                self.model()
            );
        }
        Ok(response.text)
    }
}
