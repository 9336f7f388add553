//! LLM provider abstraction used by the classifier and disambiguation stages
//!
//! Any OpenAI-compatible chat endpoint works. Providers implement the
//! [`LlmProvider`] trait and can be composed via [`ModelRouter`] for failover.

pub mod openai;
pub mod router;
pub mod types;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{Result, RuntimeError};

pub use openai::OpenAiProvider;
pub use router::ModelRouter;
pub use types::{ChatMessage, ChatResponse, ChatRole, LlmProvider, StopReason};

/// Connection and sampling parameters for one LLM
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmParams {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub log_requests_and_responses: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmParams {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: String::new(),
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            log_requests_and_responses: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl std::fmt::Debug for LlmParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmParams")
            .field("provider", &self.provider)
            .field("api_key", &mask_secret(&self.api_key))
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("log_requests_and_responses", &self.log_requests_and_responses)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    512
}
fn default_timeout_secs() -> u64 {
    30
}

impl LlmParams {
    /// Startup validation. `label` names the config section in messages.
    pub fn validate(&self, label: &str) -> Result<()> {
        // An unexpanded ${VAR} means the variable was missing or not allowlisted
        if self.api_key.trim().is_empty() || self.api_key.contains("${") {
            return Err(RuntimeError::configuration(format!(
                "{}: api_key is required",
                label
            )));
        }
        if self.provider.trim().is_empty() {
            return Err(RuntimeError::configuration(format!(
                "{}: provider must not be empty",
                label
            )));
        }
        if url::Url::parse(&self.base_url).is_err() {
            return Err(RuntimeError::configuration(format!(
                "{}: invalid base_url '{}'",
                label, self.base_url
            )));
        }
        if self.model.trim().is_empty() {
            return Err(RuntimeError::configuration(format!(
                "{}: model must not be empty",
                label
            )));
        }
        if self.max_tokens == 0 {
            return Err(RuntimeError::configuration(format!(
                "{}: max_tokens must be positive",
                label
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(RuntimeError::configuration(format!(
                "{}: temperature {} out of range 0.0..=2.0",
                label, self.temperature
            )));
        }
        Ok(())
    }
}

/// Validate `params` and build a provider for them. Every provider speaks
/// the OpenAI chat wire format at `base_url`.
pub fn build_provider(params: &LlmParams, label: &str) -> Result<Arc<dyn LlmProvider>> {
    Ok(Arc::from(boxed_provider(params, label)?))
}

/// Like [`build_provider`], failing over to `fallbacks` in order when the
/// primary keeps returning retryable errors.
pub fn build_failover_provider(
    primary: &LlmParams,
    fallbacks: &[LlmParams],
    label: &str,
) -> Result<Arc<dyn LlmProvider>> {
    if fallbacks.is_empty() {
        return build_provider(primary, label);
    }
    let mut providers = vec![boxed_provider(primary, label)?];
    for (i, params) in fallbacks.iter().enumerate() {
        providers.push(boxed_provider(params, &format!("{}.fallbacks[{}]", label, i))?);
    }
    let router = ModelRouter::with_failover(providers)
        .map_err(|e| RuntimeError::configuration(format!("{}: {}", label, e)))?;
    Ok(Arc::new(router))
}

fn boxed_provider(params: &LlmParams, label: &str) -> Result<Box<dyn LlmProvider>> {
    params.validate(label)?;
    let provider = OpenAiProvider::from_params(params)
        .map_err(|e| RuntimeError::configuration(format!("{}: {:#}", label, e)))?;
    Ok(Box::new(provider))
}

/// Mask a secret for Debug output and logs.
/// Shows the first 3 and last 4 chars for keys longer than 7 chars, otherwise "***".
pub fn mask_secret(s: &str) -> String {
    if s.is_empty() {
        return "(empty)".to_string();
    }
    let chars: Vec<char> = s.chars().collect();
    if chars.len() > 7 {
        let prefix: String = chars[..3].iter().collect();
        let suffix: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", prefix, suffix)
    } else {
        "***".to_string()
    }
}
