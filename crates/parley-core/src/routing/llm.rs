use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::{AgentRoutingService, RoutingDecision};
use crate::classifier::AgentClassifierService;
use crate::error::{Result, RuntimeError};
use crate::retry::{RetryPolicy, retry_transient};
use crate::types::{ChannelRoutingConfig, ConversationContext};

/// Classifier-driven routing over every agent of the channel
pub struct LlmAgentRoutingService {
    classifier: Arc<dyn AgentClassifierService>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for LlmAgentRoutingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmAgentRoutingService")
            .field("classifier", &self.classifier.name())
            .field("retry", &self.retry)
            .finish()
    }
}

impl LlmAgentRoutingService {
    /// Fails when no LLM credential is configured
    pub fn new(classifier: Arc<dyn AgentClassifierService>, api_key: &str) -> Result<Self> {
        if api_key.trim().is_empty() {
            return Err(RuntimeError::configuration(
                "LLM routing requires an LLM api_key",
            ));
        }
        Ok(Self::with_classifier(classifier))
    }

    /// Build around a classifier that needs no credential (e.g. keywords)
    pub fn with_classifier(classifier: Arc<dyn AgentClassifierService>) -> Self {
        Self {
            classifier,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl AgentRoutingService for LlmAgentRoutingService {
    async fn route(&self, context: &ConversationContext, config: &ChannelRoutingConfig) -> Result<RoutingDecision> {
        if config.agents.is_empty() {
            return Err(RuntimeError::configuration(format!(
                "channel '{}' has no agents configured",
                config.channel_id
            )));
        }

        let result = retry_transient(self.retry, "agent classification", || {
            self.classifier.classify(context, &config.agents)
        })
        .await?;

        match result.selected {
            Some(agent_id) => Ok(RoutingDecision::Selected(agent_id)),
            None => {
                debug!(
                    "Classifier '{}' left {} candidates for conversation {}",
                    self.classifier.name(),
                    result.candidates.len(),
                    context.conversation_id
                );
                Ok(RoutingDecision::NeedsDisambiguation(result.candidates))
            }
        }
    }
}
