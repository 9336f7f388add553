//! Agent routing: turn a channel's routing config into a decision

pub mod explicit;
pub mod llm;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::classifier::RankedCandidate;
use crate::error::{Result, RuntimeError};
use crate::types::{ChannelRoutingConfig, ConversationContext, RoutingMode};

pub use explicit::ExplicitAgentRoutingService;
pub use llm::LlmAgentRoutingService;

#[derive(Debug, Clone, PartialEq)]
pub enum RoutingDecision {
    Selected(String),
    /// Several agents remain plausible, highest confidence first
    NeedsDisambiguation(Vec<RankedCandidate>),
}

#[async_trait]
pub trait AgentRoutingService: Send + Sync {
    async fn route(&self, context: &ConversationContext, config: &ChannelRoutingConfig) -> Result<RoutingDecision>;
}

/// Dispatches on the channel's routing mode.
///
/// The LLM strategy is optional; channels configured for LLM routing fail
/// with a configuration error when the runtime was built without it.
pub struct ModeAgentRoutingService {
    explicit: ExplicitAgentRoutingService,
    llm: Option<Arc<dyn AgentRoutingService>>,
}

impl ModeAgentRoutingService {
    pub fn new(llm: Option<Arc<dyn AgentRoutingService>>) -> Self {
        Self {
            explicit: ExplicitAgentRoutingService,
            llm,
        }
    }

    pub fn explicit_only() -> Self {
        Self::new(None)
    }

    pub fn supports_llm(&self) -> bool {
        self.llm.is_some()
    }
}

#[async_trait]
impl AgentRoutingService for ModeAgentRoutingService {
    async fn route(&self, context: &ConversationContext, config: &ChannelRoutingConfig) -> Result<RoutingDecision> {
        debug!(
            "Routing conversation {} on channel '{}' in {} mode",
            context.conversation_id, config.channel_id, config.mode
        );
        match config.mode {
            RoutingMode::Explicit => self.explicit.route(context, config).await,
            RoutingMode::Llm => match &self.llm {
                Some(llm) => llm.route(context, config).await,
                None => Err(RuntimeError::configuration(format!(
                    "channel '{}' uses LLM routing but no LLM router is configured",
                    config.channel_id
                ))),
            },
        }
    }
}
