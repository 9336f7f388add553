use async_trait::async_trait;

use super::{AgentRoutingService, RoutingDecision};
use crate::error::{Result, RuntimeError};
use crate::types::{ChannelRoutingConfig, ConversationContext};

/// Static routing: always the first configured agent
#[derive(Debug, Clone, Copy, Default)]
pub struct ExplicitAgentRoutingService;

#[async_trait]
impl AgentRoutingService for ExplicitAgentRoutingService {
    async fn route(&self, _context: &ConversationContext, config: &ChannelRoutingConfig) -> Result<RoutingDecision> {
        config
            .agents
            .first()
            .map(|agent| RoutingDecision::Selected(agent.id.clone()))
            .ok_or_else(|| {
                RuntimeError::configuration(format!(
                    "channel '{}' has no agents configured",
                    config.channel_id
                ))
            })
    }
}
