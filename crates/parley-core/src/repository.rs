//! Collaborator seams: where channels, routing configs and agents come from
//!
//! The pipeline only depends on these traits. Concrete backends live in
//! `parley-channels` (static, file and API repositories) and `parley-a2a`
//! (HTTP agent client); callers may inject their own.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{AgentDescriptor, AgentResponse, Channel, ChannelRoutingConfig, ConversationContext};

/// Resolves a channel id to channel metadata
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// `Ok(None)` when the channel is unknown; `Err` only when the backend
    /// itself could not answer.
    async fn lookup(&self, channel_id: &str) -> Result<Option<Channel>>;
}

/// Resolves a channel id to its routing configuration
#[async_trait]
pub trait ChannelRoutingRepository: Send + Sync {
    /// Short backend label for logs (e.g. "file", "api")
    fn backend(&self) -> &str;

    /// `Ok(None)` when no routing is defined for the channel
    async fn lookup(&self, channel_id: &str) -> Result<Option<ChannelRoutingConfig>>;
}

/// Delivers a conversation turn to an agent
#[async_trait]
pub trait AgentClientService: Send + Sync {
    async fn send(&self, agent: &AgentDescriptor, context: &ConversationContext) -> Result<AgentResponse>;
}
