//! Shared types for parley-core

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// An inbound conversation surface (chat widget, phone line, ...) owned by a tenant
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Channel {
    pub id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Channel {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            display_name: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// How a channel picks its agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoutingMode {
    Explicit,
    Llm,
}

impl RoutingMode {
    pub fn from_string(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "explicit" => Some(Self::Explicit),
            "llm" => Some(Self::Llm),
            _ => None,
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Explicit => write!(f, "EXPLICIT"),
            Self::Llm => write!(f, "LLM"),
        }
    }
}

/// An agent that can serve a channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub endpoint: String,
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: String::new(),
            capabilities: Vec::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Routing configuration for one channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelRoutingConfig {
    pub channel_id: String,
    pub mode: RoutingMode,
    /// Candidate agents in configured order
    pub agents: Vec<AgentDescriptor>,
}

impl ChannelRoutingConfig {
    pub fn new(channel_id: impl Into<String>, mode: RoutingMode, agents: Vec<AgentDescriptor>) -> Self {
        Self {
            channel_id: channel_id.into(),
            mode,
            agents,
        }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentDescriptor> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    /// Descriptors for the given ids, in the order given, skipping unknown ids
    pub fn candidates<'a, I>(&self, ids: I) -> Vec<AgentDescriptor>
    where
        I: IntoIterator<Item = &'a str>,
    {
        ids.into_iter()
            .filter_map(|id| self.agent(id).cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// A single message in a conversation's history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub turn_id: Option<String>,
    /// Agent that produced an assistant message; `None` for runtime-authored messages
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>, turn_id: Option<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            turn_id,
            agent_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>, agent_id: Option<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            turn_id: None,
            agent_id,
            timestamp: Utc::now(),
        }
    }
}

/// One inbound user turn, as received from a transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundTurn {
    pub conversation_id: String,
    pub turn_id: String,
    pub channel_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub message: String,
    /// Caller-supplied budget for the whole turn
    #[serde(skip)]
    pub deadline: Option<Duration>,
}

impl InboundTurn {
    pub fn new(
        conversation_id: impl Into<String>,
        channel_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            turn_id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            tenant_id: None,
            message: message.into(),
            deadline: None,
        }
    }

    pub fn with_turn_id(mut self, turn_id: impl Into<String>) -> Self {
        self.turn_id = turn_id.into();
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Everything the classifier, disambiguation and agent see about a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationContext {
    pub conversation_id: String,
    pub channel_id: String,
    pub tenant_id: String,
    pub turn_id: String,
    /// Prior messages, oldest first, excluding the current user turn
    pub history: Vec<ConversationMessage>,
    pub user_turn: String,
}

impl ConversationContext {
    /// Render the most recent `limit` history messages plus the current turn
    /// as plain text for prompts.
    pub fn transcript(&self, limit: usize) -> String {
        let skip = self.history.len().saturating_sub(limit);
        let mut lines: Vec<String> = self
            .history
            .iter()
            .skip(skip)
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect();
        lines.push(format!("user: {}", self.user_turn));
        lines.join("\n")
    }

    /// All user-authored text in the conversation, current turn included
    pub fn user_text(&self) -> String {
        self.history
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .map(|m| m.content.as_str())
            .chain(std::iter::once(self.user_turn.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What an agent returned for a dispatched turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    pub agent_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ConversationContext {
        ConversationContext {
            conversation_id: "conv-1".to_string(),
            channel_id: "web".to_string(),
            tenant_id: "acme".to_string(),
            turn_id: "t3".to_string(),
            history: vec![
                ConversationMessage::user("hi", Some("t1".to_string())),
                ConversationMessage::assistant("how can I help?", None),
                ConversationMessage::user("my invoice is wrong", Some("t2".to_string())),
            ],
            user_turn: "it was charged twice".to_string(),
        }
    }

    #[test]
    fn test_routing_mode_parse() {
        assert_eq!(RoutingMode::from_string("explicit"), Some(RoutingMode::Explicit));
        assert_eq!(RoutingMode::from_string(" LLM "), Some(RoutingMode::Llm));
        assert_eq!(RoutingMode::from_string("random"), None);
        assert_eq!(RoutingMode::Llm.to_string(), "LLM");
    }

    #[test]
    fn test_routing_mode_serde_uppercase() {
        let json = serde_json::to_string(&RoutingMode::Explicit).unwrap();
        assert_eq!(json, "\"EXPLICIT\"");
        let mode: RoutingMode = serde_json::from_str("\"LLM\"").unwrap();
        assert_eq!(mode, RoutingMode::Llm);
    }

    #[test]
    fn test_candidates_keep_requested_order() {
        let config = ChannelRoutingConfig::new(
            "web",
            RoutingMode::Llm,
            vec![
                AgentDescriptor::new("sales", "http://sales"),
                AgentDescriptor::new("support", "http://support"),
            ],
        );
        let picked = config.candidates(["support", "ghost", "sales"]);
        let ids: Vec<&str> = picked.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["support", "sales"]);
        assert!(config.agent("ghost").is_none());
    }

    #[test]
    fn test_transcript_limits_history() {
        let ctx = context();
        let full = ctx.transcript(10);
        assert!(full.starts_with("user: hi"));
        assert!(full.ends_with("user: it was charged twice"));

        let short = ctx.transcript(1);
        assert_eq!(short, "user: my invoice is wrong\nuser: it was charged twice");
    }

    #[test]
    fn test_user_text_skips_assistant() {
        let text = context().user_text();
        assert!(text.contains("invoice"));
        assert!(!text.contains("how can I help"));
    }

    #[test]
    fn test_inbound_turn_builder() {
        let turn = InboundTurn::new("conv", "web", "hello")
            .with_turn_id("t-1")
            .with_tenant("acme")
            .with_deadline(Duration::from_secs(5));
        assert_eq!(turn.turn_id, "t-1");
        assert_eq!(turn.tenant_id.as_deref(), Some("acme"));
        assert_eq!(turn.deadline, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_agent_display_name() {
        let mut agent = AgentDescriptor::new("billing", "http://billing");
        assert_eq!(agent.display_name(), "billing");
        agent.name = Some("Billing Desk".to_string());
        assert_eq!(agent.display_name(), "Billing Desk");
    }
}
