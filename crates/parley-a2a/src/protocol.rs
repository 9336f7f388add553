//! A2A wire types

use chrono::{DateTime, Utc};
use parley_core::{ConversationContext, MessageRole};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub role: MessageRole,
    pub content: String,
}

/// Task submitted to an agent for one conversation turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// The user's current message
    pub prompt: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub channel_id: String,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<TaskMessage>,
}

impl From<&ConversationContext> for TaskRequest {
    fn from(context: &ConversationContext) -> Self {
        Self {
            prompt: context.user_turn.clone(),
            conversation_id: context.conversation_id.clone(),
            turn_id: context.turn_id.clone(),
            channel_id: context.channel_id.clone(),
            tenant_id: context.tenant_id.clone(),
            history: context
                .history
                .iter()
                .map(|m| TaskMessage {
                    role: m.role,
                    content: m.content.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Submitted,
    Working,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::ConversationMessage;

    #[test]
    fn test_request_from_context() {
        let context = ConversationContext {
            conversation_id: "conv".to_string(),
            channel_id: "web".to_string(),
            tenant_id: "acme".to_string(),
            turn_id: "t2".to_string(),
            history: vec![
                ConversationMessage::user("hi", Some("t1".to_string())),
                ConversationMessage::assistant("hello!", Some("support".to_string())),
            ],
            user_turn: "my router is broken".to_string(),
        };
        let request = TaskRequest::from(&context);
        assert_eq!(request.prompt, "my router is broken");
        assert_eq!(request.history.len(), 2);
        assert_eq!(request.history[1].role, MessageRole::Assistant);

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["history"][0]["role"], "user");
        assert_eq!(json["turn_id"], "t2");
    }

    #[test]
    fn test_status_wire_format() {
        let response: TaskResponse = serde_json::from_str(
            r#"{"task_id": "1", "status": "working", "created_at": "2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(response.status, TaskStatus::Working);
        assert!(!response.status.is_terminal());
        assert!(response.result.is_none());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert_eq!(TaskStatus::Completed.to_string(), "completed");
    }
}
