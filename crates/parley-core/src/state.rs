//! Per-conversation state that outlives a single turn

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::disambiguation::DisambiguationState;
use crate::error::Result;
use crate::types::ConversationMessage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub conversation_id: String,
    pub channel_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub history: Vec<ConversationMessage>,
    /// Recently processed turn ids, oldest first
    #[serde(default)]
    pub processed_turns: VecDeque<String>,
    /// Set while a clarification question awaits the user's answer
    #[serde(default)]
    pub pending: Option<DisambiguationState>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(conversation_id: &str, channel_id: &str, tenant_id: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            channel_id: channel_id.to_string(),
            tenant_id: tenant_id.to_string(),
            history: Vec::new(),
            processed_turns: VecDeque::new(),
            pending: None,
            updated_at: Utc::now(),
        }
    }

    pub fn has_processed(&self, turn_id: &str) -> bool {
        self.processed_turns.iter().any(|t| t == turn_id)
    }

    /// Remember `turn_id`, keeping at most `window` ids
    pub fn record_turn(&mut self, turn_id: &str, window: usize) {
        if self.has_processed(turn_id) {
            return;
        }
        self.processed_turns.push_back(turn_id.to_string());
        while self.processed_turns.len() > window.max(1) {
            self.processed_turns.pop_front();
        }
    }

    /// Keep only the newest `limit` messages
    pub fn trim_history(&mut self, limit: usize) {
        let excess = self.history.len().saturating_sub(limit);
        if excess > 0 {
            self.history.drain(..excess);
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        now.signed_duration_since(self.updated_at) > ttl
    }
}

/// Where conversation state lives between turns.
///
/// Failures surface as `UpstreamError`; the pipeline never proceeds on a
/// state it could not read or persist.
#[async_trait]
pub trait ConversationStateStore: Send + Sync {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>>;

    async fn save(&self, state: &ConversationState) -> Result<()>;

    async fn remove(&self, conversation_id: &str) -> Result<()>;

    /// Drop conversations idle for longer than `ttl`; returns how many
    async fn purge_expired(&self, ttl: Duration) -> Result<usize>;
}

/// Process-local store; state is lost on restart
#[derive(Debug, Default, Clone)]
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<String, ConversationState>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }
}

#[async_trait]
impl ConversationStateStore for InMemoryStateStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        Ok(self.states.read().await.get(conversation_id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        self.states
            .write()
            .await
            .insert(state.conversation_id.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, conversation_id: &str) -> Result<()> {
        self.states.write().await.remove(conversation_id);
        Ok(())
    }

    async fn purge_expired(&self, ttl: Duration) -> Result<usize> {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let before = states.len();
        states.retain(|_, s| !s.is_expired(ttl, now));
        let purged = before - states.len();
        if purged > 0 {
            debug!("Purged {} expired conversations", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::RankedCandidate;

    #[test]
    fn test_record_turn_window() {
        let mut state = ConversationState::new("conv", "web", "acme");
        for id in ["t1", "t2", "t3", "t2"] {
            state.record_turn(id, 2);
        }
        assert!(!state.has_processed("t1"));
        assert!(state.has_processed("t2"));
        assert!(state.has_processed("t3"));
        assert_eq!(state.processed_turns.len(), 2);
    }

    #[test]
    fn test_trim_history_keeps_newest() {
        let mut state = ConversationState::new("conv", "web", "acme");
        for i in 0..5 {
            state.history.push(ConversationMessage::user(format!("m{}", i), None));
        }
        state.trim_history(2);
        let contents: Vec<&str> = state.history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[test]
    fn test_is_expired() {
        let mut state = ConversationState::new("conv", "web", "acme");
        state.updated_at = Utc::now() - chrono::Duration::hours(2);
        assert!(state.is_expired(Duration::from_secs(3600), Utc::now()));
        assert!(!state.is_expired(Duration::from_secs(3 * 3600), Utc::now()));
    }

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryStateStore::new();
        let mut state = ConversationState::new("conv", "web", "acme");
        state.pending = Some(DisambiguationState::new(vec![RankedCandidate::new("sales", 0.5)]));
        store.save(&state).await.unwrap();

        let loaded = store.load("conv").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.load("other").await.unwrap().is_none());

        store.remove("conv").await.unwrap();
        assert!(store.load("conv").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = InMemoryStateStore::new();
        let mut old = ConversationState::new("old", "web", "acme");
        old.updated_at = Utc::now() - chrono::Duration::days(2);
        store.save(&old).await.unwrap();
        store.save(&ConversationState::new("new", "web", "acme")).await.unwrap();

        let purged = store.purge_expired(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.len().await, 1);
    }
}
