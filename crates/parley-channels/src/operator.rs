//! Operator-fed channel repository
//!
//! Seeded from configuration at startup; an operator (or a watcher on a
//! control plane) can add and remove channels while the runtime serves.

use async_trait::async_trait;
use parley_core::{Channel, ChannelRepository, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Default, Clone)]
pub struct OperatorChannelRepository {
    channels: Arc<RwLock<HashMap<String, Channel>>>,
}

impl OperatorChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later entries win when ids repeat
    pub fn from_channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        let map: HashMap<String, Channel> = channels.into_iter().map(|c| (c.id.clone(), c)).collect();
        info!("Operator channel repository seeded with {} channels", map.len());
        Self {
            channels: Arc::new(RwLock::new(map)),
        }
    }

    /// Insert or replace a channel; returns the previous definition
    pub async fn upsert(&self, channel: Channel) -> Option<Channel> {
        debug!("Upserting channel '{}' for tenant '{}'", channel.id, channel.tenant_id);
        self.channels.write().await.insert(channel.id.clone(), channel)
    }

    pub async fn remove(&self, channel_id: &str) -> Option<Channel> {
        let removed = self.channels.write().await.remove(channel_id);
        if removed.is_some() {
            debug!("Removed channel '{}'", channel_id);
        }
        removed
    }

    /// All channels, sorted by id
    pub async fn list(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self.channels.read().await.values().cloned().collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        channels
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.channels.read().await.is_empty()
    }
}

#[async_trait]
impl ChannelRepository for OperatorChannelRepository {
    async fn lookup(&self, channel_id: &str) -> Result<Option<Channel>> {
        Ok(self.channels.read().await.get(channel_id).cloned())
    }
}
