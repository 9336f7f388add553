//! SQLite-backed conversation state store

use async_trait::async_trait;
use chrono::Utc;
use parley_core::{ConversationState, ConversationStateStore, Result, RuntimeError};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SqliteStateStore {
    conn: Arc<Mutex<Connection>>,
}

fn storage_error(action: &str, e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::upstream(format!("conversation state {} failed: {}", action, e), false)
}

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| {
        warn!("State database mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

impl SqliteStateStore {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                RuntimeError::configuration(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path).map_err(|e| {
            RuntimeError::configuration(format!("cannot open state database {}: {}", path.display(), e))
        })?;
        info!("Conversation state database at {}", path.display());
        Self::init(conn)
    }

    /// Private database that vanishes with the store
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| RuntimeError::configuration(format!("cannot open in-memory database: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS conversation_state (
                conversation_id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                tenant_id TEXT NOT NULL,
                state_json TEXT NOT NULL,
                updated_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversation_state_updated
                ON conversation_state(updated_at_ms);",
        )
        .map_err(|e| RuntimeError::configuration(format!("cannot create state tables: {}", e)))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Number of stored conversations
    pub async fn len(&self) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.query_row("SELECT COUNT(*) FROM conversation_state", [], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as usize)
                .map_err(|e| storage_error("count", e))
        })
        .await
        .map_err(|e| storage_error("count", e))?
    }
}

#[async_trait]
impl ConversationStateStore for SqliteStateStore {
    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationState>> {
        let conn = Arc::clone(&self.conn);
        let id = conversation_id.to_owned();

        let json: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.query_row(
                "SELECT state_json FROM conversation_state WHERE conversation_id = ?1",
                params![&id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| storage_error("load", e))
        })
        .await
        .map_err(|e| storage_error("load", e))??;

        match json {
            Some(json) => match serde_json::from_str(&json) {
                Ok(state) => Ok(Some(state)),
                Err(e) => {
                    // Unreadable rows restart the conversation instead of wedging it
                    warn!("Discarding unreadable state for {}: {}", conversation_id, e);
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let json = serde_json::to_string(state).map_err(|e| storage_error("encode", e))?;
        let id = state.conversation_id.clone();
        let channel_id = state.channel_id.clone();
        let tenant_id = state.tenant_id.clone();
        let updated_at = state.updated_at.timestamp_millis();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.execute(
                "INSERT INTO conversation_state (conversation_id, channel_id, tenant_id, state_json, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                    channel_id = excluded.channel_id,
                    tenant_id = excluded.tenant_id,
                    state_json = excluded.state_json,
                    updated_at_ms = excluded.updated_at_ms",
                params![&id, &channel_id, &tenant_id, &json, updated_at],
            )
            .map_err(|e| storage_error("save", e))?;
            debug!("Saved state for conversation {}", id);
            Ok(())
        })
        .await
        .map_err(|e| storage_error("save", e))?
    }

    async fn remove(&self, conversation_id: &str) -> Result<()> {
        let conn = Arc::clone(&self.conn);
        let id = conversation_id.to_owned();
        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.execute("DELETE FROM conversation_state WHERE conversation_id = ?1", params![&id])
                .map(|_| ())
                .map_err(|e| storage_error("remove", e))
        })
        .await
        .map_err(|e| storage_error("remove", e))?
    }

    async fn purge_expired(&self, ttl: Duration) -> Result<usize> {
        let conn = Arc::clone(&self.conn);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let cutoff = Utc::now().timestamp_millis().saturating_sub(ttl_ms);

        let purged = tokio::task::spawn_blocking(move || {
            let conn = lock(&conn);
            conn.execute("DELETE FROM conversation_state WHERE updated_at_ms < ?1", params![cutoff])
                .map_err(|e| storage_error("purge", e))
        })
        .await
        .map_err(|e| storage_error("purge", e))??;

        if purged > 0 {
            info!("Purged {} expired conversations", purged);
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::{ConversationMessage, DisambiguationState, RankedCandidate};
    use tempfile::TempDir;

    fn pending_state(id: &str) -> ConversationState {
        let mut state = ConversationState::new(id, "c2", "acme");
        state.history.push(ConversationMessage::user("I have a question", Some("t1".to_string())));
        state.history.push(ConversationMessage::assistant("Buying or fixing?", None));
        state.record_turn("t1", 16);
        state.pending = Some(
            DisambiguationState::new(vec![
                RankedCandidate::new("sales", 0.5),
                RankedCandidate::new("support", 0.5),
            ])
            .next_round("Buying or fixing?".to_string(), vec![
                RankedCandidate::new("sales", 0.5),
                RankedCandidate::new("support", 0.5),
            ]),
        );
        state
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let store = SqliteStateStore::in_memory().unwrap();
        let state = pending_state("conv");
        store.save(&state).await.unwrap();

        let loaded = store.load("conv").await.unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.load("other").await.unwrap().is_none());

        store.remove("conv").await.unwrap();
        assert!(store.load("conv").await.unwrap().is_none());
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut state = pending_state("conv");
        store.save(&state).await.unwrap();

        state.pending = None;
        state.history.push(ConversationMessage::user("fixing", Some("t2".to_string())));
        store.save(&state).await.unwrap();

        let loaded = store.load("conv").await.unwrap().unwrap();
        assert!(loaded.pending.is_none());
        assert_eq!(loaded.history.len(), 3);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pending_clarification_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("parley.db");

        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.save(&pending_state("conv")).await.unwrap();
        }

        let reopened = SqliteStateStore::open(&path).unwrap();
        let state = reopened.load("conv").await.unwrap().unwrap();
        let pending = state.pending.as_ref().unwrap();
        assert_eq!(pending.round, 1);
        assert_eq!(pending.candidate_ids(), vec!["sales", "support"]);
        assert!(state.has_processed("t1"));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let store = SqliteStateStore::in_memory().unwrap();
        let mut old = pending_state("old");
        old.updated_at = Utc::now() - chrono::Duration::days(3);
        store.save(&old).await.unwrap();
        store.save(&pending_state("fresh")).await.unwrap();

        let purged = store.purge_expired(Duration::from_secs(24 * 3600)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.load("old").await.unwrap().is_none());
        assert!(store.load("fresh").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_corrupt_row_is_discarded() {
        let store = SqliteStateStore::in_memory().unwrap();
        {
            let conn = lock(&store.conn);
            conn.execute(
                "INSERT INTO conversation_state VALUES ('bad', 'c1', 'acme', '{oops', 0)",
                [],
            )
            .unwrap();
        }
        assert!(store.load("bad").await.unwrap().is_none());
    }
}
