//! Keyed persistence of conversation state.
//!
//! [`SqliteSessionStore`] survives restarts. [`InMemorySessionStore`] lives
//! only as long as the process and is meant for single-process deployments
//! and tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use prodlens_core::error::{ProdLensError, Result};
use prodlens_core::types::{ConversationState, SessionId};

use crate::db::Database;

/// One row of [`SessionStore::list`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ConversationState> for SessionSummary {
    fn from(state: &ConversationState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            message_count: state.history.len(),
            created_at: state.created_at,
            updated_at: state.updated_at,
        }
    }
}

/// Get/replace conversation state by session id.
///
/// `save` replaces the whole state atomically: a concurrent `load` sees
/// either the previous state or the new one, never a mix.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &SessionId) -> Result<Option<ConversationState>>;

    async fn save(&self, state: &ConversationState) -> Result<()>;

    /// Returns whether a session was removed.
    async fn remove(&self, id: &SessionId) -> Result<bool>;

    /// All sessions, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionSummary>>;

    /// Remove sessions not updated since `cutoff`. Returns how many were removed.
    async fn evict_idle(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

// =============================================================================
// SQLite
// =============================================================================

/// Session store backed by the `sessions` table, state stored as JSON.
#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db: Arc<Database>,
}

impl SqliteSessionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| ProdLensError::Storage(format!("Session store task failed: {}", e)))?
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<ConversationState>> {
        let key = id.as_str().to_string();
        let json: Option<String> = self
            .blocking(move |db| {
                db.with_conn(|conn| {
                    conn.query_row(
                        "SELECT state FROM sessions WHERE session_id = ?1",
                        rusqlite::params![key],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(|e| ProdLensError::Storage(format!("Failed to load session: {}", e)))
                })
            })
            .await?;

        match json {
            Some(json) => {
                let state: ConversationState = serde_json::from_str(&json)?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let key = state.session_id.as_str().to_string();
        let message_count = state.history.len() as i64;
        let created_at = state.created_at.timestamp_millis();
        let updated_at = state.updated_at.timestamp_millis();

        self.blocking(move |db| {
            db.with_conn_mut(|conn| {
                let tx = conn
                    .transaction()
                    .map_err(|e| ProdLensError::Storage(e.to_string()))?;
                tx.execute(
                    "INSERT INTO sessions (session_id, state, message_count, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(session_id) DO UPDATE SET
                        state = excluded.state,
                        message_count = excluded.message_count,
                        updated_at = excluded.updated_at",
                    rusqlite::params![key, json, message_count, created_at, updated_at],
                )
                .map_err(|e| ProdLensError::Storage(format!("Failed to save session: {}", e)))?;
                tx.commit()
                    .map_err(|e| ProdLensError::Storage(e.to_string()))?;
                Ok(())
            })
        })
        .await?;

        debug!(session_id = %state.session_id, messages = state.history.len(), "Session saved");
        Ok(())
    }

    async fn remove(&self, id: &SessionId) -> Result<bool> {
        let key = id.as_str().to_string();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                let removed = conn
                    .execute(
                        "DELETE FROM sessions WHERE session_id = ?1",
                        rusqlite::params![key],
                    )
                    .map_err(|e| {
                        ProdLensError::Storage(format!("Failed to remove session: {}", e))
                    })?;
                Ok(removed > 0)
            })
        })
        .await
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        self.blocking(|db| {
            db.with_conn(|conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT session_id, message_count, created_at, updated_at
                         FROM sessions
                         ORDER BY updated_at DESC",
                    )
                    .map_err(|e| ProdLensError::Storage(e.to_string()))?;

                let rows = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, i64>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    })
                    .map_err(|e| ProdLensError::Storage(e.to_string()))?;

                let mut summaries = Vec::new();
                for row in rows {
                    let (id, count, created, updated) =
                        row.map_err(|e| ProdLensError::Storage(e.to_string()))?;
                    let session_id = SessionId::parse(&id).ok_or_else(|| {
                        ProdLensError::Storage(format!("Invalid session id in store: {:?}", id))
                    })?;
                    summaries.push(SessionSummary {
                        session_id,
                        message_count: count.max(0) as usize,
                        created_at: millis_to_datetime(created),
                        updated_at: millis_to_datetime(updated),
                    });
                }
                Ok(summaries)
            })
        })
        .await
    }

    async fn evict_idle(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = cutoff.timestamp_millis();
        self.blocking(move |db| {
            db.with_conn(|conn| {
                conn.execute(
                    "DELETE FROM sessions WHERE updated_at < ?1",
                    rusqlite::params![cutoff],
                )
                .map_err(|e| ProdLensError::Storage(format!("Failed to evict sessions: {}", e)))
            })
        })
        .await
    }
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local session store. State is lost on restart.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<SessionId, ConversationState>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Option<ConversationState>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(state.session_id.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, id: &SessionId) -> Result<bool> {
        Ok(self.sessions.write().await.remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let sessions = self.sessions.read().await;
        let mut summaries: Vec<SessionSummary> =
            sessions.values().map(SessionSummary::from).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }

    async fn evict_idle(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, state| state.updated_at >= cutoff);
        Ok(before - sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use prodlens_core::types::{HistoryEntry, Speaker, TabularResult};

    fn sample_state(id: &str) -> ConversationState {
        let mut state = ConversationState::new(SessionId::parse(id).unwrap());
        state.append_exchange(
            HistoryEntry::user("Show me gaming monitors under $500"),
            HistoryEntry::assistant("Here are three monitors."),
            0,
        );
        state.last_structured_result = Some(TabularResult {
            statement: "SELECT product_id, name FROM products".to_string(),
            columns: vec!["product_id".to_string(), "name".to_string()],
            rows: vec![vec![serde_json::json!(42), serde_json::json!("LG 27GN850-B")]],
        });
        state.last_entity_id = Some(42);
        state
    }

    fn stores() -> Vec<Box<dyn SessionStore>> {
        vec![
            Box::new(SqliteSessionStore::new(Arc::new(Database::in_memory().unwrap()))),
            Box::new(InMemorySessionStore::new()),
        ]
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        for store in stores() {
            let id = SessionId::parse("missing").unwrap();
            assert!(store.load(&id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        for store in stores() {
            let state = sample_state("s1");
            store.save(&state).await.unwrap();

            let loaded = store.load(&state.session_id).await.unwrap().unwrap();
            assert_eq!(loaded.history.len(), 2);
            assert_eq!(loaded.history[0].speaker, Speaker::User);
            assert_eq!(loaded.last_entity_id, Some(42));
            assert_eq!(
                loaded.last_structured_result.unwrap().rows[0][1],
                serde_json::json!("LG 27GN850-B")
            );
        }
    }

    #[tokio::test]
    async fn test_save_replaces_whole_state() {
        for store in stores() {
            let mut state = sample_state("s1");
            store.save(&state).await.unwrap();

            state.last_entity_id = None;
            state.append_exchange(HistoryEntry::user("q2"), HistoryEntry::assistant("a2"), 0);
            store.save(&state).await.unwrap();

            let loaded = store.load(&state.session_id).await.unwrap().unwrap();
            assert_eq!(loaded.history.len(), 4);
            assert!(loaded.last_entity_id.is_none());
            assert_eq!(store.list().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_remove() {
        for store in stores() {
            let state = sample_state("s1");
            store.save(&state).await.unwrap();
            assert!(store.remove(&state.session_id).await.unwrap());
            assert!(!store.remove(&state.session_id).await.unwrap());
            assert!(store.load(&state.session_id).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_list_most_recent_first() {
        for store in stores() {
            let mut older = sample_state("older");
            older.updated_at = Utc::now() - Duration::minutes(10);
            let newer = sample_state("newer");
            store.save(&older).await.unwrap();
            store.save(&newer).await.unwrap();

            let list = store.list().await.unwrap();
            assert_eq!(list.len(), 2);
            assert_eq!(list[0].session_id.as_str(), "newer");
            assert_eq!(list[1].message_count, 2);
        }
    }

    #[tokio::test]
    async fn test_evict_idle() {
        for store in stores() {
            let mut stale = sample_state("stale");
            stale.updated_at = Utc::now() - Duration::hours(2);
            let fresh = sample_state("fresh");
            store.save(&stale).await.unwrap();
            store.save(&fresh).await.unwrap();

            let removed = store
                .evict_idle(Utc::now() - Duration::hours(1))
                .await
                .unwrap();
            assert_eq!(removed, 1);
            assert!(store.load(&stale.session_id).await.unwrap().is_none());
            assert!(store.load(&fresh.session_id).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let state = sample_state("durable");
        {
            let store = SqliteSessionStore::new(Arc::new(Database::new(&path).unwrap()));
            store.save(&state).await.unwrap();
        }
        let store = SqliteSessionStore::new(Arc::new(Database::new(&path).unwrap()));
        let loaded = store.load(&state.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.history, state.history);
    }

    #[tokio::test]
    async fn test_sqlite_corrupt_state_is_serialization_error() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (session_id, state, created_at, updated_at)
                 VALUES ('bad', 'not json', 0, 0)",
                [],
            )
            .map_err(|e| ProdLensError::Storage(e.to_string()))?;
            Ok(())
        })
        .unwrap();
        let store = SqliteSessionStore::new(db);
        let err = store
            .load(&SessionId::parse("bad").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ProdLensError::Serialization(_)));
    }
}
