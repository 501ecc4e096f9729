//! SQLite-backed [`SessionStore`].
//!
//! One row per session id. Visited agents, system vars and the pending
//! handoff are stored as JSON text; writes are upserts, so repeating a save
//! leaves the row unchanged.
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use tower_voice::sessions::{SessionStore, SqliteSessionStore};
//!
//! # #[tokio::main]
//! # async fn main() -> tower_voice::Result<()> {
//! let store = SqliteSessionStore::new("voice_sessions.db").await?;
//! store
//!     .save("call-42", "Concierge", &BTreeSet::from(["Concierge".to_string()]), &Default::default())
//!     .await?;
//! let snapshot = store.load("call-42").await?.expect("saved above");
//! assert_eq!(snapshot.active_agent.as_deref(), Some("Concierge"));
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};

use super::{PendingHandoff, SessionSnapshot, SessionStore};
use crate::error::Result;

pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

impl SqliteSessionStore {
    /// Opens (creating if needed) the database file at `db_path`.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database, useful for testing.
    pub async fn new_in_memory() -> Result<Self> {
        // Every connection to `:memory:` is a separate database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Uses an existing pool, creating the table if missing.
    pub async fn from_pool(pool: Pool<Sqlite>) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS voice_sessions (
                session_id TEXT PRIMARY KEY NOT NULL,
                active_agent TEXT,
                visited_agents TEXT NOT NULL DEFAULT '[]',
                system_vars TEXT NOT NULL DEFAULT '{}',
                pending_handoff TEXT,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT active_agent, visited_agents, system_vars, pending_handoff
            FROM voice_sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let visited: String = row.try_get("visited_agents")?;
        let vars: String = row.try_get("system_vars")?;
        let pending: Option<String> = row.try_get("pending_handoff")?;
        Ok(Some(SessionSnapshot {
            active_agent: row.try_get("active_agent")?,
            visited_agents: serde_json::from_str(&visited)?,
            system_vars: serde_json::from_str(&vars)?,
            pending_handoff: pending.as_deref().map(serde_json::from_str).transpose()?,
        }))
    }

    async fn save(
        &self,
        session_id: &str,
        active_agent: &str,
        visited_agents: &BTreeSet<String>,
        system_vars: &Map<String, Value>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO voice_sessions (session_id, active_agent, visited_agents, system_vars, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                active_agent = excluded.active_agent,
                visited_agents = excluded.visited_agents,
                system_vars = excluded.system_vars,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(active_agent)
        .bind(serde_json::to_string(visited_agents)?)
        .bind(serde_json::to_string(system_vars)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_pending_handoff(&self, session_id: &str, pending: PendingHandoff) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO voice_sessions (session_id, pending_handoff, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                pending_handoff = excluded.pending_handoff,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(session_id)
        .bind(serde_json::to_string(&pending)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_pending_handoff(&self, session_id: &str) -> Result<()> {
        sqlx::query("UPDATE voice_sessions SET pending_handoff = NULL WHERE session_id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}
