//! Persistence of session records.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use berth_types::{BerthError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::session::Session;

/// Durable storage for session records (checkpoints included).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &Session) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    async fn load_all(&self) -> Result<Vec<Session>>;
}

fn storage(err: sqlx::Error) -> BerthError {
    BerthError::Storage(err.to_string())
}

/// SQLite-backed store. One row per session plus one row per checkpoint.
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    /// Open (creating if needed) the database at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(storage)?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database, for tests and `--ephemeral` runs.
    pub async fn in_memory() -> Result<Self> {
        // A single connection, since every in-memory connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage)?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id          TEXT PRIMARY KEY,
                state       TEXT NOT NULL,
                record      TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                id          TEXT PRIMARY KEY,
                session_id  TEXT NOT NULL,
                record      TEXT NOT NULL,
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(storage)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints (session_id)")
            .execute(&pool)
            .await
            .map_err(storage)?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        // Checkpoints are stored in their own table; keep them out of the record.
        let mut record = session.clone();
        let checkpoints = std::mem::take(&mut record.checkpoints);
        let body = serde_json::to_string(&record)?;

        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query(
            r#"
            INSERT INTO sessions (id, state, record, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                record = excluded.record,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session.id)
        .bind(session.state.as_str())
        .bind(&body)
        .bind(session.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?")
            .bind(&session.id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        for checkpoint in &checkpoints {
            sqlx::query(
                "INSERT INTO checkpoints (id, session_id, record, created_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&checkpoint.id)
            .bind(&session.id)
            .bind(serde_json::to_string(checkpoint)?)
            .bind(checkpoint.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }

        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        sqlx::query("DELETE FROM checkpoints WHERE session_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Session>> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT record FROM sessions ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;

        let mut sessions = Vec::with_capacity(rows.len());
        for (body,) in rows {
            let mut session: Session = match serde_json::from_str(&body) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable session record");
                    continue;
                }
            };
            let checkpoints = sqlx::query_as::<_, (String,)>(
                "SELECT record FROM checkpoints WHERE session_id = ? ORDER BY created_at, id",
            )
            .bind(&session.id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
            session.checkpoints = checkpoints
                .into_iter()
                .filter_map(|(c,)| serde_json::from_str(&c).ok())
                .collect();
            sessions.push(session);
        }
        Ok(sessions)
    }
}

/// Non-durable store. Records vanish with the process.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Session>> {
        let mut all: Vec<Session> = self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }
}
