use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kora_shared::{KoraId, Session, SessionMode, SessionStatus, SessionStore, SessionSummary};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::types::Json;
use sqlx::SqlitePool;
use tokio::time::{timeout, Duration};
use tracing::info;

// Every query is bounded so a locked database cannot stall a session.
const DB_TIMEOUT_SECS: u64 = 10;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        title TEXT NOT NULL,
        status TEXT NOT NULL,
        mode TEXT NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0,
        body TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_activity TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_user_activity ON sessions (user_id, last_activity DESC)",
];

/// Creates the schema. Safe to run on every start.
pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    info!("Initializing session schema...");
    for statement in SCHEMA {
        timeout(Duration::from_secs(DB_TIMEOUT_SECS), sqlx::query(statement).execute(pool))
            .await
            .map_err(|_| anyhow::anyhow!("Schema setup timed out after {}s", DB_TIMEOUT_SECS))?
            .map_err(|e| anyhow::anyhow!("Schema setup failed: {}", e))?;
    }
    Ok(())
}

/// Serde name of a unit enum variant, e.g. `SessionStatus::Active` -> `"active"`.
fn variant_name<T: Serialize>(value: &T) -> anyhow::Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(anyhow::anyhow!("expected a string variant, got {}", other)),
    }
}

fn parse_variant<T: DeserializeOwned>(raw: &str) -> anyhow::Result<T> {
    Ok(serde_json::from_value(serde_json::Value::String(raw.to_string()))?)
}

type SummaryRow = (String, String, String, String, String, i64, DateTime<Utc>, DateTime<Utc>);

/// Durable session storage backed by SQLite. The full session is kept as a
/// JSON document; summary columns are duplicated for listing.
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        let query_future = sqlx::query(
            "INSERT INTO sessions (id, user_id, title, status, mode, message_count, body, created_at, updated_at, last_activity)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                status = excluded.status,
                mode = excluded.mode,
                message_count = excluded.message_count,
                body = excluded.body,
                updated_at = excluded.updated_at,
                last_activity = excluded.last_activity",
        )
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(&session.title)
        .bind(variant_name(&session.status)?)
        .bind(variant_name(&session.mode)?)
        .bind(i64::try_from(session.stats.message_count).unwrap_or(i64::MAX))
        .bind(Json(session))
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.last_activity)
        .execute(&self.pool);

        timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS))?
            .map_err(|e| anyhow::anyhow!("Failed to save session {}: {}", session.id, e))?;
        Ok(())
    }

    async fn load(&self, id: KoraId) -> anyhow::Result<Option<Session>> {
        let query_future = sqlx::query_as::<_, (Json<Session>,)>("SELECT body FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool);

        let row = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS))?
            .map_err(|e| anyhow::anyhow!("Failed to load session {}: {}", id, e))?;
        Ok(row.map(|(Json(session),)| session))
    }

    async fn delete(&self, id: KoraId) -> anyhow::Result<()> {
        let query_future = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool);

        timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS))?
            .map_err(|e| anyhow::anyhow!("Failed to delete session {}: {}", id, e))?;
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<SessionSummary>> {
        let query_future = sqlx::query_as::<_, SummaryRow>(
            "SELECT id, user_id, title, status, mode, message_count, updated_at, last_activity
             FROM sessions WHERE user_id = ? ORDER BY last_activity DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool);

        let rows = timeout(Duration::from_secs(DB_TIMEOUT_SECS), query_future)
            .await
            .map_err(|_| anyhow::anyhow!("Database operation timed out after {}s", DB_TIMEOUT_SECS))?
            .map_err(|e| anyhow::anyhow!("Failed to list sessions for '{}': {}", user_id, e))?;

        rows.into_iter()
            .map(|(id, user_id, title, status, mode, message_count, updated_at, last_activity)| {
                Ok(SessionSummary {
                    id: id.parse().map_err(|e| anyhow::anyhow!("Corrupt session id '{}': {}", id, e))?,
                    user_id,
                    title,
                    status: parse_variant::<SessionStatus>(&status)?,
                    mode: parse_variant::<SessionMode>(&mode)?,
                    message_count: u64::try_from(message_count).unwrap_or(0),
                    updated_at,
                    last_activity,
                })
            })
            .collect()
    }
}

/// Process-local store for tests and embedding.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<KoraId, Session>,
}

impl MemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        self.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn load(&self, id: KoraId) -> anyhow::Result<Option<Session>> {
        Ok(self.sessions.get(&id).map(|s| s.value().clone()))
    }

    async fn delete(&self, id: KoraId) -> anyhow::Result<()> {
        self.sessions.remove(&id);
        Ok(())
    }

    async fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .filter(|s| s.is_owned_by(user_id))
            .map(|s| s.summary())
            .collect();
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(summaries)
    }
}
