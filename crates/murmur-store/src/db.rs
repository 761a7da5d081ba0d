//! SQLite pool setup and schema.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tracing::info;

use murmur_core::error::Result;

/// Open a connection pool for the given sqlx URL.
pub async fn open_pool(url: &str) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(url)
        .await?;
    Ok(pool)
}

/// In-memory database for tests. Single connection so all queries see the
/// same memory store.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id   TEXT PRIMARY KEY,
        channel_id   INTEGER NOT NULL,
        channel_name TEXT NOT NULL,
        guild_id     INTEGER NOT NULL,
        started_at   TEXT NOT NULL,
        ended_at     TEXT,
        status       TEXT NOT NULL DEFAULT 'active'
    )",
    "CREATE INDEX IF NOT EXISTS idx_sessions_channel ON sessions(channel_id)",
    "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status, channel_id)",
    "CREATE TABLE IF NOT EXISTS participants (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id   TEXT NOT NULL REFERENCES sessions(session_id),
        user_id      INTEGER NOT NULL,
        username     TEXT NOT NULL,
        display_name TEXT NOT NULL,
        joined_at    TEXT NOT NULL,
        left_at      TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id, session_id)",
    "CREATE TABLE IF NOT EXISTS utterances (
        id             INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id     TEXT NOT NULL REFERENCES sessions(session_id),
        user_id        INTEGER NOT NULL,
        username       TEXT NOT NULL,
        display_name   TEXT NOT NULL,
        text           TEXT NOT NULL,
        started_at     TEXT NOT NULL,
        ended_at       TEXT NOT NULL,
        confidence     REAL NOT NULL,
        audio_duration REAL NOT NULL,
        sequence_num   INTEGER NOT NULL,
        prosody        TEXT,
        UNIQUE(session_id, sequence_num)
    )",
    "CREATE INDEX IF NOT EXISTS idx_utterances_session_time ON utterances(session_id, started_at)",
    "CREATE INDEX IF NOT EXISTS idx_utterances_user_time ON utterances(user_id, started_at)",
    "CREATE TABLE IF NOT EXISTS messages (
        message_id          INTEGER PRIMARY KEY,
        channel_id          INTEGER NOT NULL,
        user_id             INTEGER NOT NULL,
        username            TEXT NOT NULL,
        display_name        TEXT NOT NULL,
        content             TEXT NOT NULL,
        timestamp           TEXT NOT NULL,
        session_id          TEXT,
        reply_to_message_id INTEGER
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_channel_time ON messages(channel_id, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_messages_user_time ON messages(user_id, timestamp)",
    "CREATE TABLE IF NOT EXISTS speaker_aliases (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id    INTEGER NOT NULL,
        alias      TEXT NOT NULL,
        alias_type TEXT NOT NULL,
        confidence REAL NOT NULL DEFAULT 1.0,
        created_at TEXT NOT NULL,
        created_by INTEGER
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_aliases_user_alias
        ON speaker_aliases(user_id, alias COLLATE NOCASE)",
    "CREATE TABLE IF NOT EXISTS enrichment_queue (
        id           TEXT PRIMARY KEY,
        target_type  TEXT NOT NULL,
        target_id    TEXT NOT NULL,
        task_type    TEXT NOT NULL,
        priority     INTEGER NOT NULL DEFAULT 2,
        status       TEXT NOT NULL DEFAULT 'pending',
        created_at   TEXT NOT NULL,
        started_at   TEXT,
        completed_at TEXT,
        attempts     INTEGER NOT NULL DEFAULT 0,
        error        TEXT,
        UNIQUE(target_type, target_id, task_type)
    )",
    "CREATE INDEX IF NOT EXISTS idx_queue_claim ON enrichment_queue(status, priority, created_at)",
];

/// Create every table and index. Safe to run on every startup.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("Relational schema ready");
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = open_memory_pool().await.unwrap();
    init_schema(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();
    }
}
