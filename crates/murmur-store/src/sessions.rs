//! Session and participant persistence.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use murmur_core::error::Result;
use murmur_core::types::{Participant, SessionRecord, SessionStatus};

#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a new active session, returning its id.
    pub async fn create(
        &self,
        channel_id: u64,
        channel_name: &str,
        guild_id: u64,
    ) -> Result<String> {
        let session_id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO sessions (session_id, channel_id, channel_name, guild_id, started_at, status)
             VALUES (?, ?, ?, ?, ?, 'active')",
        )
        .bind(&session_id)
        .bind(channel_id as i64)
        .bind(channel_name)
        .bind(guild_id as i64)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(session_id = %session_id, channel_id, "Created session");
        Ok(session_id)
    }

    /// Mark a session ended (or abandoned) now.
    pub async fn end(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        sqlx::query("UPDATE sessions SET ended_at = ?, status = ? WHERE session_id = ?")
            .bind(Utc::now())
            .bind(status.as_str())
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Active session id for a channel, if any.
    pub async fn active_session(&self, channel_id: u64) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT session_id FROM sessions WHERE channel_id = ? AND status = 'active'",
        )
        .bind(channel_id as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<String, _>("session_id")))
    }

    pub async fn add_participant(
        &self,
        session_id: &str,
        user_id: u64,
        username: &str,
        display_name: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO participants (session_id, user_id, username, display_name, joined_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(user_id as i64)
        .bind(username)
        .bind(display_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set `left_at` on the participant's open row. Rows are never deleted.
    pub async fn remove_participant(&self, session_id: &str, user_id: u64) -> Result<()> {
        sqlx::query(
            "UPDATE participants SET left_at = ?
             WHERE session_id = ? AND user_id = ? AND left_at IS NULL",
        )
        .bind(Utc::now())
        .bind(session_id)
        .bind(user_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Load a session with its participant roster.
    pub async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let participants = self.participants(session_id).await?;
        Ok(Some(record_from_row(&row, participants)))
    }

    pub async fn active_sessions(&self) -> Result<Vec<SessionRecord>> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let session_id: String = row.get("session_id");
            let participants = self.participants(&session_id).await?;
            out.push(record_from_row(&row, participants));
        }
        Ok(out)
    }

    async fn participants(&self, session_id: &str) -> Result<Vec<Participant>> {
        let rows = sqlx::query(
            "SELECT user_id, username, display_name, joined_at, left_at
             FROM participants WHERE session_id = ? ORDER BY joined_at",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Participant {
                user_id: r.get::<i64, _>("user_id") as u64,
                username: r.get("username"),
                display_name: r.get("display_name"),
                joined_at: r.get("joined_at"),
                left_at: r.get("left_at"),
            })
            .collect())
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow, participants: Vec<Participant>) -> SessionRecord {
    let status: String = row.get("status");
    SessionRecord {
        session_id: row.get("session_id"),
        channel_id: row.get::<i64, _>("channel_id") as u64,
        channel_name: row.get("channel_name"),
        guild_id: row.get::<i64, _>("guild_id") as u64,
        started_at: row.get::<DateTime<Utc>, _>("started_at"),
        ended_at: row.get("ended_at"),
        status: SessionStatus::parse(&status).unwrap_or(SessionStatus::Ended),
        participants,
    }
}
