//! Text-chat message logging.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use murmur_core::error::Result;
use murmur_core::types::ChatMessage;

#[derive(Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a message. Re-logging the same platform message id is a no-op.
    pub async fn log(&self, message: &ChatMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO messages
                (message_id, channel_id, user_id, username, display_name,
                 content, timestamp, session_id, reply_to_message_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id) DO NOTHING",
        )
        .bind(message.message_id as i64)
        .bind(message.channel_id as i64)
        .bind(message.user_id as i64)
        .bind(&message.username)
        .bind(&message.display_name)
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(&message.session_id)
        .bind(message.reply_to_message_id.map(|m| m as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn by_session(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY timestamp",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }

    pub async fn by_channel(&self, channel_id: u64, limit: i64) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE channel_id = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(channel_id as i64)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(message_from_row).collect())
    }
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> ChatMessage {
    ChatMessage {
        message_id: row.get::<i64, _>("message_id") as u64,
        channel_id: row.get::<i64, _>("channel_id") as u64,
        user_id: row.get::<i64, _>("user_id") as u64,
        username: row.get("username"),
        display_name: row.get("display_name"),
        content: row.get("content"),
        timestamp: row.get::<DateTime<Utc>, _>("timestamp"),
        session_id: row.get("session_id"),
        reply_to_message_id: row
            .get::<Option<i64>, _>("reply_to_message_id")
            .map(|m| m as u64),
    }
}
