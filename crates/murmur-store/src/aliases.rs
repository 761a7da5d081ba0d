//! Speaker alias persistence: strings that resolve to user ids.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use murmur_core::error::Result;
use murmur_core::types::{AliasType, SpeakerAlias};

#[derive(Clone)]
pub struct SpeakerAliasRepository {
    pool: SqlitePool,
}

impl SpeakerAliasRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn for_user(&self, user_id: u64) -> Result<Vec<SpeakerAlias>> {
        let rows = sqlx::query("SELECT * FROM speaker_aliases WHERE user_id = ?")
            .bind(user_id as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(alias_from_row).collect())
    }

    /// Case-insensitive alias lookup.
    pub async fn resolve(&self, alias: &str) -> Result<Option<u64>> {
        let row = sqlx::query(
            "SELECT user_id FROM speaker_aliases WHERE lower(alias) = lower(?) LIMIT 1",
        )
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>("user_id") as u64))
    }

    /// Full alias map for batch matching: lowercase alias -> user id.
    pub async fn alias_map(&self) -> Result<HashMap<String, u64>> {
        let rows = sqlx::query("SELECT alias, user_id FROM speaker_aliases")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|r| {
                (
                    r.get::<String, _>("alias").to_lowercase(),
                    r.get::<i64, _>("user_id") as u64,
                )
            })
            .collect())
    }

    /// Add an alias for a user. Adding an existing alias (any case) returns
    /// the existing row id.
    pub async fn add(
        &self,
        user_id: u64,
        alias: &str,
        alias_type: AliasType,
        confidence: f64,
        created_by: Option<u64>,
    ) -> Result<i64> {
        if let Some(existing) = self.find(user_id, alias).await? {
            debug!(user_id, alias, "Alias already present");
            return Ok(existing);
        }

        let result = sqlx::query(
            "INSERT INTO speaker_aliases (user_id, alias, alias_type, confidence, created_at, created_by)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id as i64)
        .bind(alias)
        .bind(alias_type.as_str())
        .bind(confidence)
        .bind(Utc::now())
        .bind(created_by.map(|u| u as i64))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // lost a race to another writer; the row is there now
            if let Some(existing) = self.find(user_id, alias).await? {
                return Ok(existing);
            }
        }

        info!(user_id, alias, alias_type = alias_type.as_str(), "Added speaker alias");
        Ok(result.last_insert_rowid())
    }

    pub async fn remove(&self, user_id: u64, alias: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM speaker_aliases WHERE user_id = ? AND lower(alias) = lower(?)",
        )
        .bind(user_id as i64)
        .bind(alias)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Seed username and display-name aliases the first time a user speaks.
    /// A user with any existing alias is left untouched.
    pub async fn auto_seed(
        &self,
        user_id: u64,
        username: &str,
        display_name: &str,
    ) -> Result<()> {
        let existing = sqlx::query("SELECT id FROM speaker_aliases WHERE user_id = ? LIMIT 1")
            .bind(user_id as i64)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Ok(());
        }

        if !username.is_empty() {
            self.add(user_id, username, AliasType::Username, 1.0, None)
                .await?;
        }
        if !display_name.is_empty() && !display_name.eq_ignore_ascii_case(username) {
            self.add(user_id, display_name, AliasType::DisplayName, 1.0, None)
                .await?;
        }

        info!(user_id, username, "Auto-seeded speaker aliases");
        Ok(())
    }

    async fn find(&self, user_id: u64, alias: &str) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT id FROM speaker_aliases WHERE user_id = ? AND lower(alias) = lower(?)",
        )
        .bind(user_id as i64)
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("id")))
    }
}

fn alias_from_row(row: &sqlx::sqlite::SqliteRow) -> SpeakerAlias {
    let alias_type: String = row.get("alias_type");
    SpeakerAlias {
        id: row.get("id"),
        user_id: row.get::<i64, _>("user_id") as u64,
        alias: row.get("alias"),
        alias_type: AliasType::parse(&alias_type).unwrap_or(AliasType::Nickname),
        confidence: row.get("confidence"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        created_by: row.get::<Option<i64>, _>("created_by").map(|u| u as u64),
    }
}
