//! Utterance persistence. Rows are immutable once written.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use murmur_core::error::Result;
use murmur_core::types::{ProsodyFeatures, Utterance};

/// Input for a new utterance row; the repository allocates id and
/// sequence number.
#[derive(Debug, Clone)]
pub struct NewUtterance {
    pub session_id: String,
    pub user_id: u64,
    pub username: String,
    pub display_name: String,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub confidence: f64,
    pub audio_duration: f64,
    pub prosody: Option<ProsodyFeatures>,
}

/// Per-speaker aggregates for a session.
#[derive(Debug, Clone)]
pub struct SpeakerStats {
    pub user_id: u64,
    pub username: String,
    pub utterance_count: i64,
    pub total_speaking_time: f64,
    pub avg_confidence: f64,
}

#[derive(Clone)]
pub struct UtteranceRepository {
    pool: SqlitePool,
}

impl UtteranceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert an utterance, allocating the session-scoped sequence number
    /// inside the insert itself so concurrent writers cannot collide.
    pub async fn create(&self, new: NewUtterance) -> Result<Utterance> {
        let prosody_json = match &new.prosody {
            Some(p) => Some(serde_json::to_string(p)?),
            None => None,
        };

        let result = sqlx::query(
            "INSERT INTO utterances
                (session_id, user_id, username, display_name, text,
                 started_at, ended_at, confidence, audio_duration, prosody, sequence_num)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                 (SELECT COALESCE(MAX(sequence_num), 0) + 1
                    FROM utterances WHERE session_id = ?))",
        )
        .bind(&new.session_id)
        .bind(new.user_id as i64)
        .bind(&new.username)
        .bind(&new.display_name)
        .bind(&new.text)
        .bind(new.started_at)
        .bind(new.ended_at)
        .bind(new.confidence)
        .bind(new.audio_duration)
        .bind(prosody_json)
        .bind(&new.session_id)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        debug!(utterance_id = id, session_id = %new.session_id, user_id = new.user_id, "Persisted utterance");

        self.get(id)
            .await?
            .ok_or_else(|| murmur_core::error::MurmurError::Store(
                format!("utterance {id} vanished after insert"),
            ))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Utterance>> {
        let row = sqlx::query("SELECT * FROM utterances WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| utterance_from_row(&r)).transpose()
    }

    /// All utterances in a session, time-ordered.
    pub async fn by_session(&self, session_id: &str, limit: Option<i64>) -> Result<Vec<Utterance>> {
        let limit = limit.unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT * FROM utterances WHERE session_id = ? ORDER BY started_at LIMIT ?",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(utterance_from_row).collect()
    }

    /// Recent utterances by one user, newest first.
    pub async fn by_user(
        &self,
        user_id: u64,
        session_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Utterance>> {
        let rows = match session_id {
            Some(sid) => {
                sqlx::query(
                    "SELECT * FROM utterances WHERE user_id = ? AND session_id = ?
                     ORDER BY started_at DESC LIMIT ?",
                )
                .bind(user_id as i64)
                .bind(sid)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM utterances WHERE user_id = ?
                     ORDER BY started_at DESC LIMIT ?",
                )
                .bind(user_id as i64)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(utterance_from_row).collect()
    }

    /// Substring search over utterance text, newest first.
    pub async fn search(&self, text_query: &str, limit: i64) -> Result<Vec<Utterance>> {
        let pattern = format!("%{text_query}%");
        let rows = sqlx::query(
            "SELECT * FROM utterances WHERE text LIKE ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(utterance_from_row).collect()
    }

    pub async fn session_stats(&self, session_id: &str) -> Result<Vec<SpeakerStats>> {
        let rows = sqlx::query(
            "SELECT user_id, username,
                    COUNT(id) AS utterance_count,
                    SUM(audio_duration) AS total_speaking_time,
                    AVG(confidence) AS avg_confidence
             FROM utterances WHERE session_id = ?
             GROUP BY user_id, username",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| SpeakerStats {
                user_id: r.get::<i64, _>("user_id") as u64,
                username: r.get("username"),
                utterance_count: r.get("utterance_count"),
                total_speaking_time: r.get::<Option<f64>, _>("total_speaking_time").unwrap_or(0.0),
                avg_confidence: r.get::<Option<f64>, _>("avg_confidence").unwrap_or(0.0),
            })
            .collect())
    }
}

fn utterance_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Utterance> {
    let prosody = match row.get::<Option<String>, _>("prosody") {
        Some(json) => Some(serde_json::from_str::<ProsodyFeatures>(&json)?),
        None => None,
    };
    Ok(Utterance {
        id: row.get("id"),
        session_id: row.get("session_id"),
        user_id: row.get::<i64, _>("user_id") as u64,
        username: row.get("username"),
        display_name: row.get("display_name"),
        text: row.get("text"),
        started_at: row.get::<DateTime<Utc>, _>("started_at"),
        ended_at: row.get::<DateTime<Utc>, _>("ended_at"),
        confidence: row.get("confidence"),
        audio_duration: row.get("audio_duration"),
        sequence_num: row.get("sequence_num"),
        prosody,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::sessions::SessionRepository;

    async fn setup() -> (UtteranceRepository, String) {
        let pool = test_pool().await;
        let sessions = SessionRepository::new(pool.clone());
        let session_id = sessions.create(1, "general", 1).await.unwrap();
        (UtteranceRepository::new(pool), session_id)
    }

    fn new_utt(session_id: &str, user_id: u64, text: &str) -> NewUtterance {
        let now = Utc::now();
        NewUtterance {
            session_id: session_id.into(),
            user_id,
            username: format!("user{user_id}"),
            display_name: format!("User {user_id}"),
            text: text.into(),
            started_at: now,
            ended_at: now,
            confidence: 0.9,
            audio_duration: 2.0,
            prosody: None,
        }
    }

    #[tokio::test]
    async fn test_sequence_num_is_monotone_per_session() {
        let (repo, session) = setup().await;

        let a = repo.create(new_utt(&session, 7, "one")).await.unwrap();
        let b = repo.create(new_utt(&session, 8, "two")).await.unwrap();
        let c = repo.create(new_utt(&session, 7, "three")).await.unwrap();

        assert_eq!(a.sequence_num, 1);
        assert_eq!(b.sequence_num, 2);
        assert_eq!(c.sequence_num, 3);
    }

    #[tokio::test]
    async fn test_sequence_num_independent_across_sessions() {
        let pool = test_pool().await;
        let sessions = SessionRepository::new(pool.clone());
        let s1 = sessions.create(1, "a", 1).await.unwrap();
        let s2 = sessions.create(2, "b", 1).await.unwrap();
        let repo = UtteranceRepository::new(pool);

        repo.create(new_utt(&s1, 7, "x")).await.unwrap();
        let first_in_s2 = repo.create(new_utt(&s2, 7, "y")).await.unwrap();
        assert_eq!(first_in_s2.sequence_num, 1);
    }

    #[tokio::test]
    async fn test_prosody_round_trip() {
        let (repo, session) = setup().await;
        let mut new = new_utt(&session, 7, "hello");
        new.prosody = Some(ProsodyFeatures {
            final_pitch_slope: Some(7.5),
            hnr_db: Some(18.0),
            ..ProsodyFeatures::default()
        });

        let created = repo.create(new).await.unwrap();
        let loaded = repo.get(created.id).await.unwrap().unwrap();
        let prosody = loaded.prosody.unwrap();
        assert_eq!(prosody.final_pitch_slope, Some(7.5));
        assert_eq!(prosody.hnr_db, Some(18.0));
    }

    #[tokio::test]
    async fn test_by_session_and_search() {
        let (repo, session) = setup().await;
        repo.create(new_utt(&session, 7, "the quick brown fox"))
            .await
            .unwrap();
        repo.create(new_utt(&session, 8, "jumps over")).await.unwrap();

        assert_eq!(repo.by_session(&session, None).await.unwrap().len(), 2);
        let hits = repo.search("quick", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].user_id, 7);
    }

    #[tokio::test]
    async fn test_session_stats() {
        let (repo, session) = setup().await;
        repo.create(new_utt(&session, 7, "a")).await.unwrap();
        repo.create(new_utt(&session, 7, "b")).await.unwrap();
        repo.create(new_utt(&session, 8, "c")).await.unwrap();

        let mut stats = repo.session_stats(&session).await.unwrap();
        stats.sort_by_key(|s| s.user_id);
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].utterance_count, 2);
        assert!((stats[0].total_speaking_time - 4.0).abs() < 1e-9);
    }
}
