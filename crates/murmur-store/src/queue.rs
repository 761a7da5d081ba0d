//! Durable, priority-ordered enrichment task queue.
//!
//! The conditional update in [`EnrichmentQueueRepository::claim`] is the
//! only synchronisation primitive between workers: for any task id, at
//! most one claim ever returns `true` while the row is pending.

use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use murmur_core::error::{MurmurError, Result};
use murmur_core::types::{EnrichmentTask, TargetType, TaskStatus};

#[derive(Clone)]
pub struct EnrichmentQueueRepository {
    pool: SqlitePool,
}

impl EnrichmentQueueRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Enqueue a task. Idempotent on `(target_type, target_id, task_type)`:
    /// if the triple exists in any state, the existing row's id is returned
    /// and nothing is modified.
    pub async fn enqueue(
        &self,
        target_type: TargetType,
        target_id: &str,
        task_type: &str,
        priority: i32,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let inserted = sqlx::query(
            "INSERT INTO enrichment_queue
                (id, target_type, target_id, task_type, priority, status, created_at)
             VALUES (?, ?, ?, ?, ?, 'pending', ?)
             ON CONFLICT(target_type, target_id, task_type) DO NOTHING",
        )
        .bind(id.to_string())
        .bind(target_type.as_str())
        .bind(target_id)
        .bind(task_type)
        .bind(priority)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() == 1 {
            debug!(task_type, target_id, priority, "Enqueued enrichment task");
            return Ok(id);
        }

        // Triple already queued; hand back the existing row.
        let row = sqlx::query(
            "SELECT id FROM enrichment_queue
             WHERE target_type = ? AND target_id = ? AND task_type = ?",
        )
        .bind(target_type.as_str())
        .bind(target_id)
        .bind(task_type)
        .fetch_one(&self.pool)
        .await?;
        parse_uuid(row.get::<String, _>("id"))
    }

    /// Pending tasks in `(priority asc, created_at asc)` order, optionally
    /// restricted to certain task types.
    pub async fn pending(
        &self,
        limit: i64,
        task_types: Option<&[String]>,
    ) -> Result<Vec<EnrichmentTask>> {
        let rows = match task_types {
            Some(types) if !types.is_empty() => {
                let placeholders = vec!["?"; types.len()].join(", ");
                let sql = format!(
                    "SELECT * FROM enrichment_queue WHERE status = 'pending'
                     AND task_type IN ({placeholders})
                     ORDER BY priority ASC, created_at ASC LIMIT ?"
                );
                let mut query = sqlx::query(&sql);
                for t in types {
                    query = query.bind(t);
                }
                query.bind(limit).fetch_all(&self.pool).await?
            }
            _ => {
                sqlx::query(
                    "SELECT * FROM enrichment_queue WHERE status = 'pending'
                     ORDER BY priority ASC, created_at ASC LIMIT ?",
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(task_from_row).collect()
    }

    /// Atomically move a pending task to `processing`, bumping its attempt
    /// counter. Returns `true` iff this call won the row.
    pub async fn claim(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'processing', started_at = ?, attempts = attempts + 1
             WHERE id = ? AND status = 'pending'",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        let claimed = result.rows_affected() == 1;
        if !claimed {
            debug!(task_id = %id, "Task already claimed or not pending");
        }
        Ok(claimed)
    }

    pub async fn complete(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'complete', completed_at = ?, error = NULL
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        debug!(task_id = %id, "Task complete");
        Ok(())
    }

    pub async fn fail(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'failed', completed_at = ?, error = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        warn!(task_id = %id, error, "Task failed");
        Ok(())
    }

    /// Return tasks stuck in `processing` for longer than `max_age` to
    /// `pending`. Terminal rows are never touched.
    pub async fn reset_stale(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let result = sqlx::query(
            "UPDATE enrichment_queue
             SET status = 'pending', started_at = NULL
             WHERE status = 'processing' AND started_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let reset = result.rows_affected();
        if reset > 0 {
            info!(reset, "Reclaimed stale enrichment tasks");
        }
        Ok(reset)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<EnrichmentTask>> {
        let row = sqlx::query("SELECT * FROM enrichment_queue WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<EnrichmentTask> {
    let target_type: String = row.get("target_type");
    let status: String = row.get("status");
    Ok(EnrichmentTask {
        id: parse_uuid(row.get::<String, _>("id"))?,
        target_type: TargetType::parse(&target_type)
            .ok_or_else(|| MurmurError::Store(format!("unknown target type {target_type}")))?,
        target_id: row.get("target_id"),
        task_type: row.get("task_type"),
        priority: row.get("priority"),
        status: TaskStatus::parse(&status)
            .ok_or_else(|| MurmurError::Store(format!("unknown task status {status}")))?,
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        attempts: row.get("attempts"),
        error: row.get("error"),
    })
}

fn parse_uuid(raw: String) -> Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| MurmurError::Store(format!("bad task id {raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use murmur_core::types::task_types;

    async fn repo() -> EnrichmentQueueRepository {
        EnrichmentQueueRepository::new(test_pool().await)
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent() {
        let repo = repo().await;

        let a = repo
            .enqueue(TargetType::Idea, "idea-1", task_types::ALIAS_DETECTION, 2)
            .await
            .unwrap();
        let b = repo
            .enqueue(TargetType::Idea, "idea-1", task_types::ALIAS_DETECTION, 1)
            .await
            .unwrap();
        assert_eq!(a, b);

        let pending = repo.pending(10, None).await.unwrap();
        assert_eq!(pending.len(), 1);
        // second enqueue did not modify the row
        assert_eq!(pending[0].priority, 2);
    }

    #[tokio::test]
    async fn test_reenqueue_does_not_resurrect_completed_task() {
        let repo = repo().await;
        let id = repo
            .enqueue(TargetType::Idea, "idea-1", task_types::INTENT_KEYWORDS, 2)
            .await
            .unwrap();
        assert!(repo.claim(id).await.unwrap());
        repo.complete(id).await.unwrap();

        let again = repo
            .enqueue(TargetType::Idea, "idea-1", task_types::INTENT_KEYWORDS, 2)
            .await
            .unwrap();
        assert_eq!(again, id);
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn test_claim_succeeds_exactly_once() {
        let repo = repo().await;
        let id = repo
            .enqueue(TargetType::Idea, "idea-1", task_types::ALIAS_DETECTION, 2)
            .await
            .unwrap();

        assert!(repo.claim(id).await.unwrap());
        assert!(!repo.claim(id).await.unwrap());

        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.attempts, 1);
        assert!(task.started_at.is_some());
    }

    #[tokio::test]
    async fn test_pending_ordering_priority_then_fifo() {
        let repo = repo().await;
        repo.enqueue(TargetType::Idea, "i1", "a", 3).await.unwrap();
        repo.enqueue(TargetType::Idea, "i2", "a", 1).await.unwrap();
        repo.enqueue(TargetType::Idea, "i3", "a", 1).await.unwrap();
        repo.enqueue(TargetType::Idea, "i4", "a", 2).await.unwrap();

        let pending = repo.pending(10, None).await.unwrap();
        let targets: Vec<&str> = pending.iter().map(|t| t.target_id.as_str()).collect();
        assert_eq!(targets, vec!["i2", "i3", "i4", "i1"]);
    }

    #[tokio::test]
    async fn test_pending_task_type_filter() {
        let repo = repo().await;
        repo.enqueue(TargetType::Idea, "i1", "a", 2).await.unwrap();
        repo.enqueue(TargetType::Idea, "i1", "b", 2).await.unwrap();

        let only_b = repo
            .pending(10, Some(&["b".to_string()]))
            .await
            .unwrap();
        assert_eq!(only_b.len(), 1);
        assert_eq!(only_b[0].task_type, "b");
    }

    #[tokio::test]
    async fn test_reset_stale_reclaims_only_old_processing_rows() {
        let repo = repo().await;
        let stuck = repo.enqueue(TargetType::Idea, "i1", "a", 2).await.unwrap();
        let fresh = repo.enqueue(TargetType::Idea, "i2", "a", 2).await.unwrap();
        let done = repo.enqueue(TargetType::Idea, "i3", "a", 2).await.unwrap();

        assert!(repo.claim(stuck).await.unwrap());
        assert!(repo.claim(fresh).await.unwrap());
        assert!(repo.claim(done).await.unwrap());
        repo.complete(done).await.unwrap();

        // Age out only the first claim.
        sqlx::query("UPDATE enrichment_queue SET started_at = ? WHERE id = ?")
            .bind(Utc::now() - Duration::seconds(120))
            .bind(stuck.to_string())
            .execute(&repo.pool)
            .await
            .unwrap();

        let reset = repo.reset_stale(Duration::seconds(30)).await.unwrap();
        assert_eq!(reset, 1);

        let reclaimed = repo.get(stuck).await.unwrap().unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Pending);
        assert!(reclaimed.started_at.is_none());
        assert_eq!(reclaimed.attempts, 1);

        assert_eq!(repo.get(fresh).await.unwrap().unwrap().status, TaskStatus::Processing);
        assert_eq!(repo.get(done).await.unwrap().unwrap().status, TaskStatus::Complete);

        // the reclaimed task can be claimed again
        assert!(repo.claim(stuck).await.unwrap());
        assert_eq!(repo.get(stuck).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let repo = repo().await;
        let id = repo.enqueue(TargetType::Exchange, "x1", "t", 2).await.unwrap();
        assert!(repo.claim(id).await.unwrap());
        repo.fail(id, "model unavailable").await.unwrap();

        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("model unavailable"));
        assert!(task.completed_at.is_some());
    }
}
