//! Boundary detection: promotes runs of one speaker's utterances into ideas.
//!
//! Invoked as a post-commit hook by the transcription stage, after the
//! utterance row is durable. Speaker-change checks run before the new
//! utterance joins its own speaker's FIFO, so a long gap closes the
//! previous speaker's idea first.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use murmur_core::config::BoundaryConfig;
use murmur_core::types::{task_types, IdeaPayload, TargetType, Utterance};
use murmur_store::ideas::IdeaRepository;
use murmur_store::queue::EnrichmentQueueRepository;

use crate::exchange::ExchangeDetector;
use crate::session_manager::SessionEndListener;

/// Priority assigned to the enrichment tasks of a fresh idea.
const IDEA_TASK_PRIORITY: i32 = 2;
/// Span after which two pending utterances are enough for a boundary.
const AGGRESSIVE_SPAN_SEC: f64 = 15.0;
/// Pending count that forces a boundary on its own.
const MAX_PENDING_COUNT: usize = 3;

pub struct BoundaryDetector {
    ideas: Arc<IdeaRepository>,
    queue: EnrichmentQueueRepository,
    exchange: Option<Arc<ExchangeDetector>>,
    config: BoundaryConfig,
    /// session id -> user id -> pending utterance FIFO
    pending: Mutex<HashMap<String, HashMap<u64, Vec<Utterance>>>>,
}

impl BoundaryDetector {
    pub fn new(
        ideas: Arc<IdeaRepository>,
        queue: EnrichmentQueueRepository,
        exchange: Option<Arc<ExchangeDetector>>,
        config: BoundaryConfig,
    ) -> Self {
        Self {
            ideas,
            queue,
            exchange,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Post-commit hook for a newly persisted utterance.
    pub async fn handle_utterance(&self, utterance: &Utterance) {
        // A different speaker resuming after a silence gap closes every
        // other speaker's pending idea. Runs before the append below.
        self.check_speaker_change(utterance).await;

        let fire = {
            let mut pending = self.pending.lock().await;
            let fifo = pending
                .entry(utterance.session_id.clone())
                .or_default()
                .entry(utterance.user_id)
                .or_insert_with(Vec::new);
            fifo.push(utterance.clone());
            debug!(
                session_id = %utterance.session_id,
                user_id = utterance.user_id,
                pending = fifo.len(),
                "Buffered utterance for boundary detection"
            );
            self.is_boundary(fifo)
        };

        if fire {
            self.create_idea(&utterance.session_id, utterance.user_id)
                .await;
        }
    }

    /// Force a boundary for every speaker with pending utterances, then
    /// flush the exchange window. Called on session end.
    pub async fn flush_session(&self, session_id: &str) {
        let users: Vec<u64> = {
            let pending = self.pending.lock().await;
            pending
                .get(session_id)
                .map(|by_user| {
                    by_user
                        .iter()
                        .filter(|(_, fifo)| !fifo.is_empty())
                        .map(|(user, _)| *user)
                        .collect()
                })
                .unwrap_or_default()
        };

        for user_id in users {
            self.create_idea(session_id, user_id).await;
        }

        self.pending.lock().await.remove(session_id);
        info!(session_id, "Flushed pending utterances");

        if let Some(exchange) = &self.exchange {
            exchange.flush_session(session_id).await;
        }
    }

    async fn check_speaker_change(&self, utterance: &Utterance) {
        let to_close: Vec<u64> = {
            let pending = self.pending.lock().await;
            let Some(by_user) = pending.get(&utterance.session_id) else {
                return;
            };
            by_user
                .iter()
                .filter(|(user_id, fifo)| {
                    **user_id != utterance.user_id && !fifo.is_empty()
                })
                .filter(|(_, fifo)| {
                    let last = fifo.last().expect("nonempty fifo");
                    let gap_ms =
                        (utterance.started_at - last.ended_at).num_milliseconds();
                    gap_ms >= self.config.idea_boundary_silence_ms
                })
                .map(|(user_id, _)| *user_id)
                .collect()
        };

        for user_id in to_close {
            debug!(
                session_id = %utterance.session_id,
                user_id,
                "Speaker change with silence gap, closing idea"
            );
            self.create_idea(&utterance.session_id, user_id).await;
        }
    }

    /// Boundary rules, evaluated against the FIFO including the newest
    /// utterance.
    fn is_boundary(&self, fifo: &[Utterance]) -> bool {
        let (Some(first), Some(last)) = (fifo.first(), fifo.last()) else {
            return false;
        };

        let span_sec =
            (last.ended_at - first.started_at).num_milliseconds() as f64 / 1000.0;

        if span_sec >= self.config.idea_max_duration_sec {
            debug!(span_sec, "Boundary: max duration");
            return true;
        }
        if span_sec >= AGGRESSIVE_SPAN_SEC && fifo.len() >= 2 {
            debug!(span_sec, pending = fifo.len(), "Boundary: long span");
            return true;
        }
        if fifo.len() >= MAX_PENDING_COUNT {
            debug!(pending = fifo.len(), "Boundary: pending count");
            return true;
        }
        false
    }

    /// Promote the speaker's pending FIFO into an idea. The FIFO is only
    /// cleared after the idea is durably written, so a store failure keeps
    /// the utterances pending for the next trigger.
    async fn create_idea(&self, session_id: &str, user_id: u64) {
        let batch: Vec<Utterance> = {
            let pending = self.pending.lock().await;
            match pending.get(session_id).and_then(|m| m.get(&user_id)) {
                Some(fifo) if !fifo.is_empty() => fifo.clone(),
                _ => return,
            }
        };

        let text = batch
            .iter()
            .map(|u| u.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let payload = IdeaPayload::new(
            batch.iter().map(|u| u.id).collect(),
            session_id.to_string(),
            user_id,
            text,
            batch.first().expect("nonempty batch").started_at,
            batch.last().expect("nonempty batch").ended_at,
        );

        let idea_id = match self.ideas.create(payload).await {
            Ok(id) => id,
            Err(e) => {
                error!(session_id, user_id, error = %e, "Failed to create idea; keeping utterances pending");
                return;
            }
        };

        // Drop exactly the promoted run; utterances appended mid-flight
        // stay at the front of the next idea.
        {
            let mut pending = self.pending.lock().await;
            if let Some(fifo) = pending
                .get_mut(session_id)
                .and_then(|m| m.get_mut(&user_id))
            {
                let n = batch.len().min(fifo.len());
                fifo.drain(..n);
            }
        }

        for task_type in task_types::IDEA_TASKS {
            if let Err(e) = self
                .queue
                .enqueue(TargetType::Idea, &idea_id, task_type, IDEA_TASK_PRIORITY)
                .await
            {
                warn!(idea_id = %idea_id, task_type, error = %e, "Failed to enqueue enrichment task");
            }
        }

        if let Some(exchange) = &self.exchange {
            exchange
                .on_idea_created(&idea_id, session_id, user_id)
                .await;
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_count(&self, session_id: &str, user_id: u64) -> usize {
        self.pending
            .lock()
            .await
            .get(session_id)
            .and_then(|m| m.get(&user_id))
            .map(|f| f.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl SessionEndListener for BoundaryDetector {
    async fn on_session_end(&self, session_id: &str) {
        self.flush_session(session_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use murmur_core::error::Result as CoreResult;
    use murmur_core::types::EnrichmentState;
    use murmur_providers::EmbeddingProvider;
    use murmur_store::db::{init_schema, open_memory_pool};
    use murmur_store::vector::MemoryVectorStore;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> CoreResult<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    struct Fixture {
        detector: BoundaryDetector,
        ideas: Arc<IdeaRepository>,
        queue: EnrichmentQueueRepository,
        base: DateTime<Utc>,
    }

    async fn fixture() -> Fixture {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let queue = EnrichmentQueueRepository::new(pool);
        let ideas = Arc::new(IdeaRepository::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(StubEmbedder),
            "ideas",
        ));
        let detector = BoundaryDetector::new(
            ideas.clone(),
            queue.clone(),
            None,
            BoundaryConfig::default(),
        );
        Fixture {
            detector,
            ideas,
            queue,
            base: Utc::now(),
        }
    }

    fn utterance(
        seq: i64,
        user_id: u64,
        text: &str,
        start_sec: f64,
        end_sec: f64,
        base: DateTime<Utc>,
    ) -> Utterance {
        Utterance {
            id: seq,
            session_id: "s1".into(),
            user_id,
            username: format!("user{user_id}"),
            display_name: format!("User {user_id}"),
            text: text.into(),
            started_at: base + Duration::milliseconds((start_sec * 1000.0) as i64),
            ended_at: base + Duration::milliseconds((end_sec * 1000.0) as i64),
            confidence: 0.9,
            audio_duration: end_sec - start_sec,
            sequence_num: seq,
            prosody: None,
        }
    }

    #[tokio::test]
    async fn test_three_pending_utterances_fire_one_idea() {
        let f = fixture().await;

        // three 2 s utterances with 100 ms gaps
        f.detector
            .handle_utterance(&utterance(1, 7, "one", 0.0, 2.0, f.base))
            .await;
        f.detector
            .handle_utterance(&utterance(2, 7, "two", 2.1, 4.1, f.base))
            .await;
        assert_eq!(f.detector.pending_count("s1", 7).await, 2);

        f.detector
            .handle_utterance(&utterance(3, 7, "three", 4.2, 6.2, f.base))
            .await;
        assert_eq!(f.detector.pending_count("s1", 7).await, 0);

        let ideas = f.ideas.by_session("s1", 10).await.unwrap();
        assert_eq!(ideas.len(), 1);
        let idea = &ideas[0];
        assert_eq!(idea.payload.utterance_ids, vec![1, 2, 3]);
        assert_eq!(idea.payload.text, "one two three");
        assert_eq!(idea.payload.started_at, f.base);
        assert_eq!(
            idea.payload.ended_at,
            f.base + Duration::milliseconds(6200)
        );
        assert!(idea
            .payload
            .enrichment_status
            .values()
            .all(|s| *s == EnrichmentState::Pending));

        // four enrichment tasks queued at priority 2
        let pending = f.queue.pending(10, None).await.unwrap();
        assert_eq!(pending.len(), 4);
        assert!(pending.iter().all(|t| t.priority == 2));
        let mut types: Vec<&str> = pending.iter().map(|t| t.task_type.as_str()).collect();
        types.sort();
        assert_eq!(
            types,
            vec![
                "alias_detection",
                "intent_keywords",
                "prosody_interpretation",
                "response_mapping"
            ]
        );
    }

    #[tokio::test]
    async fn test_long_span_with_two_utterances_fires() {
        let f = fixture().await;
        f.detector
            .handle_utterance(&utterance(1, 7, "start", 0.0, 8.0, f.base))
            .await;
        f.detector
            .handle_utterance(&utterance(2, 7, "and on", 8.5, 16.0, f.base))
            .await;

        assert_eq!(f.ideas.by_session("s1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_max_duration_fires_even_for_single_utterance_pair() {
        let f = fixture().await;
        f.detector
            .handle_utterance(&utterance(1, 7, "monologue", 0.0, 61.0, f.base))
            .await;

        // span >= 60 s fires immediately, even with one utterance pending
        assert_eq!(f.ideas.by_session("s1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_speaker_change_with_gap_closes_previous_speaker() {
        let f = fixture().await;
        f.detector
            .handle_utterance(&utterance(1, 7, "question", 0.0, 2.0, f.base))
            .await;

        // speaker 8 comes in 900 ms after speaker 7 stopped
        f.detector
            .handle_utterance(&utterance(2, 8, "answer", 2.9, 4.0, f.base))
            .await;

        let ideas = f.ideas.by_session("s1", 10).await.unwrap();
        assert_eq!(ideas.len(), 1);
        assert_eq!(ideas[0].payload.user_id, 7);
        // speaker 8's own utterance is still pending
        assert_eq!(f.detector.pending_count("s1", 8).await, 1);
    }

    #[tokio::test]
    async fn test_speaker_change_without_gap_does_not_close() {
        let f = fixture().await;
        f.detector
            .handle_utterance(&utterance(1, 7, "quick", 0.0, 2.0, f.base))
            .await;
        // only 300 ms gap
        f.detector
            .handle_utterance(&utterance(2, 8, "reply", 2.3, 3.0, f.base))
            .await;

        assert!(f.ideas.by_session("s1", 10).await.unwrap().is_empty());
        assert_eq!(f.detector.pending_count("s1", 7).await, 1);
    }

    #[tokio::test]
    async fn test_flush_session_forces_boundaries() {
        let f = fixture().await;
        f.detector
            .handle_utterance(&utterance(1, 7, "alpha", 0.0, 1.0, f.base))
            .await;
        f.detector
            .handle_utterance(&utterance(2, 8, "beta", 0.5, 1.5, f.base))
            .await;

        f.detector.flush_session("s1").await;

        let ideas = f.ideas.by_session("s1", 10).await.unwrap();
        assert_eq!(ideas.len(), 2);
        assert_eq!(f.detector.pending_count("s1", 7).await, 0);
        assert_eq!(f.detector.pending_count("s1", 8).await, 0);
    }

    #[tokio::test]
    async fn test_enqueue_is_idempotent_across_duplicate_boundaries() {
        let f = fixture().await;
        for i in 0..3 {
            f.detector
                .handle_utterance(&utterance(
                    i + 1,
                    7,
                    "text",
                    i as f64,
                    i as f64 + 0.5,
                    f.base,
                ))
                .await;
        }
        let first = f.queue.pending(10, None).await.unwrap();
        assert_eq!(first.len(), 4);
    }
}
