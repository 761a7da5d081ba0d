//! Exchange detection: groups temporally related ideas into exchanges.
//!
//! Two rules run on every new idea. A temporal join merges consecutive
//! same-speaker ideas separated by short gaps; a semantic relation merges
//! a quick multi-speaker back-and-forth. Consumed ideas leave the window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use murmur_core::config::ExchangeConfig;
use murmur_core::types::{task_types, ExchangeKind, ExchangePayload, TargetType};
use murmur_store::exchanges::ExchangeRepository;
use murmur_store::ideas::IdeaRepository;
use murmur_store::queue::EnrichmentQueueRepository;

const EXCHANGE_TASK_PRIORITY: i32 = 2;
/// Temporal joins look at the speaker's most recent ideas only.
const TEMPORAL_LOOKBACK: usize = 3;
/// Semantic relations look at the last few ideas across speakers.
const SEMANTIC_LOOKBACK: usize = 5;

#[derive(Debug, Clone)]
struct WindowIdea {
    id: String,
    user_id: u64,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    text: String,
}

pub struct ExchangeDetector {
    ideas: Arc<IdeaRepository>,
    exchanges: Arc<ExchangeRepository>,
    queue: EnrichmentQueueRepository,
    config: ExchangeConfig,
    /// session id -> sliding window of recent ideas
    window: Mutex<HashMap<String, Vec<WindowIdea>>>,
}

impl ExchangeDetector {
    pub fn new(
        ideas: Arc<IdeaRepository>,
        exchanges: Arc<ExchangeRepository>,
        queue: EnrichmentQueueRepository,
        config: ExchangeConfig,
    ) -> Self {
        Self {
            ideas,
            exchanges,
            queue,
            config,
            window: Mutex::new(HashMap::new()),
        }
    }

    /// Called by the boundary detector after an idea is written.
    pub async fn on_idea_created(&self, idea_id: &str, session_id: &str, user_id: u64) {
        let idea = match self.ideas.get(idea_id).await {
            Ok(Some(idea)) => idea,
            Ok(None) => {
                warn!(idea_id, "Idea not found for exchange detection");
                return;
            }
            Err(e) => {
                error!(idea_id, error = %e, "Failed to load idea for exchange detection");
                return;
            }
        };

        {
            let mut window = self.window.lock().await;
            window
                .entry(session_id.to_string())
                .or_default()
                .push(WindowIdea {
                    id: idea_id.to_string(),
                    user_id,
                    started_at: idea.payload.started_at,
                    ended_at: idea.payload.ended_at,
                    text: idea.payload.text.clone(),
                });
        }

        self.check_temporal_join(session_id, user_id).await;
        self.check_semantic_relation(session_id).await;
    }

    /// Session-end flush: whatever is left in the window becomes one final
    /// exchange, if at least two ideas remain.
    pub async fn flush_session(&self, session_id: &str) {
        let remaining = {
            let mut window = self.window.lock().await;
            window.remove(session_id).unwrap_or_default()
        };

        if remaining.len() >= 2 {
            info!(
                session_id,
                ideas = remaining.len(),
                "Flushing window into session-end exchange"
            );
            self.create_exchange(session_id, &remaining, ExchangeKind::SessionEnd)
                .await;
        }
    }

    /// Same speaker, two or more consecutive ideas, every gap within
    /// `temporal_join_gap_ms`, total span within `exchange_gap_threshold_ms`.
    async fn check_temporal_join(&self, session_id: &str, user_id: u64) {
        let candidate: Option<Vec<WindowIdea>> = {
            let window = self.window.lock().await;
            let Some(ideas) = window.get(session_id) else {
                return;
            };

            let mut user_ideas: Vec<WindowIdea> = ideas
                .iter()
                .filter(|i| i.user_id == user_id)
                .cloned()
                .collect();
            if user_ideas.len() < 2 {
                return;
            }
            user_ideas.sort_by_key(|i| i.started_at);
            let recent: Vec<WindowIdea> = user_ideas
                .into_iter()
                .rev()
                .take(TEMPORAL_LOOKBACK)
                .rev()
                .collect();

            let gaps_ok = recent.windows(2).all(|pair| {
                let gap_ms = (pair[1].started_at - pair[0].ended_at).num_milliseconds();
                gap_ms <= self.config.temporal_join_gap_ms
            });
            let span_ms = (recent.last().unwrap().ended_at
                - recent.first().unwrap().started_at)
                .num_milliseconds();

            if gaps_ok && span_ms <= self.config.exchange_gap_threshold_ms {
                Some(recent)
            } else {
                None
            }
        };

        if let Some(ideas) = candidate {
            debug!(
                session_id,
                user_id,
                ideas = ideas.len(),
                "Temporal join detected"
            );
            self.create_exchange(session_id, &ideas, ExchangeKind::TemporalJoin)
                .await;
        }
    }

    /// A run of ideas where every inter-idea gap is under `semantic_gap_ms`
    /// and at least two distinct speakers take part.
    async fn check_semantic_relation(&self, session_id: &str) {
        let candidates: Vec<Vec<WindowIdea>> = {
            let window = self.window.lock().await;
            let Some(ideas) = window.get(session_id) else {
                return;
            };
            if ideas.len() < 2 {
                return;
            }

            let mut recent: Vec<WindowIdea> = ideas
                .iter()
                .rev()
                .take(SEMANTIC_LOOKBACK)
                .cloned()
                .collect();
            recent.sort_by_key(|i| i.started_at);

            let mut runs: Vec<Vec<WindowIdea>> = Vec::new();
            let mut current = vec![recent[0].clone()];
            for pair in recent.windows(2) {
                let gap_ms = (pair[1].started_at - pair[0].ended_at).num_milliseconds();
                if gap_ms < self.config.semantic_gap_ms {
                    current.push(pair[1].clone());
                } else {
                    if current.len() >= 2 {
                        runs.push(current);
                    }
                    current = vec![pair[1].clone()];
                }
            }
            if current.len() >= 2 {
                runs.push(current);
            }

            runs.into_iter()
                .filter(|run| {
                    let speakers: std::collections::HashSet<u64> =
                        run.iter().map(|i| i.user_id).collect();
                    speakers.len() >= 2
                })
                .collect()
        };

        for run in candidates {
            debug!(session_id, ideas = run.len(), "Semantic relation detected");
            self.create_exchange(session_id, &run, ExchangeKind::SemanticRelation)
                .await;
        }
    }

    async fn create_exchange(
        &self,
        session_id: &str,
        ideas: &[WindowIdea],
        kind: ExchangeKind,
    ) {
        let idea_ids: Vec<String> = ideas.iter().map(|i| i.id.clone()).collect();
        let mut participants: Vec<u64> = ideas.iter().map(|i| i.user_id).collect();
        participants.sort_unstable();
        participants.dedup();

        let text = ideas
            .iter()
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let started_at = ideas.iter().map(|i| i.started_at).min().expect("nonempty");
        let ended_at = ideas.iter().map(|i| i.ended_at).max().expect("nonempty");

        let payload = ExchangePayload::new(
            idea_ids.clone(),
            session_id.to_string(),
            participants,
            text,
            started_at,
            ended_at,
            kind,
        );

        let exchange_id = match self.exchanges.create(payload).await {
            Ok(id) => id,
            Err(e) => {
                error!(session_id, error = %e, "Failed to create exchange");
                return;
            }
        };

        if let Err(e) = self
            .queue
            .enqueue(
                TargetType::Exchange,
                &exchange_id,
                task_types::TOPIC_EXTRACTION,
                EXCHANGE_TASK_PRIORITY,
            )
            .await
        {
            warn!(exchange_id = %exchange_id, error = %e, "Failed to enqueue exchange enrichment");
        }

        // Remove consumed ideas from the window.
        let mut window = self.window.lock().await;
        if let Some(ideas) = window.get_mut(session_id) {
            ideas.retain(|i| !idea_ids.contains(&i.id));
        }
    }

    #[cfg(test)]
    pub(crate) async fn window_len(&self, session_id: &str) -> usize {
        self.window
            .lock()
            .await
            .get(session_id)
            .map(|w| w.len())
            .unwrap_or(0)
    }
}
