//! Response mapping: links an idea to the prior different-speaker idea it
//! answers, when the timing reads like a response.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use murmur_core::config::EnrichmentConfig;
use murmur_core::error::Result;
use murmur_core::types::{task_types, EnrichmentState, TargetType};
use murmur_store::ideas::IdeaRepository;

use crate::handler::{ItemResult, TaskHandler, TaskItem};

pub struct ResponseMappingHandler {
    ideas: Arc<IdeaRepository>,
    config: EnrichmentConfig,
}

impl ResponseMappingHandler {
    pub fn new(ideas: Arc<IdeaRepository>, config: EnrichmentConfig) -> Self {
        Self { ideas, config }
    }
}

#[async_trait]
impl TaskHandler for ResponseMappingHandler {
    fn task_type(&self) -> &'static str {
        task_types::RESPONSE_MAPPING
    }

    fn target_types(&self) -> &'static [TargetType] {
        &[TargetType::Idea]
    }

    async fn process(&self, items: &[TaskItem]) -> Result<Vec<ItemResult>> {
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let idea = match self.ideas.get(&item.target_id).await {
                Ok(Some(idea)) => idea,
                Ok(None) => {
                    results.push(ItemResult::Failed("Idea not found".into()));
                    continue;
                }
                Err(e) => {
                    results.push(ItemResult::Failed(e.to_string()));
                    continue;
                }
            };

            let previous = match self
                .ideas
                .previous_idea(
                    &idea.payload.session_id,
                    idea.payload.started_at,
                    Some(idea.payload.user_id),
                )
                .await
            {
                Ok(previous) => previous,
                Err(e) => {
                    results.push(ItemResult::Failed(e.to_string()));
                    continue;
                }
            };

            let mut link: Option<(String, f64)> = None;
            if let Some(prev) = previous {
                let latency_ms = (idea.payload.started_at - prev.payload.ended_at)
                    .num_milliseconds() as f64;

                if latency_ms >= 0.0
                    && latency_ms <= self.config.response_mapping_time_threshold_ms
                {
                    let prev_complete = prev
                        .payload
                        .prosody_interpretation
                        .as_ref()
                        .and_then(|pi| pi.is_complete)
                        .unwrap_or(false);

                    // A very quick reply links even when the prior idea did
                    // not read as complete.
                    if prev_complete || latency_ms < self.config.response_quick_latency_ms {
                        link = Some((prev.id.clone(), latency_ms));
                    }
                }
            }

            if let Some((prev_id, latency_ms)) = &link {
                info!(
                    idea_id = %item.target_id,
                    responds_to = %prev_id,
                    latency_ms,
                    "Mapped response"
                );
            } else {
                debug!(idea_id = %item.target_id, "No response linkage");
            }

            let updated = self
                .ideas
                .update_enrichments(&item.target_id, |payload| {
                    if let Some((prev_id, latency_ms)) = link {
                        payload.is_response_to_idea_id = Some(prev_id);
                        payload.response_latency_ms = Some(latency_ms);
                    }
                    payload.enrichment_status.insert(
                        task_types::RESPONSE_MAPPING.into(),
                        EnrichmentState::Complete,
                    );
                })
                .await;

            results.push(match updated {
                Ok(true) => ItemResult::Complete,
                Ok(false) => ItemResult::Failed("Failed to update idea".into()),
                Err(e) => ItemResult::Failed(e.to_string()),
            });
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use murmur_core::error::Result as CoreResult;
    use murmur_core::types::{IdeaPayload, ProsodyInterpretation};
    use murmur_providers::EmbeddingProvider;
    use murmur_store::vector::MemoryVectorStore;
    use uuid::Uuid;

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

    fn fixture() -> (ResponseMappingHandler, Arc<IdeaRepository>, DateTime<Utc>) {
        let ideas = Arc::new(IdeaRepository::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(StubEmbedder),
            "ideas",
        ));
        (
            ResponseMappingHandler::new(ideas.clone(), EnrichmentConfig::default()),
            ideas,
            Utc::now(),
        )
    }

    async fn make_idea(
        ideas: &IdeaRepository,
        user_id: u64,
        start_ms: i64,
        end_ms: i64,
        base: DateTime<Utc>,
        is_complete: Option<bool>,
    ) -> String {
        let mut payload = IdeaPayload::new(
            vec![1],
            "s1".into(),
            user_id,
            "idea text".into(),
            base + Duration::milliseconds(start_ms),
            base + Duration::milliseconds(end_ms),
        );
        if is_complete.is_some() {
            payload.prosody_interpretation = Some(ProsodyInterpretation {
                is_complete,
                ..ProsodyInterpretation::default()
            });
        }
        ideas.create(payload).await.unwrap()
    }

    fn item(target_id: &str) -> TaskItem {
        TaskItem {
            task_id: Uuid::new_v4(),
            target_type: TargetType::Idea,
            target_id: target_id.into(),
        }
    }

    #[tokio::test]
    async fn test_response_linked_with_latency() {
        let (handler, ideas, base) = fixture();
        // A ends at t=10.000 reading complete; B starts at t=10.800
        let a = make_idea(&ideas, 7, 0, 10_000, base, Some(true)).await;
        let b = make_idea(&ideas, 8, 10_800, 12_000, base, None).await;

        let results = handler.process(&[item(&b)]).await.unwrap();
        assert_eq!(results, vec![ItemResult::Complete]);

        let idea = ideas.get(&b).await.unwrap().unwrap();
        assert_eq!(idea.payload.is_response_to_idea_id.as_deref(), Some(a.as_str()));
        assert_eq!(idea.payload.response_latency_ms, Some(800.0));
    }

    #[tokio::test]
    async fn test_quick_reply_links_despite_incomplete_prior() {
        let (handler, ideas, base) = fixture();
        let a = make_idea(&ideas, 7, 0, 10_000, base, Some(false)).await;
        let b = make_idea(&ideas, 8, 10_500, 12_000, base, None).await;

        handler.process(&[item(&b)]).await.unwrap();
        let idea = ideas.get(&b).await.unwrap().unwrap();
        assert_eq!(idea.payload.is_response_to_idea_id.as_deref(), Some(a.as_str()));
        assert_eq!(idea.payload.response_latency_ms, Some(500.0));
    }

    #[tokio::test]
    async fn test_slow_reply_to_incomplete_prior_not_linked() {
        let (handler, ideas, base) = fixture();
        let _a = make_idea(&ideas, 7, 0, 10_000, base, Some(false)).await;
        let b = make_idea(&ideas, 8, 13_000, 15_000, base, None).await;

        let results = handler.process(&[item(&b)]).await.unwrap();
        assert_eq!(results, vec![ItemResult::Complete]);

        let idea = ideas.get(&b).await.unwrap().unwrap();
        assert_eq!(idea.payload.is_response_to_idea_id, None);
        assert_eq!(
            idea.payload.enrichment_status[task_types::RESPONSE_MAPPING],
            EnrichmentState::Complete
        );
    }

    #[tokio::test]
    async fn test_latency_beyond_threshold_not_linked() {
        let (handler, ideas, base) = fixture();
        let _a = make_idea(&ideas, 7, 0, 10_000, base, Some(true)).await;
        let b = make_idea(&ideas, 8, 16_000, 18_000, base, None).await;

        handler.process(&[item(&b)]).await.unwrap();
        let idea = ideas.get(&b).await.unwrap().unwrap();
        assert_eq!(idea.payload.is_response_to_idea_id, None);
    }

    #[tokio::test]
    async fn test_first_idea_in_session_completes_without_link() {
        let (handler, ideas, base) = fixture();
        let a = make_idea(&ideas, 7, 0, 2_000, base, None).await;

        let results = handler.process(&[item(&a)]).await.unwrap();
        assert_eq!(results, vec![ItemResult::Complete]);
    }
}
