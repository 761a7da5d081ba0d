//! Prosody interpretation: semantic indicators from the final utterance's
//! acoustic features.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use murmur_core::config::EnrichmentConfig;
use murmur_core::error::Result;
use murmur_core::types::{
    task_types, ConfidenceIndicators, EnrichmentState, ProsodyFeatures, ProsodyInterpretation,
    TargetType,
};
use murmur_store::ideas::IdeaRepository;
use murmur_store::utterances::UtteranceRepository;

use crate::handler::{ItemResult, TaskHandler, TaskItem};

pub struct ProsodyInterpretationHandler {
    ideas: Arc<IdeaRepository>,
    utterances: UtteranceRepository,
    config: EnrichmentConfig,
}

impl ProsodyInterpretationHandler {
    pub fn new(
        ideas: Arc<IdeaRepository>,
        utterances: UtteranceRepository,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            ideas,
            utterances,
            config,
        }
    }

    /// Derive indicators from the prosody of the idea's last utterance.
    /// Missing features leave the corresponding indicator unset.
    fn interpret(&self, prosody: &ProsodyFeatures) -> ProsodyInterpretation {
        let mut interpretation = ProsodyInterpretation::default();

        // Rising final intonation reads as a question.
        if let Some(pitch_slope) = prosody.final_pitch_slope {
            interpretation.is_question_prosody =
                Some(pitch_slope > self.config.question_pitch_slope_hz_per_sec);
        }

        // Falling pitch plus falling intensity reads as a finished thought.
        if let (Some(pitch_slope), Some(intensity_slope)) =
            (prosody.final_pitch_slope, prosody.final_intensity_slope)
        {
            interpretation.is_complete = Some(
                pitch_slope < self.config.complete_pitch_slope_hz_per_sec
                    && intensity_slope < self.config.complete_intensity_slope_db_per_sec,
            );
        }

        let mut indicators = ConfidenceIndicators::default();
        if let Some(hnr) = prosody.hnr_db {
            indicators.voice_clarity = Some(
                if hnr >= self.config.clear_voice_hnr_db {
                    "high"
                } else {
                    "low"
                }
                .into(),
            );
        }
        if let Some(jitter) = prosody.jitter_local {
            indicators.pitch_stability = Some(
                if jitter < self.config.stable_jitter {
                    "stable"
                } else {
                    "unstable"
                }
                .into(),
            );
        }
        if let Some(intensity) = prosody.intensity_mean_db {
            indicators.loudness = Some(
                if intensity > self.config.loud_intensity_db {
                    "high"
                } else {
                    "low"
                }
                .into(),
            );
        }
        interpretation.confidence_indicators = indicators;

        interpretation
    }
}

#[async_trait]
impl TaskHandler for ProsodyInterpretationHandler {
    fn task_type(&self) -> &'static str {
        task_types::PROSODY_INTERPRETATION
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

            let Some(&last_utterance_id) = idea.payload.utterance_ids.last() else {
                results.push(ItemResult::Failed("Idea has no utterances".into()));
                continue;
            };

            let utterance = match self.utterances.get(last_utterance_id).await {
                Ok(Some(utterance)) => utterance,
                Ok(None) => {
                    results.push(ItemResult::Failed("Utterance not found".into()));
                    continue;
                }
                Err(e) => {
                    results.push(ItemResult::Failed(e.to_string()));
                    continue;
                }
            };

            // No prosody on the final utterance: record an empty
            // interpretation and still complete the task.
            let interpretation = match &utterance.prosody {
                Some(prosody) => self.interpret(prosody),
                None => {
                    debug!(idea_id = %item.target_id, "Final utterance carries no prosody");
                    ProsodyInterpretation::default()
                }
            };

            let updated = self
                .ideas
                .update_enrichments(&item.target_id, |payload| {
                    payload.prosody_interpretation = Some(interpretation);
                    payload.enrichment_status.insert(
                        task_types::PROSODY_INTERPRETATION.into(),
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
    use chrono::Utc;
    use murmur_core::error::Result as CoreResult;
    use murmur_core::types::IdeaPayload;
    use murmur_providers::EmbeddingProvider;
    use murmur_store::db::{init_schema, open_memory_pool};
    use murmur_store::sessions::SessionRepository;
    use murmur_store::utterances::NewUtterance;
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

    struct Fixture {
        handler: ProsodyInterpretationHandler,
        ideas: Arc<IdeaRepository>,
        utterances: UtteranceRepository,
        session_id: String,
    }

    async fn fixture() -> Fixture {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let session_id = SessionRepository::new(pool.clone())
            .create(1, "general", 1)
            .await
            .unwrap();
        let utterances = UtteranceRepository::new(pool);
        let ideas = Arc::new(IdeaRepository::new(
            Arc::new(MemoryVectorStore::new()),
            Arc::new(StubEmbedder),
            "ideas",
        ));
        Fixture {
            handler: ProsodyInterpretationHandler::new(
                ideas.clone(),
                utterances.clone(),
                EnrichmentConfig::default(),
            ),
            ideas,
            utterances,
            session_id,
        }
    }

    async fn make_idea(f: &Fixture, prosody: Option<ProsodyFeatures>) -> String {
        let now = Utc::now();
        let utterance = f
            .utterances
            .create(NewUtterance {
                session_id: f.session_id.clone(),
                user_id: 7,
                username: "alex".into(),
                display_name: "Alex".into(),
                text: "hello".into(),
                started_at: now,
                ended_at: now,
                confidence: 0.9,
                audio_duration: 1.0,
                prosody,
            })
            .await
            .unwrap();

        f.ideas
            .create(IdeaPayload::new(
                vec![utterance.id],
                f.session_id.clone(),
                7,
                "hello".into(),
                now,
                now,
            ))
            .await
            .unwrap()
    }

    fn item(target_id: &str) -> TaskItem {
        TaskItem {
            task_id: Uuid::new_v4(),
            target_type: TargetType::Idea,
            target_id: target_id.into(),
        }
    }

    #[tokio::test]
    async fn test_rising_pitch_reads_as_question() {
        let f = fixture().await;
        let id = make_idea(
            &f,
            Some(ProsodyFeatures {
                final_pitch_slope: Some(8.0),
                ..ProsodyFeatures::default()
            }),
        )
        .await;

        let results = f.handler.process(&[item(&id)]).await.unwrap();
        assert_eq!(results, vec![ItemResult::Complete]);

        let idea = f.ideas.get(&id).await.unwrap().unwrap();
        let interp = idea.payload.prosody_interpretation.unwrap();
        assert_eq!(interp.is_question_prosody, Some(true));
        // completeness needs both slopes
        assert_eq!(interp.is_complete, None);
    }

    #[tokio::test]
    async fn test_falling_slopes_read_as_complete() {
        let f = fixture().await;
        let id = make_idea(
            &f,
            Some(ProsodyFeatures {
                final_pitch_slope: Some(-7.0),
                final_intensity_slope: Some(-2.0),
                ..ProsodyFeatures::default()
            }),
        )
        .await;

        f.handler.process(&[item(&id)]).await.unwrap();
        let idea = f.ideas.get(&id).await.unwrap().unwrap();
        let interp = idea.payload.prosody_interpretation.unwrap();
        assert_eq!(interp.is_complete, Some(true));
        assert_eq!(interp.is_question_prosody, Some(false));
    }

    #[tokio::test]
    async fn test_confidence_indicators_thresholds() {
        let f = fixture().await;
        let id = make_idea(
            &f,
            Some(ProsodyFeatures {
                hnr_db: Some(15.0),
                jitter_local: Some(0.01),
                intensity_mean_db: Some(60.0),
                ..ProsodyFeatures::default()
            }),
        )
        .await;

        f.handler.process(&[item(&id)]).await.unwrap();
        let idea = f.ideas.get(&id).await.unwrap().unwrap();
        let indicators = idea
            .payload
            .prosody_interpretation
            .unwrap()
            .confidence_indicators;
        assert_eq!(indicators.voice_clarity.as_deref(), Some("high"));
        assert_eq!(indicators.pitch_stability.as_deref(), Some("stable"));
        assert_eq!(indicators.loudness.as_deref(), Some("low"));
    }

    #[tokio::test]
    async fn test_missing_prosody_still_completes() {
        let f = fixture().await;
        let id = make_idea(&f, None).await;

        let results = f.handler.process(&[item(&id)]).await.unwrap();
        assert_eq!(results, vec![ItemResult::Complete]);

        let idea = f.ideas.get(&id).await.unwrap().unwrap();
        let interp = idea.payload.prosody_interpretation.unwrap();
        assert_eq!(interp.is_complete, None);
        assert_eq!(interp.is_question_prosody, None);
        assert_eq!(
            idea.payload.enrichment_status[task_types::PROSODY_INTERPRETATION],
            EnrichmentState::Complete
        );
    }
}
