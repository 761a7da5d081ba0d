//! End-to-end pipeline test: audio frames in, enriched idea out.
//!
//! Wires the real transcription stage, boundary and exchange detectors,
//! queue, and enrichment worker against an in-memory vector store, an
//! in-memory SQLite database, and stub transcription/embedding/LLM
//! providers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use murmur_core::config::{AudioConfig, BoundaryConfig, EnrichmentConfig, ExchangeConfig};
use murmur_core::error::Result;
use murmur_core::types::{
    task_types, AliasType, AudioFrame, EnrichmentState, Speaker, TranscriptionOutput,
};
use murmur_enrichment::handler::TaskHandler;
use murmur_enrichment::handlers::{
    AliasDetectionHandler, IntentKeywordsHandler, ProsodyInterpretationHandler,
    ResponseMappingHandler,
};
use murmur_enrichment::model_manager::ModelManager;
use murmur_enrichment::worker::EnrichmentWorker;
use murmur_pipeline::boundary::BoundaryDetector;
use murmur_pipeline::exchange::ExchangeDetector;
use murmur_pipeline::session_manager::SessionManager;
use murmur_pipeline::transcription::TranscriptionService;
use murmur_providers::{
    EmbeddingProvider, GenerateOptions, LlmClient, TranscriptionProvider,
};
use murmur_store::aliases::SpeakerAliasRepository;
use murmur_store::db::{init_schema, open_memory_pool};
use murmur_store::exchanges::ExchangeRepository;
use murmur_store::ideas::IdeaRepository;
use murmur_store::queue::EnrichmentQueueRepository;
use murmur_store::sessions::SessionRepository;
use murmur_store::utterances::UtteranceRepository;
use murmur_store::vector::MemoryVectorStore;

const SR: u32 = 16000;

struct FixedTextProvider(&'static str);

#[async_trait]
impl TranscriptionProvider for FixedTextProvider {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<TranscriptionOutput> {
        Ok(TranscriptionOutput {
            text: self.0.to_string(),
            confidence: 0.92,
            language: Some("en".into()),
            duration: Some(samples.len() as f64 / sample_rate as f64),
        })
    }

    async fn transcribe_file(&self, _path: &std::path::Path) -> Result<TranscriptionOutput> {
        unimplemented!("not used")
    }
}

struct StubEmbedder;

#[async_trait]
impl EmbeddingProvider for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(vec![text.len() as f32, 1.0, 0.5])
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::new();
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        3
    }
}

struct ScriptedLlm;

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(
        &self,
        _model: &str,
        _prompt: &str,
        _options: GenerateOptions,
    ) -> Result<String> {
        Ok("INTENT: asking question\nKEYWORDS: review, code".into())
    }

    async fn embed(&self, _model: &str, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![])
    }

    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["phi3:mini".into()])
    }

    async fn health(&self) -> bool {
        true
    }
}

fn voiced_frame(channel: u64, user_id: u64, seconds: f64) -> AudioFrame {
    let n = (seconds * SR as f64) as usize;
    let samples = (0..n)
        .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 160.0 * i as f32 / SR as f32).sin())
        .collect();
    AudioFrame {
        channel_id: channel,
        speaker: Speaker {
            user_id,
            username: format!("user{user_id}"),
            display_name: format!("User {user_id}"),
        },
        samples,
    }
}

#[tokio::test]
async fn test_single_speaker_burst_through_enrichment() {
    let pool = open_memory_pool().await.unwrap();
    init_schema(&pool).await.unwrap();

    let session_repo = SessionRepository::new(pool.clone());
    let utterance_repo = UtteranceRepository::new(pool.clone());
    let alias_repo = SpeakerAliasRepository::new(pool.clone());
    let queue_repo = EnrichmentQueueRepository::new(pool.clone());

    let store = Arc::new(MemoryVectorStore::new());
    let embedder = Arc::new(StubEmbedder);
    let idea_repo = Arc::new(IdeaRepository::new(store.clone(), embedder.clone(), "ideas"));
    let exchange_repo = Arc::new(ExchangeRepository::new(store, embedder, "exchanges"));

    // alias map knows "alex" -> user 42
    alias_repo
        .add(42, "alex", AliasType::Username, 1.0, None)
        .await
        .unwrap();

    let sessions = Arc::new(SessionManager::new(session_repo, 300));
    let exchange_detector = Arc::new(ExchangeDetector::new(
        idea_repo.clone(),
        exchange_repo,
        queue_repo.clone(),
        ExchangeConfig::default(),
    ));
    let boundary = Arc::new(BoundaryDetector::new(
        idea_repo.clone(),
        queue_repo.clone(),
        Some(exchange_detector),
        BoundaryConfig::default(),
    ));
    sessions.add_end_listener(boundary.clone()).await;

    let service = Arc::new(TranscriptionService::new(
        AudioConfig {
            sample_rate: SR,
            silence_threshold_sec: 60.0,
            ..AudioConfig::default()
        },
        Duration::from_secs(5),
        Arc::new(FixedTextProvider("can alex take a look")),
        sessions.clone(),
        utterance_repo.clone(),
        alias_repo.clone(),
        None,
    ));
    service.set_boundary_detector(boundary).await;

    let session_id = sessions.start(1, "general", 9).await.unwrap();
    sessions
        .add_participant(1, 7, "user7", "User 7")
        .await
        .unwrap();

    // Speaker 7 produces three short utterances; the third pending
    // utterance crosses the count boundary and becomes one idea.
    for _ in 0..3 {
        service.add_audio(voiced_frame(1, 7, 1.0)).await;
        service.process(1, 7).await;
    }

    let utterances = utterance_repo.by_session(&session_id, None).await.unwrap();
    assert_eq!(utterances.len(), 3);
    let seqs: Vec<i64> = utterances.iter().map(|u| u.sequence_num).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let ideas = idea_repo.by_session(&session_id, 10).await.unwrap();
    assert_eq!(ideas.len(), 1);
    let idea = &ideas[0];
    assert_eq!(
        idea.payload.utterance_ids,
        utterances.iter().map(|u| u.id).collect::<Vec<_>>()
    );
    assert_eq!(idea.payload.user_id, 7);

    // four enrichment tasks pending for the idea
    let pending = queue_repo.pending(10, None).await.unwrap();
    assert_eq!(pending.len(), 4);
    assert!(pending.iter().all(|t| t.target_id == idea.id));

    // one worker tick runs every handler
    let llm: Arc<dyn LlmClient> = Arc::new(ScriptedLlm);
    let handlers: Vec<Arc<dyn TaskHandler>> = vec![
        Arc::new(AliasDetectionHandler::new(
            alias_repo.clone(),
            idea_repo.clone(),
        )),
        Arc::new(ProsodyInterpretationHandler::new(
            idea_repo.clone(),
            utterance_repo.clone(),
            EnrichmentConfig::default(),
        )),
        Arc::new(ResponseMappingHandler::new(
            idea_repo.clone(),
            EnrichmentConfig::default(),
        )),
        Arc::new(IntentKeywordsHandler::new(
            idea_repo.clone(),
            llm.clone(),
            "phi3:mini",
        )),
    ];
    let worker = EnrichmentWorker::new(
        queue_repo.clone(),
        handlers,
        Arc::new(ModelManager::new(llm)),
        EnrichmentConfig::default(),
    );
    assert_eq!(worker.tick().await.unwrap(), 4);

    for task in queue_repo.pending(10, None).await.unwrap() {
        panic!("task {} still pending", task.task_type);
    }

    let idea = idea_repo.get(&idea.id).await.unwrap().unwrap();
    for task_type in task_types::IDEA_TASKS {
        assert_eq!(
            idea.payload.enrichment_status[task_type],
            EnrichmentState::Complete,
            "{task_type} not complete"
        );
    }

    // mention resolved through the alias map; the speaker is user 7, so
    // alex (42) is a real mention
    let mentions = idea.payload.mentions.as_ref().unwrap();
    assert_eq!(mentions.len(), 1);
    assert_eq!(mentions[0].resolved_user_id, 42);

    assert_eq!(idea.payload.intent.as_deref(), Some("asking question"));
    assert_eq!(
        idea.payload.keywords,
        Some(vec!["review".to_string(), "code".to_string()])
    );

    // the idea's prosody interpretation exists (features came from the
    // synthesized tone)
    assert!(idea.payload.prosody_interpretation.is_some());
}

#[tokio::test]
async fn test_session_end_flushes_pending_state() {
    let pool = open_memory_pool().await.unwrap();
    init_schema(&pool).await.unwrap();

    let session_repo = SessionRepository::new(pool.clone());
    let utterance_repo = UtteranceRepository::new(pool.clone());
    let alias_repo = SpeakerAliasRepository::new(pool.clone());
    let queue_repo = EnrichmentQueueRepository::new(pool.clone());

    let store = Arc::new(MemoryVectorStore::new());
    let embedder = Arc::new(StubEmbedder);
    let idea_repo = Arc::new(IdeaRepository::new(store.clone(), embedder.clone(), "ideas"));

    let sessions = Arc::new(SessionManager::new(session_repo, 300));
    let boundary = Arc::new(BoundaryDetector::new(
        idea_repo.clone(),
        queue_repo,
        None,
        BoundaryConfig::default(),
    ));
    sessions.add_end_listener(boundary.clone()).await;

    let service = Arc::new(TranscriptionService::new(
        AudioConfig {
            sample_rate: SR,
            silence_threshold_sec: 60.0,
            ..AudioConfig::default()
        },
        Duration::from_secs(5),
        Arc::new(FixedTextProvider("a parting thought")),
        sessions.clone(),
        utterance_repo,
        alias_repo,
        None,
    ));
    service.set_boundary_detector(boundary).await;

    let session_id = sessions.start(1, "general", 9).await.unwrap();
    sessions
        .add_participant(1, 7, "user7", "User 7")
        .await
        .unwrap();

    // one utterance stays pending (below every boundary rule)
    service.add_audio(voiced_frame(1, 7, 1.0)).await;
    service.process(1, 7).await;
    assert!(idea_repo.by_session(&session_id, 10).await.unwrap().is_empty());

    // last participant leaving ends the session and flushes the FIFO
    sessions.remove_participant(1, 7).await.unwrap();
    assert_eq!(idea_repo.by_session(&session_id, 10).await.unwrap().len(), 1);
}
