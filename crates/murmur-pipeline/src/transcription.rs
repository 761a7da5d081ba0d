//! The transcription stage: per-speaker buffers in, persisted utterances out.
//!
//! One audio buffer per `(channel, speaker)`, guarded by a per-entry lock
//! stored alongside the map. Each drain runs under a per-key processing
//! lock, so utterances for a fixed key persist in arrival order and
//! `sequence_num` stays monotone. Provider hot swap drains every buffer
//! with the outgoing provider before the reference is replaced.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use murmur_audio::buffer::{AudioBuffer, DrainedAudio};
use murmur_audio::ingress::FrameSink;
use murmur_audio::prosody::ProsodyExtractor;
use murmur_core::config::AudioConfig;
use murmur_core::types::{AudioFrame, Speaker};
use murmur_providers::TranscriptionProvider;
use murmur_store::aliases::SpeakerAliasRepository;
use murmur_store::utterance_index::UtteranceIndex;
use murmur_store::utterances::{NewUtterance, UtteranceRepository};

use crate::boundary::BoundaryDetector;
use crate::session_manager::SessionManager;

/// Outcome of a provider hot swap.
#[derive(Debug, Clone)]
pub struct SwapReport {
    pub old_provider: String,
    pub new_provider: String,
    pub buffers_processed: usize,
}

struct SpeakerBuffer {
    speaker: Speaker,
    buffer: AudioBuffer,
}

struct BufferSlot {
    /// Guards append and drain; held only briefly.
    state: Mutex<SpeakerBuffer>,
    /// Serialises the whole drain-transcribe-persist pipeline per key.
    process: Mutex<()>,
}

pub struct TranscriptionService {
    config: AudioConfig,
    request_timeout: Duration,
    provider: RwLock<Arc<dyn TranscriptionProvider>>,
    sessions: Arc<SessionManager>,
    utterances: UtteranceRepository,
    aliases: SpeakerAliasRepository,
    boundary: RwLock<Option<Arc<BoundaryDetector>>>,
    index: Option<Arc<UtteranceIndex>>,
    prosody: Arc<ProsodyExtractor>,
    buffers: Mutex<HashMap<(u64, u64), Arc<BufferSlot>>>,
    swap_lock: Mutex<()>,
}

impl TranscriptionService {
    pub fn new(
        config: AudioConfig,
        request_timeout: Duration,
        provider: Arc<dyn TranscriptionProvider>,
        sessions: Arc<SessionManager>,
        utterances: UtteranceRepository,
        aliases: SpeakerAliasRepository,
        index: Option<Arc<UtteranceIndex>>,
    ) -> Self {
        Self {
            config,
            request_timeout,
            provider: RwLock::new(provider),
            sessions,
            utterances,
            aliases,
            boundary: RwLock::new(None),
            index,
            prosody: Arc::new(ProsodyExtractor::default()),
            buffers: Mutex::new(HashMap::new()),
            swap_lock: Mutex::new(()),
        }
    }

    /// Attach the post-commit boundary hook. Set once at wiring time; the
    /// detector needs the service's output, hence the late bind.
    pub async fn set_boundary_detector(&self, detector: Arc<BoundaryDetector>) {
        *self.boundary.write().await = Some(detector);
    }

    pub async fn current_provider_name(&self) -> String {
        self.provider.read().await.name().to_string()
    }

    /// Buffer one frame; triggers a drain when the buffer turns ready or
    /// has gone stale.
    pub async fn add_audio(&self, frame: AudioFrame) {
        let key = (frame.channel_id, frame.speaker.user_id);

        let slot = {
            let mut buffers = self.buffers.lock().await;
            if !buffers.contains_key(&key) {
                let in_channel = buffers
                    .keys()
                    .filter(|(channel, _)| *channel == frame.channel_id)
                    .count();
                if in_channel >= self.config.max_buffers_per_channel {
                    warn!(
                        channel_id = frame.channel_id,
                        user_id = frame.speaker.user_id,
                        "Buffer cap reached for channel, dropping frame"
                    );
                    return;
                }
                buffers.insert(
                    key,
                    Arc::new(BufferSlot {
                        state: Mutex::new(SpeakerBuffer {
                            speaker: frame.speaker.clone(),
                            buffer: AudioBuffer::new(),
                        }),
                        process: Mutex::new(()),
                    }),
                );
                debug!(
                    channel_id = frame.channel_id,
                    user_id = frame.speaker.user_id,
                    "Created audio buffer"
                );
            }
            buffers.get(&key).expect("just inserted").clone()
        };

        let (ready, stale) = {
            let mut state = slot.state.lock().await;
            state
                .buffer
                .append(frame.samples, self.config.vad_threshold);
            (
                state
                    .buffer
                    .is_ready(self.config.sample_rate, self.config.chunk_duration_sec),
                state.buffer.is_stale(self.config.silence_threshold_sec),
            )
        };

        self.sessions.record_activity(frame.channel_id).await;

        if ready || stale {
            self.process(frame.channel_id, frame.speaker.user_id).await;
        }
    }

    /// Drain and transcribe one speaker's buffer, persisting the result.
    /// Serialised per key; concurrent calls for the same key queue up.
    pub async fn process(&self, channel_id: u64, user_id: u64) {
        let slot = {
            let buffers = self.buffers.lock().await;
            match buffers.get(&(channel_id, user_id)) {
                Some(slot) => slot.clone(),
                None => return,
            }
        };
        let _guard = slot.process.lock().await;

        let Some(session_id) = self.sessions.active_session(channel_id).await else {
            // No session to attach to; the audio is ephemeral.
            let mut state = slot.state.lock().await;
            if state.buffer.drain().is_some() {
                warn!(channel_id, user_id, "No active session, discarding buffer");
            }
            return;
        };

        let (speaker, drained) = {
            let mut state = slot.state.lock().await;
            let speaker = state.speaker.clone();
            match state.buffer.drain() {
                Some(drained) => (speaker, drained),
                None => return,
            }
        };

        self.transcribe_drained(&session_id, channel_id, speaker, drained)
            .await;
    }

    async fn transcribe_drained(
        &self,
        session_id: &str,
        channel_id: u64,
        speaker: Speaker,
        drained: DrainedAudio,
    ) {
        let sample_rate = self.config.sample_rate;
        let duration = drained.samples.len() as f64 / sample_rate as f64;

        if duration < self.config.min_duration_sec {
            debug!(duration, "Skipping short audio clip");
            return;
        }

        let rms = AudioBuffer::rms(&drained.samples);
        if rms < self.config.residual_silence_rms {
            debug!(rms, user_id = speaker.user_id, "Skipping silent buffer");
            return;
        }

        let provider = self.provider.read().await.clone();
        let result = match tokio::time::timeout(
            self.request_timeout,
            provider.transcribe(&drained.samples, sample_rate),
        )
        .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                error!(provider = provider.name(), error = %e, "Transcription failed, dropping audio");
                return;
            }
            Err(_) => {
                error!(provider = provider.name(), "Transcription timed out, dropping audio");
                return;
            }
        };

        let text = result.text.trim().to_string();
        if text.is_empty() {
            debug!("Transcription produced empty text");
            return;
        }

        let prosody = {
            let extractor = self.prosody.clone();
            let samples = drained.samples;
            tokio::task::spawn_blocking(move || extractor.extract(&samples, sample_rate))
                .await
                .ok()
        };

        let utterance = match self
            .utterances
            .create(NewUtterance {
                session_id: session_id.to_string(),
                user_id: speaker.user_id,
                username: speaker.username.clone(),
                display_name: speaker.display_name.clone(),
                text: text.clone(),
                started_at: drained.started_at,
                ended_at: drained.ended_at,
                confidence: result.confidence,
                audio_duration: duration,
                prosody,
            })
            .await
        {
            Ok(utterance) => utterance,
            Err(e) => {
                error!(error = %e, "Failed to persist utterance");
                return;
            }
        };

        info!(
            utterance_id = utterance.id,
            seq = utterance.sequence_num,
            provider = provider.name(),
            username = %speaker.username,
            confidence = result.confidence,
            channel_id,
            "Transcribed utterance"
        );

        if let Err(e) = self
            .aliases
            .auto_seed(speaker.user_id, &speaker.username, &speaker.display_name)
            .await
        {
            warn!(user_id = speaker.user_id, error = %e, "Alias auto-seed failed");
        }

        // Post-commit hook: boundary detection runs only after the row is
        // durable.
        if let Some(boundary) = self.boundary.read().await.clone() {
            boundary.handle_utterance(&utterance).await;
        }

        if let Some(index) = &self.index {
            if let Err(e) = index.index_utterance(&utterance).await {
                warn!(utterance_id = utterance.id, error = %e, "Utterance embedding failed");
            }
        }
    }

    /// Force-process every nonempty buffer in a channel (speaker left,
    /// session ending).
    pub async fn flush_channel(&self, channel_id: u64) {
        for (channel, user) in self.keys().await {
            if channel == channel_id {
                self.process(channel, user).await;
            }
        }
    }

    /// Force-process every nonempty buffer (shutdown path).
    pub async fn flush_all(&self) {
        for (channel, user) in self.keys().await {
            self.process(channel, user).await;
        }
    }

    /// Hot-swap the transcription provider. Every in-flight buffer is
    /// drained with the current provider first; only then is the reference
    /// replaced, so no drain ever sees a torn swap.
    pub async fn swap_provider(&self, new: Arc<dyn TranscriptionProvider>) -> SwapReport {
        let _swap = self.swap_lock.lock().await;

        let old_name = self.current_provider_name().await;
        let new_name = new.name().to_string();
        info!(old = %old_name, new = %new_name, "Starting provider swap");

        let mut buffers_processed = 0;
        for (channel, user) in self.keys().await {
            let nonempty = {
                let buffers = self.buffers.lock().await;
                match buffers.get(&(channel, user)) {
                    Some(slot) => !slot.state.lock().await.buffer.is_empty(),
                    None => false,
                }
            };
            if nonempty {
                self.process(channel, user).await;
                buffers_processed += 1;
            }
        }

        *self.provider.write().await = new;
        info!(old = %old_name, new = %new_name, buffers_processed, "Provider swap complete");

        SwapReport {
            old_provider: old_name,
            new_provider: new_name,
            buffers_processed,
        }
    }

    /// Cooperative 1 Hz tick draining buffers that have gone stale.
    pub fn start_monitor(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            info!("Stale-buffer monitor started");
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => self.drain_stale().await,
                }
            }
            info!("Stale-buffer monitor stopped");
        });
    }

    async fn drain_stale(&self) {
        for (channel, user) in self.keys().await {
            let stale = {
                let buffers = self.buffers.lock().await;
                match buffers.get(&(channel, user)) {
                    Some(slot) => {
                        let state = slot.state.lock().await;
                        !state.buffer.is_empty()
                            && state.buffer.is_stale(self.config.silence_threshold_sec)
                    }
                    None => false,
                }
            };
            if stale {
                debug!(channel_id = channel, user_id = user, "Draining stale buffer");
                self.process(channel, user).await;
            }
        }
    }

    async fn keys(&self) -> Vec<(u64, u64)> {
        self.buffers.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl FrameSink for TranscriptionService {
    async fn deliver(&self, frame: AudioFrame) {
        self.add_audio(frame).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::error::Result as CoreResult;
    use murmur_core::types::TranscriptionOutput;
    use murmur_store::db::{init_schema, open_memory_pool};
    use murmur_store::sessions::SessionRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Provider that returns a fixed transcript and counts invocations.
    struct StubProvider {
        name: &'static str,
        text: String,
        calls: AtomicUsize,
    }

    impl StubProvider {
        fn new(name: &'static str, text: &str) -> Arc<Self> {
            Arc::new(Self {
                name,
                text: text.into(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TranscriptionProvider for StubProvider {
        fn name(&self) -> &str {
            self.name
        }

        async fn transcribe(
            &self,
            samples: &[f32],
            sample_rate: u32,
        ) -> CoreResult<TranscriptionOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TranscriptionOutput {
                text: self.text.clone(),
                confidence: 0.9,
                language: Some("en".into()),
                duration: Some(samples.len() as f64 / sample_rate as f64),
            })
        }

        async fn transcribe_file(
            &self,
            _path: &std::path::Path,
        ) -> CoreResult<TranscriptionOutput> {
            unimplemented!("not used in tests")
        }
    }

    const SR: u32 = 16000;

    fn test_config() -> AudioConfig {
        AudioConfig {
            sample_rate: SR,
            chunk_duration_sec: 5.0,
            silence_threshold_sec: 60.0, // staleness never triggers in tests
            min_duration_sec: 0.5,
            ..AudioConfig::default()
        }
    }

    struct Fixture {
        service: Arc<TranscriptionService>,
        sessions: Arc<SessionManager>,
        utterances: UtteranceRepository,
        aliases: SpeakerAliasRepository,
    }

    async fn fixture(provider: Arc<dyn TranscriptionProvider>) -> Fixture {
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();

        let sessions = Arc::new(SessionManager::new(
            SessionRepository::new(pool.clone()),
            300,
        ));
        let utterances = UtteranceRepository::new(pool.clone());
        let aliases = SpeakerAliasRepository::new(pool);

        let service = Arc::new(TranscriptionService::new(
            test_config(),
            Duration::from_secs(5),
            provider,
            sessions.clone(),
            utterances.clone(),
            aliases.clone(),
            None,
        ));
        Fixture {
            service,
            sessions,
            utterances,
            aliases,
        }
    }

    fn speaker(user_id: u64) -> Speaker {
        Speaker {
            user_id,
            username: format!("user{user_id}"),
            display_name: format!("User {user_id}"),
        }
    }

    fn voiced_frame(channel: u64, user_id: u64, seconds: f64) -> AudioFrame {
        let n = (seconds * SR as f64) as usize;
        let samples = (0..n)
            .map(|i| 0.5 * (2.0 * std::f32::consts::PI * 150.0 * i as f32 / SR as f32).sin())
            .collect();
        AudioFrame {
            channel_id: channel,
            speaker: speaker(user_id),
            samples,
        }
    }

    fn silent_frame(channel: u64, user_id: u64, seconds: f64) -> AudioFrame {
        AudioFrame {
            channel_id: channel,
            speaker: speaker(user_id),
            samples: vec![0.001; (seconds * SR as f64) as usize],
        }
    }

    #[tokio::test]
    async fn test_drain_persists_utterance_and_seeds_aliases() {
        let provider = StubProvider::new("stub", "hello there");
        let f = fixture(provider.clone()).await;
        f.sessions.start(1, "general", 9).await.unwrap();

        f.service.add_audio(voiced_frame(1, 7, 1.0)).await;
        f.service.process(1, 7).await;

        let session = f.sessions.active_session(1).await.unwrap();
        let rows = f.utterances.by_session(&session, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "hello there");
        assert_eq!(rows[0].sequence_num, 1);
        assert!((rows[0].audio_duration - 1.0).abs() < 0.01);
        assert!(rows[0].prosody.is_some());

        // first utterance seeded the speaker's aliases
        assert_eq!(f.aliases.for_user(7).await.unwrap().len(), 2);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_short_buffer_discarded() {
        let provider = StubProvider::new("stub", "should not appear");
        let f = fixture(provider.clone()).await;
        f.sessions.start(1, "general", 9).await.unwrap();

        f.service.add_audio(voiced_frame(1, 7, 0.2)).await;
        f.service.process(1, 7).await;

        let session = f.sessions.active_session(1).await.unwrap();
        assert!(f.utterances.by_session(&session, None).await.unwrap().is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_silent_buffer_discarded() {
        let provider = StubProvider::new("stub", "should not appear");
        let f = fixture(provider.clone()).await;
        f.sessions.start(1, "general", 9).await.unwrap();

        f.service.add_audio(silent_frame(1, 7, 2.0)).await;
        f.service.process(1, 7).await;

        let session = f.sessions.active_session(1).await.unwrap();
        assert!(f.utterances.by_session(&session, None).await.unwrap().is_empty());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_whitespace_transcription_discarded() {
        let provider = StubProvider::new("stub", "   ");
        let f = fixture(provider.clone()).await;
        f.sessions.start(1, "general", 9).await.unwrap();

        f.service.add_audio(voiced_frame(1, 7, 1.0)).await;
        f.service.process(1, 7).await;

        let session = f.sessions.active_session(1).await.unwrap();
        assert!(f.utterances.by_session(&session, None).await.unwrap().is_empty());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_no_session_discards_buffer() {
        let provider = StubProvider::new("stub", "orphan");
        let f = fixture(provider.clone()).await;
        // no session started

        f.service.add_audio(voiced_frame(1, 7, 1.0)).await;
        f.service.process(1, 7).await;

        assert_eq!(provider.calls(), 0);
        // buffer was discarded, not retained
        f.sessions.start(1, "general", 9).await.unwrap();
        f.service.process(1, 7).await;
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase_per_drain() {
        let provider = StubProvider::new("stub", "line");
        let f = fixture(provider).await;
        f.sessions.start(1, "general", 9).await.unwrap();

        for _ in 0..3 {
            f.service.add_audio(voiced_frame(1, 7, 1.0)).await;
            f.service.process(1, 7).await;
        }

        let session = f.sessions.active_session(1).await.unwrap();
        let rows = f.utterances.by_session(&session, None).await.unwrap();
        let seqs: Vec<i64> = rows.iter().map(|u| u.sequence_num).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_ready_buffer_processes_inline() {
        let provider = StubProvider::new("stub", "long monologue");
        let f = fixture(provider.clone()).await;
        f.sessions.start(1, "general", 9).await.unwrap();

        // 6 s of voiced audio crosses the 5 s chunk threshold during append
        for _ in 0..6 {
            f.service.add_audio(voiced_frame(1, 7, 1.0)).await;
        }
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_hot_swap_drains_with_old_provider() {
        let old_provider = StubProvider::new("old", "from the old model");
        let new_provider = StubProvider::new("new", "from the new model");
        let f = fixture(old_provider.clone()).await;
        f.sessions.start(1, "general", 9).await.unwrap();

        // three speakers, each with 1.2 s buffered
        for user in [7u64, 8, 9] {
            f.service.add_audio(voiced_frame(1, user, 1.2)).await;
        }

        let report = f.service.swap_provider(new_provider.clone()).await;
        assert_eq!(report.old_provider, "old");
        assert_eq!(report.new_provider, "new");
        assert_eq!(report.buffers_processed, 3);
        assert_eq!(old_provider.calls(), 3);
        assert_eq!(new_provider.calls(), 0);

        let session = f.sessions.active_session(1).await.unwrap();
        let rows = f.utterances.by_session(&session, None).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|u| u.text == "from the old model"));

        // audio arriving after the swap uses the new provider
        f.service.add_audio(voiced_frame(1, 7, 1.0)).await;
        f.service.process(1, 7).await;
        assert_eq!(new_provider.calls(), 1);
        assert_eq!(f.service.current_provider_name().await, "new");
    }

    #[tokio::test]
    async fn test_buffer_cap_per_channel() {
        let provider = StubProvider::new("stub", "x");
        let pool = open_memory_pool().await.unwrap();
        init_schema(&pool).await.unwrap();
        let sessions = Arc::new(SessionManager::new(
            SessionRepository::new(pool.clone()),
            300,
        ));
        let service = TranscriptionService::new(
            AudioConfig {
                max_buffers_per_channel: 2,
                ..test_config()
            },
            Duration::from_secs(5),
            provider,
            sessions,
            UtteranceRepository::new(pool.clone()),
            SpeakerAliasRepository::new(pool),
            None,
        );

        service.add_audio(voiced_frame(1, 1, 0.1)).await;
        service.add_audio(voiced_frame(1, 2, 0.1)).await;
        service.add_audio(voiced_frame(1, 3, 0.1)).await; // over the cap

        assert_eq!(service.keys().await.len(), 2);
    }
}
