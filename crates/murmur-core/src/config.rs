//! Configuration loading and defaults.
//!
//! Every tunable lives here as a typed field with a serde default, so a
//! missing or partial config file always yields a runnable configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MurmurError, Result};

/// Top-level murmur configuration, loaded from a JSON5 file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub boundary: BoundaryConfig,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    #[serde(default)]
    pub transcription: TranscriptionConfig,

    #[serde(default)]
    pub ollama: OllamaConfig,

    #[serde(default)]
    pub qdrant: QdrantConfig,
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Config =
            json5::from_str(&raw).map_err(|e| MurmurError::Config(e.to_string()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL. `mode=rwc` creates the file on first run.
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite://murmur.db?mode=rwc".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Sample rate of inbound frames (the platform's native rate).
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Seconds of audio that make a buffer ready to transcribe.
    #[serde(default = "default_chunk_duration")]
    pub chunk_duration_sec: f64,

    /// Seconds of silence after which a nonempty buffer is stale.
    #[serde(default = "default_silence_threshold")]
    pub silence_threshold_sec: f64,

    /// Drains shorter than this are discarded.
    #[serde(default = "default_min_duration")]
    pub min_duration_sec: f64,

    /// RMS threshold (normalised amplitude) above which a chunk counts as
    /// voiced and refreshes `last_voiced_at`.
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f64,

    /// Drains whose overall RMS falls below this are discarded as silence.
    #[serde(default = "default_residual_silence_rms")]
    pub residual_silence_rms: f64,

    /// Capacity of the bounded ingress queue between the audio callback
    /// thread and the pipeline.
    #[serde(default = "default_ingress_capacity")]
    pub ingress_queue_capacity: usize,

    /// Upper bound on concurrently tracked buffers per channel.
    #[serde(default = "default_max_buffers")]
    pub max_buffers_per_channel: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            chunk_duration_sec: default_chunk_duration(),
            silence_threshold_sec: default_silence_threshold(),
            min_duration_sec: default_min_duration(),
            vad_threshold: default_vad_threshold(),
            residual_silence_rms: default_residual_silence_rms(),
            ingress_queue_capacity: default_ingress_capacity(),
            max_buffers_per_channel: default_max_buffers(),
        }
    }
}

fn default_sample_rate() -> u32 {
    48000
}
fn default_chunk_duration() -> f64 {
    5.0
}
fn default_silence_threshold() -> f64 {
    2.0
}
fn default_min_duration() -> f64 {
    0.5
}
fn default_vad_threshold() -> f64 {
    0.1
}
fn default_residual_silence_rms() -> f64 {
    0.02
}
fn default_ingress_capacity() -> usize {
    256
}
fn default_max_buffers() -> usize {
    32
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seconds of channel inactivity before a session is abandoned.
    #[serde(default = "default_session_timeout")]
    pub timeout_sec: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_sec: default_session_timeout(),
        }
    }
}

fn default_session_timeout() -> i64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Silence gap (ms) that, together with a speaker change, closes the
    /// previous speaker's pending idea.
    #[serde(default = "default_boundary_silence_ms")]
    pub idea_boundary_silence_ms: i64,

    /// Hard cap on an idea's span in seconds.
    #[serde(default = "default_idea_max_duration")]
    pub idea_max_duration_sec: f64,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            idea_boundary_silence_ms: default_boundary_silence_ms(),
            idea_max_duration_sec: default_idea_max_duration(),
        }
    }
}

fn default_boundary_silence_ms() -> i64 {
    800
}
fn default_idea_max_duration() -> f64 {
    60.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Max gap (ms) between same-speaker ideas for a temporal join.
    #[serde(default = "default_temporal_join_gap_ms")]
    pub temporal_join_gap_ms: i64,

    /// Max total span (ms) of a temporal-join exchange.
    #[serde(default = "default_exchange_gap_threshold_ms")]
    pub exchange_gap_threshold_ms: i64,

    /// Max gap (ms) between ideas in a multi-speaker response chain.
    #[serde(default = "default_semantic_gap_ms")]
    pub semantic_gap_ms: i64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            temporal_join_gap_ms: default_temporal_join_gap_ms(),
            exchange_gap_threshold_ms: default_exchange_gap_threshold_ms(),
            semantic_gap_ms: default_semantic_gap_ms(),
        }
    }
}

fn default_temporal_join_gap_ms() -> i64 {
    5000
}
fn default_exchange_gap_threshold_ms() -> i64 {
    30000
}
fn default_semantic_gap_ms() -> i64 {
    10000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    #[serde(default = "default_true")]
    pub worker_enabled: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_sec: u64,

    /// Tasks re-delivered this many times stay failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,

    /// Tasks stuck in `processing` longer than this are reclaimed.
    #[serde(default = "default_stale_task_max_age")]
    pub stale_task_max_age_sec: i64,

    /// How often the stale-reclaim sweep runs.
    #[serde(default = "default_stale_reset_interval")]
    pub stale_reset_interval_sec: u64,

    /// Max latency (ms) for response mapping to link two ideas.
    #[serde(default = "default_response_threshold_ms")]
    pub response_mapping_time_threshold_ms: f64,

    /// Latency (ms) under which a response is linked even when the prior
    /// idea did not read as complete.
    #[serde(default = "default_response_quick_latency_ms")]
    pub response_quick_latency_ms: f64,

    /// Final pitch slope (Hz/s) above which prosody reads as a question.
    #[serde(default = "default_question_pitch_slope")]
    pub question_pitch_slope_hz_per_sec: f64,

    /// Final pitch slope (Hz/s) below which an utterance reads complete.
    #[serde(default = "default_complete_pitch_slope")]
    pub complete_pitch_slope_hz_per_sec: f64,

    /// Final intensity slope (dB/s) below which an utterance reads complete.
    #[serde(default = "default_complete_intensity_slope")]
    pub complete_intensity_slope_db_per_sec: f64,

    /// HNR (dB) at or above which the voice reads as clear.
    #[serde(default = "default_clear_voice_hnr")]
    pub clear_voice_hnr_db: f64,

    /// Jitter below which pitch reads as stable.
    #[serde(default = "default_stable_jitter")]
    pub stable_jitter: f64,

    /// Mean intensity (dB) above which the speaker reads as loud.
    #[serde(default = "default_loud_intensity")]
    pub loud_intensity_db: f64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            worker_enabled: true,
            batch_size: default_batch_size(),
            poll_interval_sec: default_poll_interval(),
            max_attempts: default_max_attempts(),
            stale_task_max_age_sec: default_stale_task_max_age(),
            stale_reset_interval_sec: default_stale_reset_interval(),
            response_mapping_time_threshold_ms: default_response_threshold_ms(),
            response_quick_latency_ms: default_response_quick_latency_ms(),
            question_pitch_slope_hz_per_sec: default_question_pitch_slope(),
            complete_pitch_slope_hz_per_sec: default_complete_pitch_slope(),
            complete_intensity_slope_db_per_sec: default_complete_intensity_slope(),
            clear_voice_hnr_db: default_clear_voice_hnr(),
            stable_jitter: default_stable_jitter(),
            loud_intensity_db: default_loud_intensity(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_batch_size() -> usize {
    10
}
fn default_poll_interval() -> u64 {
    5
}
fn default_max_attempts() -> i32 {
    5
}
fn default_stale_task_max_age() -> i64 {
    1800
}
fn default_stale_reset_interval() -> u64 {
    300
}
fn default_response_threshold_ms() -> f64 {
    5000.0
}
fn default_response_quick_latency_ms() -> f64 {
    1000.0
}
fn default_question_pitch_slope() -> f64 {
    5.0
}
fn default_complete_pitch_slope() -> f64 {
    -5.0
}
fn default_complete_intensity_slope() -> f64 {
    -1.0
}
fn default_clear_voice_hnr() -> f64 {
    15.0
}
fn default_stable_jitter() -> f64 {
    0.02
}
fn default_loud_intensity() -> f64 {
    65.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    /// `"whisper"` (local neural) or `"remote"` (HTTP endpoint).
    #[serde(default = "default_stt_provider")]
    pub provider: String,

    /// Path to the whisper GGML model file.
    #[serde(default = "default_whisper_model_path")]
    pub whisper_model_path: String,

    /// Language bias, e.g. `"en"`. `None` lets the model detect.
    #[serde(default)]
    pub language: Option<String>,

    /// Remote endpoint settings, used when `provider = "remote"`.
    #[serde(default)]
    pub remote: RemoteSttConfig,

    /// Per-call transcription timeout in seconds.
    #[serde(default = "default_stt_timeout")]
    pub request_timeout_sec: u64,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            provider: default_stt_provider(),
            whisper_model_path: default_whisper_model_path(),
            language: None,
            remote: RemoteSttConfig::default(),
            request_timeout_sec: default_stt_timeout(),
        }
    }
}

fn default_stt_provider() -> String {
    "whisper".into()
}
fn default_whisper_model_path() -> String {
    "models/ggml-base.en.bin".into()
}
fn default_stt_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteSttConfig {
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub model: Option<String>,
}

impl RemoteSttConfig {
    /// Resolve the API key: the direct field wins, then the named env var.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,

    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    /// Dimension of the embedding model's vectors.
    #[serde(default = "default_embed_dimension")]
    pub embed_dimension: usize,

    #[serde(default = "default_generate_timeout")]
    pub generate_timeout_sec: u64,

    #[serde(default = "default_embed_timeout")]
    pub embed_timeout_sec: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_url(),
            chat_model: default_chat_model(),
            embed_model: default_embed_model(),
            embed_dimension: default_embed_dimension(),
            generate_timeout_sec: default_generate_timeout(),
            embed_timeout_sec: default_embed_timeout(),
        }
    }
}

fn default_ollama_url() -> String {
    "http://localhost:11434".into()
}
fn default_chat_model() -> String {
    "phi3:mini".into()
}
fn default_embed_model() -> String {
    "nomic-embed-text".into()
}
fn default_embed_dimension() -> usize {
    768
}
fn default_generate_timeout() -> u64 {
    60
}
fn default_embed_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QdrantConfig {
    #[serde(default = "default_qdrant_url")]
    pub url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_ideas_collection")]
    pub ideas_collection: String,

    #[serde(default = "default_exchanges_collection")]
    pub exchanges_collection: String,

    #[serde(default = "default_utterances_collection")]
    pub utterances_collection: String,

    #[serde(default = "default_qdrant_timeout")]
    pub request_timeout_sec: u64,
}

impl QdrantConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: default_qdrant_url(),
            api_key: None,
            api_key_env: None,
            ideas_collection: default_ideas_collection(),
            exchanges_collection: default_exchanges_collection(),
            utterances_collection: default_utterances_collection(),
            request_timeout_sec: default_qdrant_timeout(),
        }
    }
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".into()
}
fn default_ideas_collection() -> String {
    "ideas".into()
}
fn default_exchanges_collection() -> String {
    "exchanges".into()
}
fn default_utterances_collection() -> String {
    "utterances".into()
}
fn default_qdrant_timeout() -> u64 {
    10
}

/// Resolve a secret: direct field first, then the named environment variable.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}
