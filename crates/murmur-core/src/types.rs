//! Domain types shared across the pipeline.
//!
//! The relational store owns sessions, participants, utterances, messages,
//! aliases, and the enrichment queue. The vector store owns ideas and
//! exchanges. The two sides reference each other only through opaque ids.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a voice session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "ended" => Some(Self::Ended),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// A voice-channel session with its participant roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub channel_id: u64,
    pub channel_name: String,
    pub guild_id: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: u64,
    pub username: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// Identity attached to every inbound audio frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaker {
    pub user_id: u64,
    pub username: String,
    pub display_name: String,
}

/// One chunk of mono float samples from the voice receive path,
/// already keyed by channel and speaker.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub channel_id: u64,
    pub speaker: Speaker,
    pub samples: Vec<f32>,
}

/// Normalised output of a transcription provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionOutput {
    pub text: String,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub language: Option<String>,
    /// Seconds of audio the provider saw, if it reports one.
    pub duration: Option<f64>,
}

/// A single transcription unit from one drain of one speaker's buffer.
/// Immutable once persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utterance {
    pub id: i64,
    pub session_id: String,
    pub user_id: u64,
    pub username: String,
    pub display_name: String,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub confidence: f64,
    /// Seconds.
    pub audio_duration: f64,
    /// Monotone within a session, allocated by the repository.
    pub sequence_num: i64,
    pub prosody: Option<ProsodyFeatures>,
}

/// Acoustic features extracted from a drained buffer. Any field may be
/// absent when extraction fails for that feature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProsodyFeatures {
    pub pitch_mean_hz: Option<f64>,
    pub pitch_min_hz: Option<f64>,
    pub pitch_max_hz: Option<f64>,
    pub pitch_stdev: Option<f64>,
    pub pitch_range_hz: Option<f64>,
    /// Hz per second over the final window of the utterance.
    pub final_pitch_slope: Option<f64>,
    pub intensity_mean_db: Option<f64>,
    pub intensity_max_db: Option<f64>,
    pub intensity_stdev: Option<f64>,
    /// dB per second over the final window of the utterance.
    pub final_intensity_slope: Option<f64>,
    pub jitter_local: Option<f64>,
    pub shimmer_local: Option<f64>,
    pub hnr_db: Option<f64>,
    pub voiced_fraction: Option<f64>,
    pub pause_count: Option<u32>,
    pub total_pause_duration_ms: Option<f64>,
}

/// A mention of another speaker resolved through the alias map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub alias: String,
    pub resolved_user_id: u64,
    pub confidence: f64,
}

/// Semantic indicators derived from the final utterance's prosody.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProsodyInterpretation {
    pub is_complete: Option<bool>,
    pub is_question_prosody: Option<bool>,
    pub confidence_indicators: ConfidenceIndicators,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceIndicators {
    /// `"high"` or `"low"`, from HNR.
    pub voice_clarity: Option<String>,
    /// `"stable"` or `"unstable"`, from jitter.
    pub pitch_stability: Option<String>,
    /// `"high"` or `"low"`, from mean intensity.
    pub loudness: Option<String>,
}

/// Per-task-type enrichment state tracked on ideas and exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentState {
    Pending,
    Complete,
    Failed,
}

/// Payload of an idea point in the vector store.
///
/// Core fields (`utterance_ids` through `ended_at`) are immutable after
/// creation; enrichment fields are populated by workers, each in a single
/// point upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeaPayload {
    pub utterance_ids: Vec<i64>,
    pub session_id: String,
    pub user_id: u64,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,

    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub mentions: Option<Vec<Mention>>,
    #[serde(default)]
    pub is_response_to_idea_id: Option<String>,
    #[serde(default)]
    pub response_latency_ms: Option<f64>,
    #[serde(default)]
    pub prosody_interpretation: Option<ProsodyInterpretation>,

    #[serde(default)]
    pub enrichment_status: BTreeMap<String, EnrichmentState>,
}

impl IdeaPayload {
    /// Fresh payload with every idea enrichment marked pending.
    pub fn new(
        utterance_ids: Vec<i64>,
        session_id: String,
        user_id: u64,
        text: String,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let enrichment_status = task_types::IDEA_TASKS
            .iter()
            .map(|t| (t.to_string(), EnrichmentState::Pending))
            .collect();
        Self {
            utterance_ids,
            session_id,
            user_id,
            text,
            started_at,
            ended_at,
            intent: None,
            keywords: None,
            mentions: None,
            is_response_to_idea_id: None,
            response_latency_ms: None,
            prosody_interpretation: None,
            enrichment_status,
        }
    }
}

/// An idea as stored: point id, embedding, payload.
#[derive(Debug, Clone)]
pub struct Idea {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: IdeaPayload,
}

/// How a group of ideas was promoted into an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    TemporalJoin,
    SemanticRelation,
    SessionEnd,
}

/// Payload of an exchange point in the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePayload {
    pub idea_ids: Vec<String>,
    pub session_id: String,
    pub participant_user_ids: Vec<u64>,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub kind: ExchangeKind,

    #[serde(default)]
    pub topics: Option<Vec<String>>,
    #[serde(default)]
    pub enrichment_status: BTreeMap<String, EnrichmentState>,
}

impl ExchangePayload {
    pub fn new(
        idea_ids: Vec<String>,
        session_id: String,
        participant_user_ids: Vec<u64>,
        text: String,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        kind: ExchangeKind,
    ) -> Self {
        let enrichment_status = [(
            task_types::TOPIC_EXTRACTION.to_string(),
            EnrichmentState::Pending,
        )]
        .into_iter()
        .collect();
        Self {
            idea_ids,
            session_id,
            participant_user_ids,
            text,
            started_at,
            ended_at,
            kind,
            topics: None,
            enrichment_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Exchange {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ExchangePayload,
}

/// Where an alias came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasType {
    Username,
    DisplayName,
    Nickname,
    Mention,
}

impl AliasType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Username => "username",
            Self::DisplayName => "display_name",
            Self::Nickname => "nickname",
            Self::Mention => "mention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "username" => Some(Self::Username),
            "display_name" => Some(Self::DisplayName),
            "nickname" => Some(Self::Nickname),
            "mention" => Some(Self::Mention),
            _ => None,
        }
    }
}

/// A string that resolves to a user id, unique per user case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerAlias {
    pub id: i64,
    pub user_id: u64,
    pub alias: String,
    pub alias_type: AliasType,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    /// User who added the alias; `None` when auto-seeded.
    pub created_by: Option<u64>,
}

/// Kind of entity an enrichment task targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Idea,
    Exchange,
    Session,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idea => "idea",
            Self::Exchange => "exchange",
            Self::Session => "session",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idea" => Some(Self::Idea),
            "exchange" => Some(Self::Exchange),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

/// Queue-row state. `Complete` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of the durable enrichment queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentTask {
    pub id: Uuid,
    pub target_type: TargetType,
    pub target_id: String,
    pub task_type: String,
    /// Lower is more urgent.
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub error: Option<String>,
}

/// A logged text-chat message, optionally linked to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message_id: u64,
    pub channel_id: u64,
    pub user_id: u64,
    pub username: String,
    pub display_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub reply_to_message_id: Option<u64>,
}

/// Well-known enrichment task types.
pub mod task_types {
    pub const ALIAS_DETECTION: &str = "alias_detection";
    pub const PROSODY_INTERPRETATION: &str = "prosody_interpretation";
    pub const RESPONSE_MAPPING: &str = "response_mapping";
    pub const INTENT_KEYWORDS: &str = "intent_keywords";
    pub const TOPIC_EXTRACTION: &str = "topic_extraction";

    /// Tasks enqueued for every new idea.
    pub const IDEA_TASKS: [&str; 4] = [
        ALIAS_DETECTION,
        PROSODY_INTERPRETATION,
        RESPONSE_MAPPING,
        INTENT_KEYWORDS,
    ];
}
