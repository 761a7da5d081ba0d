//! Remote speech-to-text over an OpenAI-compatible transcription endpoint.
//!
//! The lightweight reference provider: samples are wrapped in a WAV
//! container and uploaded as multipart form data, so the only local cost
//! is the encode. Works against any `/v1/audio/transcriptions`-shaped
//! server (OpenAI, Groq, a self-hosted whisper server).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use murmur_core::config::RemoteSttConfig;
use murmur_core::error::Result;
use murmur_core::types::TranscriptionOutput;

use crate::wav::{pcm_to_wav, read_wav_file};
use crate::{f32_to_i16, provider_error, resample_linear, TranscriptionProvider};

const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai";
const DEFAULT_MODEL: &str = "whisper-large-v3-turbo";
const UPLOAD_SAMPLE_RATE: u32 = 16000;

/// Verbose JSON response from the transcription endpoint.
#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<ResponseSegment>,
}

#[derive(Debug, Deserialize)]
struct ResponseSegment {
    #[serde(default)]
    avg_logprob: f64,
}

pub struct RemoteTranscriptionProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl RemoteTranscriptionProvider {
    pub fn new(config: &RemoteSttConfig, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config
                .base_url
                .as_deref()
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: config.resolve_api_key(),
            model: config.model.clone().unwrap_or_else(|| DEFAULT_MODEL.into()),
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/audio/transcriptions", self.base_url)
    }

    async fn upload(&self, wav_data: Vec<u8>) -> Result<TranscriptionOutput> {
        let url = self.endpoint();
        debug!(url = %url, model = %self.model, wav_bytes = wav_data.len(), "Uploading audio for transcription");

        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| provider_error("invalid mime type", e))?;

        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .part("file", part);

        let mut request = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .multipart(form);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(provider_error(
                "transcription API error",
                format!("{status}: {body}"),
            ));
        }

        let parsed: TranscriptionResponse = resp.json().await?;
        Ok(normalise(parsed))
    }
}

/// Collapse the verbose response into the provider contract, deriving
/// confidence from mean segment log-probability as whisper reports it.
fn normalise(resp: TranscriptionResponse) -> TranscriptionOutput {
    let confidence = if resp.segments.is_empty() {
        if resp.text.trim().is_empty() { 0.0 } else { 0.8 }
    } else {
        let mean_logprob =
            resp.segments.iter().map(|s| s.avg_logprob).sum::<f64>() / resp.segments.len() as f64;
        mean_logprob.exp().clamp(0.0, 1.0)
    };

    TranscriptionOutput {
        text: resp.text.trim().to_string(),
        confidence,
        language: resp.language,
        duration: resp.duration,
    }
}

#[async_trait]
impl TranscriptionProvider for RemoteTranscriptionProvider {
    fn name(&self) -> &str {
        "remote"
    }

    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<TranscriptionOutput> {
        let samples = resample_linear(samples, sample_rate, UPLOAD_SAMPLE_RATE);
        let pcm = f32_to_i16(&samples);
        let wav_data = pcm_to_wav(&pcm, UPLOAD_SAMPLE_RATE, 1, 16);
        self.upload(wav_data).await
    }

    async fn transcribe_file(&self, path: &Path) -> Result<TranscriptionOutput> {
        let (samples, sample_rate) = read_wav_file(path)?;
        self.transcribe(&samples, sample_rate).await
    }
}
