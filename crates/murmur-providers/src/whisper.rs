//! Local neural speech-to-text via whisper-rs (ggml whisper).
//!
//! GPU-biased when built with the corresponding whisper-rs features;
//! inference runs on a blocking thread so the pipeline stays responsive.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use murmur_core::error::Result;
use murmur_core::types::TranscriptionOutput;

use crate::wav::read_wav_file;
use crate::{provider_error, resample_linear, TranscriptionProvider};

/// Sample rate whisper models are trained on.
const WHISPER_SAMPLE_RATE: u32 = 16000;

/// Aggregate confidence reported for non-empty output. The ggml whisper
/// API does not surface one, so this mirrors the fixed estimate used for
/// engines without native confidence.
const ESTIMATED_CONFIDENCE: f64 = 0.85;

pub struct WhisperProvider {
    context: Arc<WhisperContext>,
    language: Option<String>,
}

impl WhisperProvider {
    /// Load a ggml model from `model_path`.
    pub fn new(model_path: &str, language: Option<String>) -> Result<Self> {
        info!(model_path, "Loading whisper model");
        let context =
            WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                .map_err(|e| provider_error("failed to load whisper model", e))?;
        info!("Whisper model loaded");
        Ok(Self {
            context: Arc::new(context),
            language,
        })
    }

    fn run_inference(
        context: &WhisperContext,
        language: Option<&str>,
        samples: &[f32],
    ) -> Result<String> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(language);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        let mut state = context
            .create_state()
            .map_err(|e| provider_error("failed to create whisper state", e))?;

        state
            .full(params, samples)
            .map_err(|e| provider_error("whisper inference failed", e))?;

        let num_segments = state.full_n_segments();
        let mut text = String::new();
        for i in 0..num_segments {
            if let Some(segment) = state.get_segment(i) {
                let piece = segment
                    .to_str()
                    .map_err(|e| provider_error("invalid segment text", e))?;
                text.push_str(piece.trim());
                text.push(' ');
            }
        }
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl TranscriptionProvider for WhisperProvider {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<TranscriptionOutput> {
        let duration = samples.len() as f64 / sample_rate as f64;
        let samples = resample_linear(samples, sample_rate, WHISPER_SAMPLE_RATE);
        debug!(
            input_samples = samples.len(),
            duration_sec = duration,
            "Running whisper inference"
        );

        let context = self.context.clone();
        let language = self.language.clone();
        let text = tokio::task::spawn_blocking(move || {
            Self::run_inference(&context, language.as_deref(), &samples)
        })
        .await
        .map_err(|e| provider_error("whisper task join failed", e))??;

        let confidence = if text.is_empty() {
            0.0
        } else {
            ESTIMATED_CONFIDENCE
        };

        Ok(TranscriptionOutput {
            text,
            confidence,
            language: self.language.clone(),
            duration: Some(duration),
        })
    }

    async fn transcribe_file(&self, path: &Path) -> Result<TranscriptionOutput> {
        let (samples, sample_rate) = read_wav_file(path)?;
        self.transcribe(&samples, sample_rate).await
    }
}
