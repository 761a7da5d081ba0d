//! Provider abstractions and implementations.
//!
//! Three seams, each a small fixed-capability trait: speech-to-text
//! ([`TranscriptionProvider`]), text embeddings ([`EmbeddingProvider`]),
//! and LLM generation ([`LlmClient`]). Implementations handle their own
//! resampling and transport details.

use std::path::Path;

use async_trait::async_trait;

use murmur_core::error::{MurmurError, Result};
use murmur_core::types::TranscriptionOutput;

pub mod embedding;
pub mod ollama;
pub mod remote;
pub mod wav;
pub mod whisper;

/// Pluggable speech-to-text provider.
///
/// Input is mono float samples in `[-1, 1]` at the declared rate; the
/// provider is responsible for its own resampling and language bias.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Provider identifier for logs (e.g. `"whisper"`, `"remote"`).
    fn name(&self) -> &str;

    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<TranscriptionOutput>;

    async fn transcribe_file(&self, path: &Path) -> Result<TranscriptionOutput>;
}

/// Text embedding provider. All embeddings in one deployment share a
/// single dimension.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;
}

/// Options for a single LLM generation call.
#[derive(Debug, Clone, Default)]
pub struct GenerateOptions {
    pub system: Option<String>,
    /// Output format hint, e.g. `"json"`.
    pub format: Option<String>,
    pub temperature: f64,
}

/// LLM adapter used by enrichment handlers.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str, options: GenerateOptions) -> Result<String>;

    async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>>;

    async fn list_models(&self) -> Result<Vec<String>>;

    async fn health(&self) -> bool;
}

/// Linear-interpolation resample; recognisers that need a fixed input rate
/// call this before inference.
pub fn resample_linear(samples: &[f32], from_sr: u32, to_sr: u32) -> Vec<f32> {
    if from_sr == to_sr || samples.is_empty() {
        return samples.to_vec();
    }
    let duration = samples.len() as f64 / from_sr as f64;
    let target_len = ((duration * to_sr as f64) as usize).max(1);
    let mut out = Vec::with_capacity(target_len);
    for i in 0..target_len {
        let pos = i as f64 * (samples.len() - 1) as f64 / (target_len.max(2) - 1) as f64;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = samples[idx] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac) as f32);
    }
    out
}

/// Convert normalised floats to 16-bit PCM with clamping.
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

pub(crate) fn provider_error(context: &str, detail: impl std::fmt::Display) -> MurmurError {
    MurmurError::Provider(format!("{context}: {detail}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_halves_length() {
        let samples: Vec<f32> = (0..480).map(|i| (i as f32) / 480.0).collect();
        let out = resample_linear(&samples, 48000, 16000);
        assert!((out.len() as i64 - 160).abs() <= 1);
        // endpoints preserved
        assert!((out[0] - samples[0]).abs() < 1e-6);
        assert!((out.last().unwrap() - samples.last().unwrap()).abs() < 1e-3);
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16000, 16000), samples);
    }

    #[test]
    fn test_f32_to_i16_clamps() {
        let out = f32_to_i16(&[0.0, 1.0, -1.0, 2.0, -2.0]);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 32767);
        assert_eq!(out[2], -32767);
        assert_eq!(out[3], 32767);
        assert_eq!(out[4], -32767);
    }
}
