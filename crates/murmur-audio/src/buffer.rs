//! Accumulates PCM for one `(channel, speaker)` until it is worth transcribing.
//!
//! Silence gating applies to the timestamp only, never to the samples:
//! chunks below the RMS threshold are kept (the recogniser wants natural
//! pauses) but do not refresh `last_voiced_at`, so the stale check fires
//! once the speaker has actually stopped.

use chrono::{DateTime, Utc};

/// Samples drained from a buffer, with the wall-clock span they cover.
#[derive(Debug, Clone)]
pub struct DrainedAudio {
    pub samples: Vec<f32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Audio buffer for a single speaker in a single channel.
#[derive(Debug, Default)]
pub struct AudioBuffer {
    chunks: Vec<Vec<f32>>,
    total_samples: usize,
    started_at: Option<DateTime<Utc>>,
    last_voiced_at: Option<DateTime<Utc>>,
}

impl AudioBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// RMS energy of normalised float samples.
    pub fn rms(samples: &[f32]) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
        (sum / samples.len() as f64).sqrt()
    }

    /// Append a chunk, refreshing `last_voiced_at` only when the chunk's
    /// RMS clears `vad_threshold`.
    pub fn append(&mut self, samples: Vec<f32>, vad_threshold: f64) {
        self.append_at(samples, vad_threshold, Utc::now());
    }

    pub fn append_at(&mut self, samples: Vec<f32>, vad_threshold: f64, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
            self.last_voiced_at = Some(now);
        }

        let energy = Self::rms(&samples);
        if energy > vad_threshold {
            self.last_voiced_at = Some(now);
        }

        self.total_samples += samples.len();
        self.chunks.push(samples);
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Buffered audio duration in seconds.
    pub fn duration_sec(&self, sample_rate: u32) -> f64 {
        self.total_samples as f64 / sample_rate as f64
    }

    /// Enough audio accumulated to transcribe without waiting for silence.
    pub fn is_ready(&self, sample_rate: u32, chunk_duration_sec: f64) -> bool {
        self.duration_sec(sample_rate) >= chunk_duration_sec
    }

    /// Nonempty and silent for at least `silence_threshold_sec`.
    pub fn is_stale(&self, silence_threshold_sec: f64) -> bool {
        self.is_stale_at(silence_threshold_sec, Utc::now())
    }

    pub fn is_stale_at(&self, silence_threshold_sec: f64, now: DateTime<Utc>) -> bool {
        let Some(last_voiced) = self.last_voiced_at else {
            return false;
        };
        if self.chunks.is_empty() {
            return false;
        }
        let silence = (now - last_voiced).num_milliseconds() as f64 / 1000.0;
        silence >= silence_threshold_sec
    }

    /// Take the combined samples and the span they cover, resetting the
    /// buffer. Returns `None` when there is nothing buffered.
    pub fn drain(&mut self) -> Option<DrainedAudio> {
        self.drain_at(Utc::now())
    }

    pub fn drain_at(&mut self, now: DateTime<Utc>) -> Option<DrainedAudio> {
        if self.chunks.is_empty() {
            return None;
        }
        let started_at = self.started_at?;

        let mut samples = Vec::with_capacity(self.total_samples);
        for chunk in self.chunks.drain(..) {
            samples.extend_from_slice(&chunk);
        }
        self.total_samples = 0;
        self.started_at = None;
        self.last_voiced_at = None;

        Some(DrainedAudio {
            samples,
            started_at,
            ended_at: now,
        })
    }
}
