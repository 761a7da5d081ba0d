//! Prosodic feature extraction from drained utterance audio.
//!
//! Windowed analysis over mono float samples: autocorrelation pitch
//! tracking, RMS intensity in dB, linear-regression slopes over the final
//! stretch of the utterance, and simple jitter/shimmer/HNR voice-quality
//! estimates. Any feature that cannot be computed is left `None`; the
//! extractor itself never fails.

use murmur_core::types::ProsodyFeatures;

const WINDOW_MS: f64 = 30.0;
const HOP_MS: f64 = 10.0;
const MIN_PITCH_HZ: f64 = 75.0;
const MAX_PITCH_HZ: f64 = 500.0;
/// Normalised autocorrelation peak above which a frame counts as voiced.
const VOICING_THRESHOLD: f64 = 0.45;
/// RMS floor below which a frame counts as silent.
const SILENCE_FLOOR: f64 = 1e-3;
/// Span (seconds) of the final window used for slope estimates.
const FINAL_WINDOW_SEC: f64 = 0.3;
/// Interior silent runs at least this long count as pauses.
const MIN_PAUSE_MS: f64 = 200.0;
/// dB reference offset so normalised amplitudes land in a speech-like range.
const DB_OFFSET: f64 = 94.0;

#[derive(Debug)]
struct Frame {
    /// Window centre time in seconds.
    t: f64,
    rms: f64,
    db: f64,
    pitch_hz: Option<f64>,
    /// Best normalised autocorrelation value in the pitch range.
    acf_peak: f64,
    peak_amp: f64,
}

pub struct ProsodyExtractor {
    target_sample_rate: u32,
}

impl Default for ProsodyExtractor {
    fn default() -> Self {
        Self::new(16000)
    }
}

impl ProsodyExtractor {
    pub fn new(target_sample_rate: u32) -> Self {
        Self { target_sample_rate }
    }

    /// Extract features from `samples` at `sample_rate`.
    pub fn extract(&self, samples: &[f32], sample_rate: u32) -> ProsodyFeatures {
        let mut features = ProsodyFeatures::default();

        let resampled;
        let samples = if sample_rate != self.target_sample_rate {
            resampled = resample_linear(samples, sample_rate, self.target_sample_rate);
            &resampled[..]
        } else {
            samples
        };

        let sr = self.target_sample_rate as f64;
        let window = (WINDOW_MS / 1000.0 * sr) as usize;
        let hop = (HOP_MS / 1000.0 * sr) as usize;
        if samples.len() < window || window == 0 || hop == 0 {
            return features;
        }

        let frames = analyse_frames(samples, sr, window, hop);
        if frames.is_empty() {
            return features;
        }

        self.fill_pitch(&frames, &mut features);
        self.fill_intensity(&frames, &mut features);
        self.fill_voice_quality(&frames, &mut features);
        self.fill_pauses(&frames, &mut features);

        features
    }

    fn fill_pitch(&self, frames: &[Frame], features: &mut ProsodyFeatures) {
        let voiced: Vec<(f64, f64)> = frames
            .iter()
            .filter_map(|f| f.pitch_hz.map(|p| (f.t, p)))
            .collect();

        features.voiced_fraction = Some(voiced.len() as f64 / frames.len() as f64);
        if voiced.is_empty() {
            return;
        }

        let values: Vec<f64> = voiced.iter().map(|(_, p)| *p).collect();
        let mean = mean(&values);
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        features.pitch_mean_hz = Some(mean);
        features.pitch_min_hz = Some(min);
        features.pitch_max_hz = Some(max);
        features.pitch_stdev = Some(stdev(&values, mean));
        features.pitch_range_hz = Some(max - min);
        features.final_pitch_slope = final_slope(&voiced);
    }

    fn fill_intensity(&self, frames: &[Frame], features: &mut ProsodyFeatures) {
        let audible: Vec<(f64, f64)> = frames
            .iter()
            .filter(|f| f.rms > SILENCE_FLOOR)
            .map(|f| (f.t, f.db))
            .collect();
        if audible.is_empty() {
            return;
        }

        let values: Vec<f64> = audible.iter().map(|(_, db)| *db).collect();
        let mean_db = mean(&values);
        features.intensity_mean_db = Some(mean_db);
        features.intensity_max_db =
            Some(values.iter().cloned().fold(f64::NEG_INFINITY, f64::max));
        features.intensity_stdev = Some(stdev(&values, mean_db));
        features.final_intensity_slope = final_slope(&audible);
    }

    fn fill_voice_quality(&self, frames: &[Frame], features: &mut ProsodyFeatures) {
        let voiced: Vec<&Frame> = frames.iter().filter(|f| f.pitch_hz.is_some()).collect();
        if voiced.len() < 3 {
            return;
        }

        // Jitter: cycle-to-cycle period variability across adjacent frames.
        let periods: Vec<f64> = voiced
            .iter()
            .filter_map(|f| f.pitch_hz.map(|p| 1.0 / p))
            .collect();
        features.jitter_local = relative_variability(&periods);

        // Shimmer: the same over per-frame peak amplitudes.
        let amps: Vec<f64> = voiced.iter().map(|f| f.peak_amp).collect();
        features.shimmer_local = relative_variability(&amps);

        // HNR from the mean autocorrelation peak of voiced frames.
        let r = mean(&voiced.iter().map(|f| f.acf_peak).collect::<Vec<_>>());
        let r = r.clamp(1e-6, 1.0 - 1e-6);
        features.hnr_db = Some(10.0 * (r / (1.0 - r)).log10());
    }

    fn fill_pauses(&self, frames: &[Frame], features: &mut ProsodyFeatures) {
        let first_audible = frames.iter().position(|f| f.rms > SILENCE_FLOOR);
        let last_audible = frames.iter().rposition(|f| f.rms > SILENCE_FLOOR);
        let (Some(first), Some(last)) = (first_audible, last_audible) else {
            features.pause_count = Some(0);
            features.total_pause_duration_ms = Some(0.0);
            return;
        };

        let mut count = 0u32;
        let mut total_ms = 0.0;
        let mut run_start: Option<usize> = None;
        for i in first..=last {
            if frames[i].rms <= SILENCE_FLOOR {
                run_start.get_or_insert(i);
            } else if let Some(start) = run_start.take() {
                let dur_ms = (i - start) as f64 * HOP_MS;
                if dur_ms >= MIN_PAUSE_MS {
                    count += 1;
                    total_ms += dur_ms;
                }
            }
        }
        features.pause_count = Some(count);
        features.total_pause_duration_ms = Some(total_ms);
    }
}

fn analyse_frames(samples: &[f32], sr: f64, window: usize, hop: usize) -> Vec<Frame> {
    let min_lag = (sr / MAX_PITCH_HZ).floor().max(2.0) as usize;
    let max_lag = ((sr / MIN_PITCH_HZ).ceil() as usize).min(window - 1);

    let mut frames = Vec::new();
    let mut start = 0;
    while start + window <= samples.len() {
        let w = &samples[start..start + window];
        let rms = rms_f64(w);
        let peak_amp = w.iter().fold(0.0f64, |acc, &s| acc.max((s as f64).abs()));
        let db = if rms > 0.0 {
            20.0 * rms.log10() + DB_OFFSET
        } else {
            0.0
        };

        let (pitch_hz, acf_peak) = if rms > SILENCE_FLOOR {
            pitch_autocorr(w, sr, min_lag, max_lag)
        } else {
            (None, 0.0)
        };

        frames.push(Frame {
            t: (start + window / 2) as f64 / sr,
            rms,
            db,
            pitch_hz,
            acf_peak,
            peak_amp,
        });
        start += hop;
    }
    frames
}

/// Best normalised autocorrelation peak in the pitch lag range and the
/// corresponding pitch, if the peak clears the voicing threshold.
fn pitch_autocorr(w: &[f32], sr: f64, min_lag: usize, max_lag: usize) -> (Option<f64>, f64) {
    let n = w.len();
    let r0: f64 = w.iter().map(|&s| (s as f64) * (s as f64)).sum();
    if r0 <= 0.0 || max_lag <= min_lag {
        return (None, 0.0);
    }

    let mut best_lag = 0usize;
    let mut best_r = 0.0f64;
    for lag in min_lag..=max_lag {
        let mut r = 0.0f64;
        for i in 0..n - lag {
            r += (w[i] as f64) * (w[i + lag] as f64);
        }
        let r = r / r0;
        if r > best_r {
            best_r = r;
            best_lag = lag;
        }
    }

    if best_r > VOICING_THRESHOLD && best_lag > 0 {
        (Some(sr / best_lag as f64), best_r)
    } else {
        (None, best_r)
    }
}

/// Least-squares slope (per second) over the points falling inside the
/// final window of the track. `None` with fewer than two points.
fn final_slope(points: &[(f64, f64)]) -> Option<f64> {
    let t_end = points.last()?.0;
    let tail: Vec<(f64, f64)> = points
        .iter()
        .filter(|(t, _)| *t >= t_end - FINAL_WINDOW_SEC)
        .cloned()
        .collect();
    linear_slope(&tail)
}

fn linear_slope(points: &[(f64, f64)]) -> Option<f64> {
    if points.len() < 2 {
        return None;
    }
    let n = points.len() as f64;
    let mean_t = points.iter().map(|(t, _)| t).sum::<f64>() / n;
    let mean_v = points.iter().map(|(_, v)| v).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (t, v) in points {
        num += (t - mean_t) * (v - mean_v);
        den += (t - mean_t) * (t - mean_t);
    }
    if den <= 0.0 {
        return None;
    }
    Some(num / den)
}

/// Mean absolute consecutive difference over the mean value.
fn relative_variability(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mean_v = mean(values);
    if mean_v <= 0.0 {
        return None;
    }
    let diff_sum: f64 = values.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    Some(diff_sum / (values.len() - 1) as f64 / mean_v)
}

fn rms_f64(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn stdev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Linear-interpolation resampler, good enough for feature extraction.
fn resample_linear(samples: &[f32], from_sr: u32, to_sr: u32) -> Vec<f32> {
    if from_sr == to_sr || samples.is_empty() {
        return samples.to_vec();
    }
    let duration = samples.len() as f64 / from_sr as f64;
    let target_len = (duration * to_sr as f64) as usize;
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
