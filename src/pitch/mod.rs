//! Pitch-shifted stem renders.
//!
//! A render is keyed by (job, stem, semitones). Semitones are clamped to one
//! octave either way and quantized to hundredths before the key is derived,
//! so `20.0` and `12.0` share one cache entry.

pub mod cache;

use std::path::{Path, PathBuf};

pub use cache::PitchCache;

/// Largest transposition in either direction.
pub const MAX_SEMITONES: f64 = 12.0;

/// Offsets at or below this magnitude are served unshifted.
pub const MIN_SHIFT_SEMITONES: f64 = 0.01;

/// Sample rate assumed when probing the source fails.
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Clamps to `[-12, 12]` and rounds to two decimals. Non-finite input is
/// treated as no shift.
pub fn normalize_semitones(semitones: f64) -> f64 {
    if !semitones.is_finite() {
        return 0.0;
    }
    let clamped = semitones.clamp(-MAX_SEMITONES, MAX_SEMITONES);
    (clamped * 100.0).round() / 100.0
}

/// Whether `semitones` calls for a render at all.
pub fn needs_shift(semitones: f64) -> bool {
    semitones.is_finite() && semitones.abs() > MIN_SHIFT_SEMITONES
}

/// Filesystem-safe token for a normalized offset: `+1.50` becomes `p1_50`,
/// `-3.00` becomes `m3_00`.
pub fn semitone_token(semitones: f64) -> String {
    format!("{:+.2}", semitones)
        .replace('.', "_")
        .replace('+', "p")
        .replace('-', "m")
}

/// Cache file for a render: `{cache_dir}/{job_id}_{stem}_{token}.wav`.
pub fn cache_path(cache_dir: &Path, job_id: &str, stem: &str, semitones: f64) -> PathBuf {
    cache_dir.join(format!("{}_{}_{}.wav", job_id, stem, semitone_token(semitones)))
}

/// Frequency ratio of a transposition.
pub fn pitch_ratio(semitones: f64) -> f64 {
    2f64.powf(semitones / 12.0)
}

/// Filter graph that shifts pitch while preserving duration.
pub fn shift_filter(sample_rate: u32, semitones: f64) -> String {
    let ratio = pitch_ratio(semitones);
    format!(
        "asetrate={sr}*{ratio},aresample={sr},atempo={tempo}",
        sr = sample_rate,
        ratio = ratio,
        tempo = 1.0 / ratio
    )
}
