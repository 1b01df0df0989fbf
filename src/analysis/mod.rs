//! Tempo and key analysis of separated stems.
//!
//! Rhythm and harmony are read from different stems: tempo prefers drums,
//! key prefers the accompaniment. Feature extraction is delegated to a
//! [`FeatureExtractor`]; key estimation is done here.

pub mod extractor;
pub mod key;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AnalysisError;
use crate::jobs::StemMap;

pub use extractor::{ExternalAnalyzer, FeatureExtractor, Features};
pub use key::{detect_key, Key, Mode};

/// Result of a tempo/key analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// Rounded tempo, absent when the beat tracker found none.
    pub bpm: Option<u32>,
    /// Key such as `"A minor"`, absent when undetermined.
    pub key: Option<String>,
    /// File name of the stem the tempo was read from.
    pub bpm_source: String,
    /// File name of the stem the key was read from.
    pub key_source: String,
}

/// Picks the stem used for tempo: drums, then other, then vocals, then any.
pub fn select_tempo_source(stems: &StemMap) -> Option<&PathBuf> {
    ["drums", "other", "vocals"]
        .iter()
        .find_map(|name| stems.get(*name))
        .or_else(|| stems.values().next())
}

/// Picks the stem used for key: other, then vocals, then any.
pub fn select_key_source(stems: &StemMap) -> Option<&PathBuf> {
    ["other", "vocals"]
        .iter()
        .find_map(|name| stems.get(*name))
        .or_else(|| stems.values().next())
}

/// Runs tempo/key analysis over a stem set.
pub struct Analyzer {
    extractor: Option<Arc<dyn FeatureExtractor>>,
}

impl Analyzer {
    /// Creates an analyzer backed by `extractor`.
    pub fn new(extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self {
            extractor: Some(extractor),
        }
    }

    /// Creates an analyzer with no backend; every analysis reports an
    /// unavailable dependency.
    pub fn unavailable() -> Self {
        Self { extractor: None }
    }

    /// Builds the analyzer from an optional external program.
    pub fn from_program(program: Option<&str>) -> Self {
        match program {
            Some(p) if !p.trim().is_empty() => Self::new(Arc::new(ExternalAnalyzer::new(p))),
            _ => Self::unavailable(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.extractor.is_some()
    }

    /// Analyzes `stems`.
    ///
    /// # Errors
    ///
    /// - `AnalysisError::Unavailable` if no backend is configured
    /// - `AnalysisError::NoStems` if `stems` is empty
    /// - extractor failures are passed through
    pub async fn analyze(&self, stems: &StemMap) -> Result<Analysis, AnalysisError> {
        let extractor = self.extractor.as_ref().ok_or_else(|| {
            AnalysisError::Unavailable("no analyzer program is configured".to_string())
        })?;

        let (Some(bpm_src), Some(key_src)) = (select_tempo_source(stems), select_key_source(stems))
        else {
            return Err(AnalysisError::NoStems);
        };

        let tempo_features = extractor.extract(bpm_src).await?;
        let key_features = if key_src == bpm_src {
            tempo_features.clone()
        } else {
            extractor.extract(key_src).await?
        };

        let bpm = tempo_to_bpm(tempo_features.tempo);
        let key = detect_key(&key_features.chroma).map(|k| k.to_string());

        let analysis = Analysis {
            bpm,
            key,
            bpm_source: file_name(bpm_src),
            key_source: file_name(key_src),
        };

        info!(
            bpm = ?analysis.bpm,
            key = ?analysis.key,
            bpm_source = %analysis.bpm_source,
            key_source = %analysis.key_source,
            "Analysis complete"
        );

        Ok(analysis)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Whole BPM from a beat tracker tempo. Halves round to even.
fn tempo_to_bpm(tempo: Option<f64>) -> Option<u32> {
    tempo
        .filter(|t| t.is_finite() && *t >= 0.0)
        .map(|t| t.round_ties_even() as u32)
}
