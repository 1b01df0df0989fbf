//! Feature extraction backends.
//!
//! Decoding audio and computing tempo/chroma features is delegated to an
//! external analyzer program. The analyzer is invoked as
//!
//! ```text
//! {analyzer} <path> --sr 22050 --duration 180
//! ```
//!
//! and must print a single JSON object on stdout:
//!
//! ```json
//! {"tempo": 120.3, "chroma": [0.1, 0.0, ...]}
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::AnalysisError;

/// Analysis sample rate in Hz.
pub const ANALYSIS_SAMPLE_RATE: u32 = 22050;

/// Longest window analyzed, in seconds.
pub const ANALYSIS_DURATION_SECS: u32 = 180;

/// Features extracted from one audio file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Features {
    /// Beat-tracker tempo estimate in BPM.
    #[serde(default)]
    pub tempo: Option<f64>,
    /// Mean chroma energy per pitch class, index 0 = C.
    #[serde(default)]
    pub chroma: Vec<f64>,
}

/// Source of tempo and chroma features.
#[async_trait]
pub trait FeatureExtractor: Send + Sync {
    /// Extracts features from the audio file at `path`.
    async fn extract(&self, path: &Path) -> Result<Features, AnalysisError>;
}

/// Runs an external analyzer program.
#[derive(Debug, Clone)]
pub struct ExternalAnalyzer {
    program: PathBuf,
}

impl ExternalAnalyzer {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl FeatureExtractor for ExternalAnalyzer {
    async fn extract(&self, path: &Path) -> Result<Features, AnalysisError> {
        debug!(program = %self.program.display(), path = %path.display(), "Running analyzer");

        let output = Command::new(&self.program)
            .arg(path)
            .arg("--sr")
            .arg(ANALYSIS_SAMPLE_RATE.to_string())
            .arg("--duration")
            .arg(ANALYSIS_DURATION_SECS.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                AnalysisError::Unavailable(format!(
                    "failed to run analyzer '{}': {}",
                    self.program.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AnalysisError::ExtractorFailed {
                code: output.status.code(),
                stderr: stderr.chars().take(500).collect(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).map_err(|e| {
            AnalysisError::MalformedOutput(format!(
                "{}: {}",
                e,
                stdout.chars().take(200).collect::<String>()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_deserialize() {
        let features: Features =
            serde_json::from_str(r#"{"tempo": 128.4, "chroma": [1,0,0,0,0,0,0,0,0,0,0,0]}"#)
                .expect("parse");
        assert_eq!(features.tempo, Some(128.4));
        assert_eq!(features.chroma.len(), 12);

        let features: Features = serde_json::from_str(r#"{"tempo": null}"#).expect("parse");
        assert!(features.tempo.is_none());
        assert!(features.chroma.is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let analyzer = ExternalAnalyzer::new("/nonexistent/stemsplit-analyzer");
        let err = analyzer
            .extract(Path::new("/tmp/x.wav"))
            .await
            .expect_err("should fail");
        assert!(matches!(err, AnalysisError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_analyzer_output() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().expect("tempdir");
        let script = tmp.path().join("analyzer.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\n[ \"$2\" = \"--sr\" ] || exit 3\necho '{\"tempo\": 99.6, \"chroma\": [1,1,1,1,1,1,1,1,1,1,1,2]}'\n",
        )
        .expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let features = ExternalAnalyzer::new(&script)
            .extract(Path::new("song.wav"))
            .await
            .expect("features");
        assert_eq!(features.tempo, Some(99.6));
        assert_eq!(features.chroma[11], 2.0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_analyzer_failure() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().expect("tempdir");
        let script = tmp.path().join("analyzer.sh");
        std::fs::write(&script, "#!/bin/sh\necho decode error >&2\nexit 2\n").expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");

        let err = ExternalAnalyzer::new(&script)
            .extract(Path::new("song.wav"))
            .await
            .expect_err("should fail");
        match err {
            AnalysisError::ExtractorFailed { code, stderr } => {
                assert_eq!(code, Some(2));
                assert!(stderr.contains("decode error"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
