//! Job record definitions.
//!
//! This module defines the per-job state tracked by the registry:
//!
//! - `JobId`: opaque identifier, also the name of the job's output directory
//! - `JobStatus`: closed set of lifecycle states
//! - `EngineSettings`: engine configuration captured at submission
//! - `JobRecord`: the record itself, with transition methods that keep the
//!   status/progress/stems/error fields consistent

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::Analysis;
use crate::config::DEFAULT_MODEL;

/// Highest progress a job may report before it is done.
pub const MAX_ACTIVE_PROGRESS: u8 = 99;

/// Mapping from stem name to artifact location.
pub type StemMap = BTreeMap<String, PathBuf>;

/// Opaque job identifier.
///
/// Generated identifiers are UUIDv4 strings; identifiers recovered from the
/// filesystem are whatever the output directory is called.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generates a fresh, never reused identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier can name a direct child of the output root.
    pub fn is_plain(&self) -> bool {
        is_plain_name(&self.0)
    }
}

/// Returns whether `name` is a single normal path component, so joining it
/// onto a directory can only address a direct child.
pub fn is_plain_name(name: &str) -> bool {
    if name.contains(['/', '\\']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a separation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Submitted, engine not launched yet.
    Queued,
    /// Remote audio is being fetched.
    Downloading,
    /// Separation engine is running.
    Processing,
    /// Stems are available.
    Done,
    /// Job failed; see the record's error message.
    Error,
}

impl JobStatus {
    /// Returns whether no further transitions are allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Downloading => write!(f, "downloading"),
            JobStatus::Processing => write!(f, "processing"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

/// Engine configuration snapshot captured at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Separation model identifier.
    pub model: String,
    /// Number of stems requested.
    pub stems: u32,
    /// Output audio format.
    pub format: String,
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Output bit depth.
    pub bit_depth: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            stems: 4,
            format: "wav".to_string(),
            sample_rate: 44100,
            bit_depth: 24,
        }
    }
}

/// Process-lifetime record of one separation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub status: JobStatus,
    /// 0-100, non-decreasing, exactly 100 iff `status` is `Done`.
    pub progress: u8,
    /// Populated only on `Done`.
    pub stems: StemMap,
    /// Set only on `Error`.
    pub error: Option<String>,
    /// Original or derived source name.
    pub filename: String,
    pub settings: EngineSettings,
    /// Memoized tempo/key analysis.
    pub analysis: Option<Analysis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Creates a record in its initial state with zero progress.
    pub fn new(
        id: JobId,
        filename: impl Into<String>,
        settings: EngineSettings,
        initial: JobStatus,
    ) -> Self {
        let now = Utc::now();
        let status = if initial.is_terminal() {
            JobStatus::Queued
        } else {
            initial
        };
        Self {
            id,
            status,
            progress: 0,
            stems: StemMap::new(),
            error: None,
            filename: filename.into(),
            settings,
            analysis: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Raises progress to `value`, never lowering it and never reaching 100
    /// before the job is done. Ignored once terminal.
    pub fn advance_progress(&mut self, value: u8) {
        if self.status.is_terminal() {
            return;
        }
        let capped = value.min(MAX_ACTIVE_PROGRESS);
        self.progress = self.progress.max(capped);
    }

    /// Enters the `Downloading` state.
    pub fn mark_downloading(&mut self) {
        if matches!(self.status, JobStatus::Queued | JobStatus::Downloading) {
            self.status = JobStatus::Downloading;
        }
    }

    /// Enters the `Processing` state with at least `floor` progress.
    pub fn begin_processing(&mut self, floor: u8) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Processing;
        self.advance_progress(floor);
    }

    /// Commits a successful separation.
    ///
    /// An empty stem map is treated as a failure so that `Done` always
    /// carries stems.
    pub fn complete(&mut self, stems: StemMap) {
        if self.status.is_terminal() {
            return;
        }
        if stems.is_empty() {
            self.fail("No stem files found after separation");
            return;
        }
        self.stems = stems;
        self.error = None;
        self.status = JobStatus::Done;
        self.progress = 100;
    }

    /// Commits a failure with a diagnostic message.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.stems.clear();
        self.error = Some(message.into());
        self.status = JobStatus::Error;
    }

    /// Stores the analysis result. Allowed in any state.
    pub fn set_analysis(&mut self, analysis: Analysis) {
        self.analysis = Some(analysis);
    }

    /// Poll view: status, progress, error and known stem names.
    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
            stems: self.stems.keys().cloned().collect(),
        }
    }

    /// Diagnostic view: every field except the artifact locations.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            error: self.error.clone(),
            filename: self.filename.clone(),
            settings: self.settings.clone(),
            analysis: self.analysis.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Response to a status poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub stems: Vec<String>,
}

/// Entry in the diagnostic job listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub error: Option<String>,
    pub filename: String,
    pub settings: EngineSettings,
    pub analysis: Option<Analysis>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
