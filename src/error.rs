//! Error types for stemsplit operations.
//!
//! Defines error types for every subsystem:
//! - Job registry lookups
//! - Separation engine supervision
//! - Remote audio fetching and search
//! - Stem resolution and pitch-shift rendering
//! - Tempo/key analysis
//! - Project and settings persistence
//!
//! [`ServiceError`] wraps all of them for the transport-facing facade and
//! classifies each failure with [`ErrorKind`].

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during job registry operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced while running the external separation engine.
///
/// These never escape a background task: the orchestrator records their
/// message on the job and moves it to the `error` state.
#[derive(Debug, Error)]
pub enum SeparationError {
    #[error("Failed to launch separation engine '{program}': {reason}")]
    LaunchFailed { program: String, reason: String },

    #[error("Separation engine exited with non-zero code {code:?}")]
    NonZeroExit { code: Option<i32> },

    #[error("Could not find stem directory in {0}")]
    OutputDirMissing(String),

    #[error("No stem files found after separation")]
    NoStems,

    #[error("separation cancelled")]
    Cancelled,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the remote fetch tool.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Fetch tool timed out after {budget:?}")]
    Timeout { budget: Duration },

    #[error("Fetch tool failed: {0}")]
    NonZeroExit(String),

    #[error("Downloaded file not found")]
    DownloadedFileNotFound,

    #[error("Failed to launch fetch tool '{program}': {reason}")]
    LaunchFailed { program: String, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Builds a timeout error from the elapsed budget.
    pub fn timeout(budget: Duration) -> Self {
        Self::Timeout { budget }
    }
}

/// Errors that can occur while resolving stems for a job.
#[derive(Debug, Error)]
pub enum StemError {
    #[error("Stem '{0}' not found")]
    NotFound(String),

    #[error("No stems found for job '{0}'")]
    NoStems(String),
}

/// Errors produced while rendering a pitch-shifted stem.
///
/// The public read path swallows these and serves the original stem.
#[derive(Debug, Error)]
pub enum PitchError {
    #[error("Audio transform failed with exit code {code:?}")]
    TransformFailed { code: Option<i32> },

    #[error("Failed to launch audio transform '{program}': {reason}")]
    LaunchFailed { program: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur during tempo/key analysis.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Analysis backend is not available: {0}")]
    Unavailable(String),

    #[error("No stems found for analysis")]
    NoStems,

    #[error("Analyzer failed with exit code {code:?}: {stderr}")]
    ExtractorFailed { code: Option<i32>, stderr: String },

    #[error("Failed to parse analyzer output: {0}")]
    MalformedOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur in the project and settings stores.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Invalid {what} payload: {reason}")]
    InvalidPayload { what: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while building the service configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure classes reported to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    UnavailableDependency,
    UpstreamTimeout,
    UpstreamFailure,
    Internal,
}

/// Top-level error returned by [`crate::service::StemService`].
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Stem(#[from] StemError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ServiceError {
    /// Classifies the error for the transport layer.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Job(JobError::NotFound(_)) => ErrorKind::NotFound,
            ServiceError::Job(JobError::InvalidInput(_)) => ErrorKind::InvalidInput,
            ServiceError::Job(JobError::Io(_)) => ErrorKind::Internal,
            ServiceError::Fetch(FetchError::Timeout { .. }) => ErrorKind::UpstreamTimeout,
            ServiceError::Fetch(FetchError::InvalidInput(_)) => ErrorKind::InvalidInput,
            ServiceError::Fetch(_) => ErrorKind::UpstreamFailure,
            ServiceError::Stem(_) => ErrorKind::NotFound,
            ServiceError::Analysis(AnalysisError::Unavailable(_)) => {
                ErrorKind::UnavailableDependency
            }
            ServiceError::Analysis(AnalysisError::NoStems) => ErrorKind::NotFound,
            ServiceError::Analysis(AnalysisError::Io(_)) => ErrorKind::Internal,
            ServiceError::Analysis(_) => ErrorKind::UpstreamFailure,
            ServiceError::Store(StoreError::ProjectNotFound(_)) => ErrorKind::NotFound,
            ServiceError::Store(StoreError::InvalidPayload { .. }) => ErrorKind::InvalidInput,
            ServiceError::Store(_) => ErrorKind::Internal,
        }
    }
}
