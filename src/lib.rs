//! stemsplit: job orchestration, stem resolution and cache management for
//! an audio stem separation service.
//!
//! The [`service::StemService`] facade ties the pieces together: uploads and
//! remote downloads become background jobs that drive an external separation
//! engine, finished stems are located on disk (also after a restart), and
//! transposed renders, saved projects and output eviction are managed on top.

// Core modules
pub mod analysis;
pub mod cli;
pub mod config;
pub mod error;
pub mod janitor;
pub mod jobs;
pub mod metrics;
pub mod pitch;
pub mod projects;
pub mod scheduler;
pub mod separation;
pub mod service;
pub mod stems;

// Re-export commonly used types
pub use config::ServiceConfig;
pub use error::{
    AnalysisError, ConfigError, ErrorKind, FetchError, JobError, PitchError, SeparationError,
    ServiceError, StemError, StoreError,
};
pub use jobs::{JobId, JobStatus};
pub use service::{RemoteRequest, StemFile, StemService};
