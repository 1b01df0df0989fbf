//! Job registry and job record types.
//!
//! - **JobRecord**: status, progress, stems, error and settings of one job
//! - **JobRegistry**: shared table of records with atomic per-record updates
//!
//! Records live for the lifetime of the process only. Artifacts written by a
//! job survive a restart and are recovered by [`crate::stems::StemResolver`].

pub mod record;
pub mod registry;

pub use record::{
    is_plain_name, EngineSettings, JobId, JobRecord, JobStatus, JobStatusView, JobSummary,
    StemMap, MAX_ACTIVE_PROGRESS,
};
pub use registry::JobRegistry;
