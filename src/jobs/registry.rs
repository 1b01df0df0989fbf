//! Process-wide table of job records.
//!
//! The registry is the single source of truth for job status and progress.
//! It is written by background separation tasks and read by arbitrary
//! concurrent status polls, so every access goes through one lock and every
//! mutation goes through [`JobRegistry::update`], which commits the whole
//! closure under the write lock. Readers only ever see cloned snapshots.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::debug;

use crate::error::JobError;

use super::record::{EngineSettings, JobId, JobRecord, JobStatus};

/// Shared, synchronized job table.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl JobRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new job and returns its freshly generated identifier.
    ///
    /// `initial` is `Queued` for local uploads and `Downloading` for remote
    /// submissions.
    pub fn create(
        &self,
        settings: EngineSettings,
        filename: impl Into<String>,
        initial: JobStatus,
    ) -> JobId {
        let id = JobId::generate();
        let record = JobRecord::new(id.clone(), filename, settings, initial);
        debug!(job_id = %id, status = %record.status, "Job registered");
        self.write().insert(id.clone(), record);
        id
    }

    /// Returns a snapshot of the job.
    ///
    /// # Errors
    ///
    /// Returns `JobError::NotFound` for unknown identifiers.
    pub fn get(&self, id: &JobId) -> Result<JobRecord, JobError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Returns whether the job is known.
    pub fn contains(&self, id: &JobId) -> bool {
        self.read().contains_key(id)
    }

    /// Applies `mutator` to the job atomically and returns its result.
    ///
    /// # Errors
    ///
    /// Returns `JobError::NotFound` for unknown identifiers.
    pub fn update<R>(
        &self,
        id: &JobId,
        mutator: impl FnOnce(&mut JobRecord) -> R,
    ) -> Result<R, JobError> {
        let mut jobs = self.write();
        let record = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let result = mutator(record);
        record.updated_at = Utc::now();
        Ok(result)
    }

    /// Returns snapshots of every job, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self.read().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Drops a job record.
    pub fn remove(&self, id: &JobId) -> Option<JobRecord> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            debug!(job_id = %id, "Job record dropped");
        }
        removed
    }

    /// Number of known jobs.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Number of jobs not yet in a terminal state.
    pub fn active_count(&self) -> usize {
        self.read()
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }
}
