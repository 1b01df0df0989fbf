//! Recovers the playable stems of a job.
//!
//! The registry is consulted first; when the job is unknown (for instance
//! after a restart) or its recorded files are gone, the job identifier is
//! treated as an output directory name and scanned recursively.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;
use walkdir::WalkDir;

use crate::jobs::{JobId, JobRegistry, StemMap};

use super::{ExtensionPriority, CANONICAL_STEMS, STEM_ALIASES};

/// Resolves job identifiers to stem artifact paths.
pub struct StemResolver {
    registry: Arc<JobRegistry>,
    output_dir: PathBuf,
    priority: ExtensionPriority,
}

impl StemResolver {
    /// Creates a resolver over `output_dir` using the default extension policy.
    pub fn new(registry: Arc<JobRegistry>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            registry,
            output_dir: output_dir.into(),
            priority: ExtensionPriority::default(),
        }
    }

    /// Replaces the extension policy.
    pub fn with_priority(mut self, priority: ExtensionPriority) -> Self {
        self.priority = priority;
        self
    }

    /// The extension policy in use.
    pub fn priority(&self) -> &ExtensionPriority {
        &self.priority
    }

    /// Returns the stems of `job_id`.
    ///
    /// An empty map means "not found"; it is never an error.
    pub fn resolve(&self, job_id: &JobId) -> StemMap {
        if let Ok(record) = self.registry.get(job_id) {
            if !record.stems.is_empty() && record.stems.values().all(|p| p.is_file()) {
                return record.stems;
            }
        }
        self.scan(job_id)
    }

    /// Returns one stem of `job_id`, if present.
    pub fn resolve_stem(&self, job_id: &JobId, stem_name: &str) -> Option<PathBuf> {
        self.resolve(job_id).remove(stem_name)
    }

    /// Returns the file to serve for `stem_name`: `other` falls back to the
    /// two-stem `no_vocals` track, and paths that vanished are dropped.
    pub fn resolve_playable(&self, job_id: &JobId, stem_name: &str) -> Option<PathBuf> {
        let mut stems = self.resolve(job_id);
        let path = match stems.remove(stem_name) {
            Some(path) => Some(path),
            None if stem_name == "other" => stems.remove("no_vocals"),
            None => None,
        };
        path.filter(|p| p.is_file())
    }

    /// Scans `{output_dir}/{job_id}` recursively for stem files.
    fn scan(&self, job_id: &JobId) -> StemMap {
        let mut stems = StemMap::new();
        if !job_id.is_plain() {
            debug!(job_id = %job_id, "Refusing to scan non-plain job id");
            return stems;
        }

        let root = self.output_dir.join(job_id.as_str());
        if !root.is_dir() {
            return stems;
        }

        // First file per (name, extension) in sorted walk order.
        let mut found: HashMap<(String, String), PathBuf> = HashMap::new();
        for entry in WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let path = entry.path();
            let (Some(name), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            found
                .entry((name.to_string(), ext.to_ascii_lowercase()))
                .or_insert_with(|| path.to_path_buf());
        }

        let names = CANONICAL_STEMS
            .iter()
            .map(|s| (*s, *s))
            .chain(STEM_ALIASES.iter().copied());

        // Extension rank dominates; canonical names beat aliases within a rank.
        let names: Vec<(&str, &str)> = names.collect();
        for ext in self.priority.extensions() {
            for (file_name, key) in &names {
                if stems.contains_key(*key) {
                    continue;
                }
                if let Some(path) = found.get(&(file_name.to_string(), ext.clone())) {
                    stems.insert(key.to_string(), path.clone());
                }
            }
        }

        debug!(job_id = %job_id, count = stems.len(), "Recovered stems from filesystem");
        stems
    }
}
