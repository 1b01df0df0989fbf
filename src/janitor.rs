//! Output cache eviction and per-project artifact removal.
//!
//! All removals are best-effort: a failure is logged and skipped, never
//! propagated, and is visible to callers only as a lower count. Nothing
//! here is atomic; evicting while a job is still writing its output is
//! avoided by convention, not by a lock.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::jobs::{is_plain_name, JobId, JobRegistry};
use crate::metrics::MetricsCollector;
use crate::projects::ProjectSource;

/// Counts from one eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionReport {
    /// Top-level files removed.
    pub files: u64,
    /// Top-level directories removed.
    pub dirs: u64,
    /// Directories kept because a saved project owns them.
    pub protected: u64,
}

/// What [`OutputJanitor::delete_project`] managed to remove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectCleanup {
    pub output_removed: bool,
    pub cache_files_removed: u64,
    pub job_dropped: bool,
}

/// Reclaims disk space under the output root.
pub struct OutputJanitor {
    output_dir: PathBuf,
    pitch_cache_dir: PathBuf,
    registry: Arc<JobRegistry>,
    projects: Arc<dyn ProjectSource>,
    metrics: MetricsCollector,
}

impl OutputJanitor {
    pub fn new(
        config: &ServiceConfig,
        registry: Arc<JobRegistry>,
        projects: Arc<dyn ProjectSource>,
    ) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            pitch_cache_dir: config.pitch_cache_dir.clone(),
            registry,
            projects,
            metrics: MetricsCollector::new(),
        }
    }

    /// Deletes every immediate child of the output root except directories
    /// named after a saved project.
    ///
    /// The pitch cache, when it lives under the output root, is an ordinary
    /// child and is emptied too; its entries are regenerable.
    pub fn evict_all(&self) -> EvictionReport {
        let mut report = EvictionReport::default();
        let protected_ids: std::collections::HashSet<String> =
            self.projects.project_ids().into_iter().collect();

        let entries = match std::fs::read_dir(&self.output_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.output_dir.display(), error = %e, "Output root not readable");
                return report;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

            if is_dir && protected_ids.contains(&name) {
                report.protected += 1;
                continue;
            }

            let removed = if is_dir {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match removed {
                Ok(()) if is_dir => report.dirs += 1,
                Ok(()) => report.files += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to evict output entry"),
            }
        }

        self.metrics
            .record_eviction(report.dirs, report.files, report.protected);
        info!(
            dirs = report.dirs,
            files = report.files,
            protected = report.protected,
            "Output cache evicted"
        );
        report
    }

    /// Removes everything derived from `project_id`: its output directory,
    /// its pitch-cache renders and its in-memory job record. Each step runs
    /// regardless of how the others went.
    pub fn delete_project(&self, project_id: &str) -> ProjectCleanup {
        let mut cleanup = ProjectCleanup::default();
        if !is_plain_name(project_id) {
            warn!(project_id = %project_id, "Refusing to clean up non-plain project id");
            return cleanup;
        }

        let project_dir = self.output_dir.join(project_id);
        if project_dir.exists() {
            match std::fs::remove_dir_all(&project_dir) {
                Ok(()) => cleanup.output_removed = true,
                Err(e) => warn!(path = %project_dir.display(), error = %e, "Failed to remove project output"),
            }
        }

        let prefix = format!("{}_", project_id);
        if let Ok(entries) = std::fs::read_dir(&self.pitch_cache_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                    continue;
                }
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => cleanup.cache_files_removed += 1,
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "Failed to remove pitch cache entry")
                    }
                }
            }
        }

        cleanup.job_dropped = self.registry.remove(&JobId::from(project_id)).is_some();

        debug!(
            project_id = %project_id,
            output_removed = cleanup.output_removed,
            cache_files_removed = cleanup.cache_files_removed,
            job_dropped = cleanup.job_dropped,
            "Project artifacts removed"
        );
        cleanup
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{EngineSettings, JobStatus};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("mkdir");
        }
        fs::write(path, b"x").expect("write");
    }

    fn janitor(root: &Path, registry: Arc<JobRegistry>, projects: Vec<String>) -> OutputJanitor {
        let config = ServiceConfig::rooted_at(root);
        OutputJanitor::new(&config, registry, Arc::new(projects))
    }

    #[test]
    fn test_evict_all_protects_saved_projects() {
        let tmp = TempDir::new().expect("tempdir");
        let outputs = tmp.path().join("outputs");
        for id in ["A", "B", "C"] {
            touch(&outputs.join(id).join("htdemucs/song/vocals.wav"));
        }
        touch(&outputs.join("stray.txt"));

        let janitor = janitor(
            tmp.path(),
            Arc::new(JobRegistry::new()),
            vec!["A".into(), "B".into()],
        );
        let report = janitor.evict_all();

        assert_eq!(
            report,
            EvictionReport {
                files: 1,
                dirs: 1,
                protected: 2
            }
        );
        assert!(outputs.join("A/htdemucs/song/vocals.wav").exists());
        assert!(outputs.join("B").exists());
        assert!(!outputs.join("C").exists());
        assert!(!outputs.join("stray.txt").exists());
    }

    #[test]
    fn test_protection_applies_to_directories_only() {
        let tmp = TempDir::new().expect("tempdir");
        let outputs = tmp.path().join("outputs");
        touch(&outputs.join("A"));

        let report = janitor(tmp.path(), Arc::new(JobRegistry::new()), vec!["A".into()]).evict_all();
        assert_eq!(report.protected, 0);
        assert_eq!(report.files, 1);
    }

    #[test]
    fn test_evict_missing_root() {
        let tmp = TempDir::new().expect("tempdir");
        let report = janitor(tmp.path(), Arc::new(JobRegistry::new()), vec![]).evict_all();
        assert_eq!(report, EvictionReport::default());
    }

    #[test]
    fn test_delete_project_cascades() {
        let tmp = TempDir::new().expect("tempdir");
        let outputs = tmp.path().join("outputs");
        let cache = outputs.join("_pitch_cache");
        touch(&outputs.join("A/htdemucs/song/vocals.wav"));
        touch(&outputs.join("B/htdemucs/song/vocals.wav"));
        touch(&cache.join("A_vocals_p1_00.wav"));
        touch(&cache.join("A_bass_m2_00.wav"));
        touch(&cache.join("B_vocals_p1_00.wav"));
        touch(&cache.join("AB_vocals_p1_00.wav"));

        let registry = Arc::new(JobRegistry::new());
        let job = registry.create(EngineSettings::default(), "a.wav", JobStatus::Queued);

        let janitor = janitor(tmp.path(), Arc::clone(&registry), vec![]);
        let cleanup = janitor.delete_project("A");

        assert!(cleanup.output_removed);
        assert_eq!(cleanup.cache_files_removed, 2);
        assert!(!cleanup.job_dropped);
        assert!(!outputs.join("A").exists());
        assert!(outputs.join("B/htdemucs/song/vocals.wav").exists());
        assert!(cache.join("B_vocals_p1_00.wav").exists());
        assert!(cache.join("AB_vocals_p1_00.wav").exists());

        let cleanup = janitor.delete_project(job.as_str());
        assert!(cleanup.job_dropped);
        assert!(!registry.contains(&job));
    }

    #[test]
    fn test_delete_project_rejects_traversal() {
        let tmp = TempDir::new().expect("tempdir");
        touch(&tmp.path().join("keep/file.txt"));
        let janitor = janitor(tmp.path(), Arc::new(JobRegistry::new()), vec![]);

        assert_eq!(janitor.delete_project("../keep"), ProjectCleanup::default());
        assert_eq!(janitor.delete_project(".."), ProjectCleanup::default());
        assert!(tmp.path().join("keep/file.txt").exists());
    }
}
