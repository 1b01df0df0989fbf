//! Supervises one run of the separation engine.
//!
//! The orchestrator is the only writer of a job record while the job is
//! active. Every terminal transition (`done` with stems, or `error` with a
//! message) is committed through a single registry update so pollers never
//! observe a half-finished job.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SeparationError;
use crate::jobs::{EngineSettings, JobId, JobRegistry, StemMap};
use crate::stems::{probe_stem_dir, ExtensionPriority};

use super::engine::EngineCommand;
use super::progress::{
    forward_lines, map_engine_progress, PercentTokenParser, ProgressParser, ENGINE_PROGRESS_CEILING,
    ENGINE_PROGRESS_FLOOR,
};

/// Progress floor set as soon as the engine is running.
pub const PROCESSING_FLOOR: u8 = 5;

/// Drives the external separation engine for a job.
pub struct SeparationOrchestrator {
    registry: Arc<JobRegistry>,
    output_dir: PathBuf,
    engine: EngineCommand,
    priority: ExtensionPriority,
    parser: Arc<dyn ProgressParser>,
}

impl SeparationOrchestrator {
    pub fn new(registry: Arc<JobRegistry>, output_dir: impl Into<PathBuf>, engine: EngineCommand) -> Self {
        Self {
            registry,
            output_dir: output_dir.into(),
            engine,
            priority: ExtensionPriority::default(),
            parser: Arc::new(PercentTokenParser),
        }
    }

    /// Replaces the extension policy used to probe the stem directory.
    pub fn with_priority(mut self, priority: ExtensionPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Replaces the progress line parser.
    pub fn with_parser(mut self, parser: Arc<dyn ProgressParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Runs the engine on `input` for `job_id` and commits the outcome to the
    /// registry.
    ///
    /// The input file is deleted afterwards whatever the outcome. The
    /// returned error has already been recorded on the job.
    pub async fn run(
        &self,
        job_id: &JobId,
        input: &Path,
        cancel: CancellationToken,
    ) -> Result<StemMap, SeparationError> {
        let outcome = self.separate(job_id, input, &cancel).await;

        let committed = match &outcome {
            Ok(stems) => {
                info!(job_id = %job_id, stems = stems.len(), "Separation complete");
                let stems = stems.clone();
                self.registry.update(job_id, move |r| r.complete(stems))
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Separation failed");
                let message = e.to_string();
                self.registry.update(job_id, move |r| r.fail(message))
            }
        };
        if committed.is_err() {
            debug!(job_id = %job_id, "Job vanished from registry before commit");
        }

        remove_input(input).await;
        outcome
    }

    async fn separate(
        &self,
        job_id: &JobId,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<StemMap, SeparationError> {
        if cancel.is_cancelled() {
            return Err(SeparationError::Cancelled);
        }

        let settings = self
            .registry
            .get(job_id)
            .map(|r| r.settings)
            .unwrap_or_default();

        let out_base = self.output_dir.join(job_id.as_str());
        tokio::fs::create_dir_all(&out_base).await?;

        let mut cmd = self.engine.build(&settings, input, &out_base);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            job_id = %job_id,
            program = %self.engine.program(),
            model = %settings.model,
            input = %input.display(),
            "Launching separation engine"
        );

        let mut child = cmd.spawn().map_err(|e| SeparationError::LaunchFailed {
            program: self.engine.program().to_string(),
            reason: e.to_string(),
        })?;

        let _ = self.registry.update(job_id, |r| {
            r.begin_processing(PROCESSING_FLOOR);
            r.advance_progress(ENGINE_PROGRESS_FLOOR);
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(forward_lines(stderr, tx.clone())));
        }
        drop(tx);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(job_id = %job_id, "Cancelling separation engine");
                    let _ = child.kill().await;
                    for pump in &pumps {
                        pump.abort();
                    }
                    return Err(SeparationError::Cancelled);
                }
                line = rx.recv() => match line {
                    Some(line) => {
                        debug!(job_id = %job_id, "[engine] {}", line);
                        if let Some(pct) = self.parser.parse(&line) {
                            let progress = map_engine_progress(pct);
                            let _ = self.registry.update(job_id, |r| r.advance_progress(progress));
                        }
                    }
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(SeparationError::Cancelled);
            }
            status = child.wait() => status?,
        };

        if !status.success() {
            return Err(SeparationError::NonZeroExit {
                code: status.code(),
            });
        }

        let _ = self
            .registry
            .update(job_id, |r| r.advance_progress(ENGINE_PROGRESS_CEILING));

        let stem_dir = locate_stem_dir(&out_base, &settings, input)?;
        debug!(job_id = %job_id, dir = %stem_dir.display(), "Probing stem directory");

        let stems = probe_stem_dir(&stem_dir, &self.priority);
        if stems.is_empty() {
            return Err(SeparationError::NoStems);
        }
        Ok(stems)
    }
}

/// Finds the directory the engine wrote stems to.
///
/// The engine writes to `{out_base}/{model}/{input stem}`. When that is
/// missing the first subdirectory of `{out_base}/{model}` by name is used;
/// with several candidates the choice is arbitrary.
fn locate_stem_dir(
    out_base: &Path,
    settings: &EngineSettings,
    input: &Path,
) -> Result<PathBuf, SeparationError> {
    let model_root = out_base.join(&settings.model);
    if let Some(name) = input.file_stem() {
        let expected = model_root.join(name);
        if expected.is_dir() {
            return Ok(expected);
        }
    }

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&model_root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect()
        })
        .unwrap_or_default();
    candidates.sort();

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| SeparationError::OutputDirMissing(out_base.display().to_string()))
}

async fn remove_input(input: &Path) {
    match tokio::fs::remove_file(input).await {
        Ok(()) => debug!(path = %input.display(), "Removed input file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %input.display(), error = %e, "Failed to remove input file"),
    }
}
