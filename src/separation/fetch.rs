//! Remote audio: download before separation, and metadata search.
//!
//! Both run the external fetch tool under a wall-clock budget. A download
//! occupies job progress 0-20 and then hands the file to the
//! [`SeparationOrchestrator`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::error::{FetchError, SeparationError};
use crate::jobs::{JobId, StemMap};

use super::orchestrator::SeparationOrchestrator;

/// Progress when a download starts.
pub const DOWNLOAD_START_PROGRESS: u8 = 5;

/// Progress once the download is on disk.
pub const DOWNLOAD_DONE_PROGRESS: u8 = 20;

/// Longest safe title kept in derived file names.
pub const MAX_SAFE_TITLE_CHARS: usize = 60;

/// Longest tool diagnostic kept in a job error.
const MAX_ERROR_CHARS: usize = 500;

/// One search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchItem {
    pub id: Option<String>,
    pub title: Option<String>,
    pub channel: String,
    pub duration: Option<String>,
    pub thumbnail: Option<String>,
    pub url: Option<String>,
}

impl SearchItem {
    /// Maps one metadata record of the fetch tool.
    pub fn from_metadata(v: &Value) -> Self {
        let text = |key: &str| {
            v.get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };

        Self {
            id: text("id"),
            title: text("title"),
            channel: text("uploader").or_else(|| text("channel")).unwrap_or_default(),
            duration: text("duration_string")
                .or_else(|| format_duration(v.get("duration").and_then(Value::as_f64))),
            thumbnail: best_thumbnail(v.get("thumbnails")),
            url: text("webpage_url"),
        }
    }
}

/// Formats seconds as `m:ss`, or `h:mm:ss` from one hour on.
///
/// Zero and missing durations have no display form.
pub fn format_duration(secs: Option<f64>) -> Option<String> {
    let secs = secs.filter(|s| s.is_finite() && *s >= 1.0)? as u64;
    let (m, s) = (secs / 60, secs % 60);
    let (h, m) = (m / 60, m % 60);
    if h > 0 {
        Some(format!("{}:{:02}:{:02}", h, m, s))
    } else {
        Some(format!("{}:{:02}", m, s))
    }
}

/// URL of the largest thumbnail by area; the first one wins ties.
pub fn best_thumbnail(thumbnails: Option<&Value>) -> Option<String> {
    let list = thumbnails?.as_array()?;
    let area = |t: &Value| {
        let dim = |k: &str| t.get(k).and_then(Value::as_u64).unwrap_or(0);
        dim("width") * dim("height")
    };

    let mut best: Option<&Value> = None;
    for thumb in list {
        match best {
            Some(current) if area(thumb) <= area(current) => {}
            _ => best = Some(thumb),
        }
    }
    best?.get("url").and_then(Value::as_str).map(str::to_string)
}

/// File-name-safe form of a title.
///
/// Alphanumerics, space, `-` and `_` are kept; everything else becomes `_`.
pub fn safe_title(title: &str) -> String {
    title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SAFE_TITLE_CHARS)
        .collect()
}

/// Page URL for a remote identifier.
pub fn watch_url(video_id: &str) -> String {
    format!(
        "https://www.youtube.com/watch?v={}",
        urlencoding::encode(video_id)
    )
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Downloads remote audio and runs it through separation.
pub struct FetchStage {
    program: String,
    upload_dir: PathBuf,
    fetch_timeout: Duration,
    search_timeout: Duration,
    orchestrator: Arc<SeparationOrchestrator>,
}

impl FetchStage {
    pub fn new(config: &ServiceConfig, orchestrator: Arc<SeparationOrchestrator>) -> Self {
        Self {
            program: config.fetch_program.clone(),
            upload_dir: config.upload_dir.clone(),
            fetch_timeout: config.fetch_timeout,
            search_timeout: config.search_timeout,
            orchestrator,
        }
    }

    /// Download path for a job: `{upload_dir}/{job_id}_{safe_title}.wav`.
    pub fn download_path(&self, job_id: &JobId, safe_title: &str) -> PathBuf {
        self.upload_dir
            .join(format!("{}_{}.wav", job_id, safe_title))
    }

    /// Downloads `video_id` to `out_path`, then separates it.
    ///
    /// Download failures are recorded on the job without invoking the
    /// engine, and the partial download is removed.
    pub async fn run(
        &self,
        job_id: &JobId,
        video_id: &str,
        out_path: &Path,
        cancel: CancellationToken,
    ) -> Result<StemMap, SeparationError> {
        let registry = self.orchestrator.registry();
        let _ = registry.update(job_id, |r| {
            r.mark_downloading();
            r.advance_progress(DOWNLOAD_START_PROGRESS);
        });

        let downloaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SeparationError::Cancelled),
            result = self.download(video_id, out_path) => result.map_err(SeparationError::from),
        };

        let input = match downloaded {
            Ok(path) => path,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Download failed");
                let message = e.to_string();
                let _ = registry.update(job_id, move |r| r.fail(message));
                if let Err(rm) = tokio::fs::remove_file(out_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %out_path.display(), error = %rm, "Failed to remove partial download");
                    }
                }
                return Err(e);
            }
        };

        let _ = registry.update(job_id, |r| r.advance_progress(DOWNLOAD_DONE_PROGRESS));
        self.orchestrator.run(job_id, &input, cancel).await
    }

    /// Downloads the audio of `video_id` as WAV to `out_path`.
    ///
    /// Returns the file actually written, which may differ from `out_path`
    /// when the tool adjusts the name.
    pub async fn download(&self, video_id: &str, out_path: &Path) -> Result<PathBuf, FetchError> {
        let url = watch_url(video_id);
        info!(url = %url, out = %out_path.display(), "Downloading remote audio");

        let mut cmd = Command::new(&self.program);
        cmd.args(["--extract-audio", "--audio-format", "wav", "--audio-quality", "0"])
            .arg("--output")
            .arg(out_path)
            .args(["--no-playlist", "--quiet"])
            .arg(&url)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.fetch_timeout, cmd.output())
            .await
            .map_err(|_| FetchError::timeout(self.fetch_timeout))?
            .map_err(|e| FetchError::LaunchFailed {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let text = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or("unknown error");
            return Err(FetchError::NonZeroExit(truncate(text, MAX_ERROR_CHARS)));
        }

        if out_path.is_file() {
            return Ok(out_path.to_path_buf());
        }
        self.find_by_prefix(out_path)
            .ok_or(FetchError::DownloadedFileNotFound)
    }

    /// First upload whose name starts with the stem of `expected`.
    fn find_by_prefix(&self, expected: &Path) -> Option<PathBuf> {
        let prefix = expected.file_stem()?.to_string_lossy().into_owned();
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&self.upload_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
            .map(|e| e.path())
            .collect();
        candidates.sort();
        let found = candidates.into_iter().next();
        if let Some(path) = &found {
            debug!(path = %path.display(), "Found download under a different name");
        }
        found
    }

    /// Searches remote audio by free text.
    ///
    /// A blank query returns no items without running the tool.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchItem>, FetchError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = Command::new(&self.program);
        cmd.arg(format!("ytsearch{}:{}", limit, query))
            .args(["--dump-json", "--no-download", "--no-playlist", "--quiet"])
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.search_timeout, cmd.output())
            .await
            .map_err(|_| FetchError::timeout(self.search_timeout))?
            .map_err(|e| FetchError::LaunchFailed {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let items: Vec<SearchItem> = stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .map(|v| SearchItem::from_metadata(&v))
            .collect();

        if items.is_empty() && !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::NonZeroExit(truncate(
                stderr.trim(),
                MAX_ERROR_CHARS,
            )));
        }

        debug!(query = %query, count = items.len(), "Search complete");
        Ok(items)
    }
}
