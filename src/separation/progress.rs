//! Engine progress parsing and background progress logging.
//!
//! The separation engine writes free-form progress text. The only grammar
//! relied on is a percentage token (`45%`, `45.2 %`) somewhere in a line;
//! lines without one are ignored. Progress bars redraw with `\r`, so both
//! `\r` and `\n` terminate a line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use crate::jobs::{JobId, JobRegistry};

/// Progress reported when the engine starts.
pub const ENGINE_PROGRESS_FLOOR: u8 = 10;

/// Exclusive upper bound of engine-reported progress.
pub const ENGINE_PROGRESS_CEILING: u8 = 90;

static PERCENT_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})(?:\.\d+)?\s*%").ok());

/// Extracts a completion percentage from one line of engine output.
pub trait ProgressParser: Send + Sync {
    /// Returns the percentage (0-100) in `line`, if any.
    fn parse(&self, line: &str) -> Option<u8>;
}

/// Parser for the first `NN%` token of a line.
#[derive(Debug, Clone, Copy, Default)]
pub struct PercentTokenParser;

impl ProgressParser for PercentTokenParser {
    fn parse(&self, line: &str) -> Option<u8> {
        let re = PERCENT_TOKEN.as_ref()?;
        let caps = re.captures(line)?;
        let pct: u16 = caps.get(1)?.as_str().parse().ok()?;
        (pct <= 100).then_some(pct as u8)
    }
}

/// Maps an engine percentage onto job progress: `10 + floor(p * 0.8)`,
/// kept below 90 until the job completes.
pub fn map_engine_progress(pct: u8) -> u8 {
    let scaled = ENGINE_PROGRESS_FLOOR as u32 + (pct.min(100) as u32 * 8) / 10;
    scaled.min(ENGINE_PROGRESS_CEILING as u32 - 1) as u8
}

/// Reads `reader` to EOF and forwards every non-empty `\r`/`\n` delimited
/// segment to `tx`. Invalid UTF-8 is replaced.
pub async fn forward_lines<R>(mut reader: R, tx: UnboundedSender<String>) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                emit(&mut pending, &tx);
            } else {
                pending.push(byte);
            }
        }
    }
    emit(&mut pending, &tx);
    Ok(())
}

fn emit(pending: &mut Vec<u8>, tx: &UnboundedSender<String>) {
    if pending.is_empty() {
        return;
    }
    let line = String::from_utf8_lossy(pending).trim().to_string();
    pending.clear();
    if !line.is_empty() {
        // Receiver gone means the job is being torn down.
        let _ = tx.send(line);
    }
}

/// A background task that periodically logs the progress of one job.
///
/// Stops by itself once the job is terminal or unknown. Call
/// [`ProgressMonitor::stop`] to stop it early; dropping it also stops it.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start a monitor that logs `job_id`'s progress every `interval`.
    pub fn start(registry: Arc<JobRegistry>, job_id: JobId, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let Ok(record) = registry.get(&job_id) else {
                    break;
                };

                tracing::info!(
                    job_id = %job_id,
                    status = %record.status,
                    progress = record.progress,
                    elapsed_secs = start.elapsed().as_secs(),
                    "Job progress"
                );

                if record.status.is_terminal() {
                    break;
                }
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
