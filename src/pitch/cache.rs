//! On-disk memo of pitch-shifted renders.
//!
//! A render is reused while it is at least as new as its source stem.
//! Generation goes through the external transform tool and lands in a
//! temporary file that is renamed into place, so a concurrent reader sees
//! either the old render or the finished new one.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServiceConfig;
use crate::error::{PitchError, StemError};
use crate::jobs::JobId;
use crate::metrics::{MetricsCollector, PitchLookup};
use crate::stems::StemResolver;

use super::{cache_path, needs_shift, normalize_semitones, shift_filter, DEFAULT_SAMPLE_RATE};

/// Derives and memoizes transposed stems.
pub struct PitchCache {
    resolver: Arc<StemResolver>,
    cache_dir: PathBuf,
    probe_program: String,
    transform_program: String,
    metrics: MetricsCollector,
}

impl PitchCache {
    pub fn new(config: &ServiceConfig, resolver: Arc<StemResolver>) -> Self {
        Self {
            resolver,
            cache_dir: config.pitch_cache_dir.clone(),
            probe_program: config.probe_program.clone(),
            transform_program: config.transform_program.clone(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Returns the file to serve for `stem_name` of `job_id` shifted by
    /// `semitones`.
    ///
    /// Offsets of 0.01 semitones or less return the original stem. Render
    /// failures also return the original stem.
    ///
    /// # Errors
    ///
    /// Returns `StemError::NotFound` when the stem does not exist.
    pub async fn get_or_create(
        &self,
        job_id: &JobId,
        stem_name: &str,
        semitones: f64,
    ) -> Result<PathBuf, StemError> {
        let source = self
            .resolver
            .resolve_playable(job_id, stem_name)
            .ok_or_else(|| StemError::NotFound(stem_name.to_string()))?;

        if !needs_shift(semitones) {
            return Ok(source);
        }
        Ok(self.shift_or_original(job_id, stem_name, &source, semitones).await)
    }

    /// Shifts `source`, falling back to `source` itself on any failure.
    pub async fn shift_or_original(
        &self,
        job_id: &JobId,
        stem_name: &str,
        source: &Path,
        semitones: f64,
    ) -> PathBuf {
        let semitones = normalize_semitones(semitones);
        let target = cache_path(&self.cache_dir, job_id.as_str(), stem_name, semitones);

        match self.ensure_shifted(source, &target, semitones).await {
            Ok(generated) => {
                let lookup = if generated {
                    PitchLookup::Miss
                } else {
                    PitchLookup::Hit
                };
                self.metrics.record_pitch_lookup(lookup);
                debug!(job_id = %job_id, stem = stem_name, semitones, ?lookup, "Serving shifted stem");
                target
            }
            Err(e) => {
                self.metrics.record_pitch_lookup(PitchLookup::Fallback);
                warn!(
                    job_id = %job_id,
                    stem = stem_name,
                    semitones,
                    error = %e,
                    "Pitch shift failed, serving original stem"
                );
                source.to_path_buf()
            }
        }
    }

    /// Renders `target` from `source` unless a fresh render exists.
    ///
    /// Returns whether a render was generated.
    pub async fn ensure_shifted(
        &self,
        source: &Path,
        target: &Path,
        semitones: f64,
    ) -> Result<bool, PitchError> {
        if is_fresh(source, target).await {
            return Ok(false);
        }

        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let sample_rate = self.probe_sample_rate(source).await;
        let filter = shift_filter(sample_rate, semitones);
        let partial = partial_path(target);

        info!(
            source = %source.display(),
            target = %target.display(),
            semitones,
            sample_rate,
            "Rendering pitch-shifted stem"
        );

        let status = Command::new(&self.transform_program)
            .arg("-y")
            .arg("-i")
            .arg(source)
            .arg("-vn")
            .arg("-af")
            .arg(&filter)
            .arg(&partial)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| PitchError::LaunchFailed {
                program: self.transform_program.clone(),
                reason: e.to_string(),
            })?;

        if !status.success() {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(PitchError::TransformFailed {
                code: status.code(),
            });
        }

        if let Err(e) = tokio::fs::rename(&partial, target).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.into());
        }
        Ok(true)
    }

    /// Sample rate of the first audio stream, or 44.1 kHz if it cannot be
    /// probed.
    pub async fn probe_sample_rate(&self, source: &Path) -> u32 {
        let output = Command::new(&self.probe_program)
            .args(["-v", "error", "-select_streams", "a:0"])
            .args(["-show_entries", "stream=sample_rate"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(source)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await;

        let rate = match output {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .trim()
                .parse::<u32>()
                .ok()
                .filter(|r| *r > 0),
            _ => None,
        };

        rate.unwrap_or_else(|| {
            debug!(source = %source.display(), "Sample rate probe failed, assuming default");
            DEFAULT_SAMPLE_RATE
        })
    }
}

/// A render is fresh when it exists and is not older than its source.
async fn is_fresh(source: &Path, target: &Path) -> bool {
    let (Ok(src), Ok(dst)) = (tokio::fs::metadata(source).await, tokio::fs::metadata(target).await)
    else {
        return false;
    };
    match (src.modified(), dst.modified()) {
        (Ok(src_time), Ok(dst_time)) => dst_time >= src_time,
        _ => false,
    }
}

/// Temporary sibling of `target`. It keeps the `{job_id}_` prefix so
/// project deletion also sweeps leftovers.
fn partial_path(target: &Path) -> PathBuf {
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}.{}.partial.wav", stem, Uuid::new_v4().simple()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::jobs::JobRegistry;
    use std::os::unix::fs::PermissionsExt;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    struct Fixture {
        tmp: TempDir,
        cache: PitchCache,
        counter: PathBuf,
        filters: PathBuf,
    }

    fn write_tool(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("write tool");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
        path.display().to_string()
    }

    /// Transform args: `-y -i SRC -vn -af FILTER DST`.
    fn fixture(probe_body: &str, transform_ok: bool) -> Fixture {
        let tmp = TempDir::new().expect("tempdir");
        let counter = tmp.path().join("renders.log");
        let filters = tmp.path().join("filters.log");
        let transform_body = if transform_ok {
            format!(
                "echo x >> '{}'\necho \"$6\" >> '{}'\ncp \"$3\" \"$7\"\n",
                counter.display(),
                filters.display()
            )
        } else {
            "exit 1\n".to_string()
        };

        let config = ServiceConfig::rooted_at(tmp.path())
            .with_probe_program(write_tool(tmp.path(), "probe.sh", probe_body))
            .with_transform_program(write_tool(tmp.path(), "transform.sh", &transform_body));

        let stem_dir = config.output_dir.join("job1/htdemucs/song");
        std::fs::create_dir_all(&stem_dir).expect("mkdir");
        for stem in ["vocals", "bass"] {
            std::fs::write(stem_dir.join(format!("{}.wav", stem)), b"RIFF").expect("write stem");
        }
        std::fs::write(stem_dir.join("no_vocals.wav"), b"RIFF").expect("write stem");

        let resolver = Arc::new(StemResolver::new(
            Arc::new(JobRegistry::new()),
            &config.output_dir,
        ));
        Fixture {
            cache: PitchCache::new(&config, resolver),
            tmp,
            counter,
            filters,
        }
    }

    fn renders(fx: &Fixture) -> usize {
        std::fs::read_to_string(&fx.counter)
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn job() -> JobId {
        JobId::from("job1")
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let fx = fixture("echo 48000\n", true);

        let first = fx.cache.get_or_create(&job(), "vocals", 3.0).await.expect("path");
        let second = fx.cache.get_or_create(&job(), "vocals", 3.0).await.expect("path");

        assert_eq!(first, second);
        assert_eq!(first, fx.cache.cache_dir().join("job1_vocals_p3_00.wav"));
        assert!(first.is_file());
        assert_eq!(renders(&fx), 1);

        let filters = std::fs::read_to_string(&fx.filters).expect("filters");
        assert!(filters.starts_with("asetrate=48000*"));
    }

    #[tokio::test]
    async fn test_newer_source_forces_regeneration() {
        let fx = fixture("echo 44100\n", true);
        let shifted = fx.cache.get_or_create(&job(), "bass", -2.0).await.expect("path");
        assert_eq!(renders(&fx), 1);

        let source = fx
            .tmp
            .path()
            .join("outputs/job1/htdemucs/song/bass.wav");
        std::fs::File::options()
            .write(true)
            .open(&source)
            .expect("open")
            .set_modified(SystemTime::now() + Duration::from_secs(120))
            .expect("touch");

        let again = fx.cache.get_or_create(&job(), "bass", -2.0).await.expect("path");
        assert_eq!(again, shifted);
        assert_eq!(renders(&fx), 2);
    }

    #[tokio::test]
    async fn test_out_of_range_is_clamped_before_keying() {
        let fx = fixture("echo 44100\n", true);
        let high = fx.cache.get_or_create(&job(), "vocals", 20.0).await.expect("path");
        let twelve = fx.cache.get_or_create(&job(), "vocals", 12.0).await.expect("path");
        assert_eq!(high, twelve);
        assert_eq!(renders(&fx), 1);
    }

    #[tokio::test]
    async fn test_small_offsets_serve_original() {
        let fx = fixture("echo 44100\n", true);
        let path = fx.cache.get_or_create(&job(), "vocals", 0.005).await.expect("path");
        assert!(path.ends_with("song/vocals.wav"));
        assert_eq!(renders(&fx), 0);
    }

    #[tokio::test]
    async fn test_transform_failure_falls_back_to_original() {
        let fx = fixture("echo 44100\n", false);
        let path = fx.cache.get_or_create(&job(), "vocals", 5.0).await.expect("path");
        assert!(path.ends_with("song/vocals.wav"));

        let leftovers = std::fs::read_dir(fx.cache.cache_dir())
            .map(|d| d.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0, "failed renders leave nothing behind");
    }

    #[tokio::test]
    async fn test_probe_failure_uses_default_rate() {
        let fx = fixture("exit 1\n", true);
        assert_eq!(
            fx.cache.probe_sample_rate(Path::new("missing.wav")).await,
            DEFAULT_SAMPLE_RATE
        );

        fx.cache.get_or_create(&job(), "vocals", 1.0).await.expect("path");
        let filters = std::fs::read_to_string(&fx.filters).expect("filters");
        assert!(filters.starts_with("asetrate=44100*"));
    }

    #[tokio::test]
    async fn test_missing_stem_and_alias() {
        let fx = fixture("echo 44100\n", true);
        let err = fx
            .cache
            .get_or_create(&job(), "drums", 2.0)
            .await
            .expect_err("missing stem");
        assert!(matches!(err, StemError::NotFound(_)));

        let other = fx.cache.get_or_create(&job(), "other", 0.0).await.expect("alias");
        assert!(other.ends_with("song/no_vocals.wav"));

        let shifted = fx.cache.get_or_create(&job(), "other", 1.0).await.expect("alias");
        assert_eq!(shifted, fx.cache.cache_dir().join("job1_other_p1_00.wav"));
    }
}
