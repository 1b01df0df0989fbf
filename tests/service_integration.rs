//! End-to-end tests for the stem service.
//!
//! External tools are replaced by small shell scripts, so these tests only
//! run on unix.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use stemsplit::analysis::{FeatureExtractor, Features};
use stemsplit::error::{AnalysisError, ErrorKind};
use stemsplit::{JobId, JobStatus, RemoteRequest, ServiceConfig, StemService};
use tempfile::TempDir;

/// Engine invoked as `sh engine.sh <output> <input> <model> <name>`.
const FOUR_STEM_ENGINE: &str = r#"
dir="$1/$3/$4"
mkdir -p "$dir"
printf ' 25%%|##  \r 75%%|######\r'
for s in vocals drums bass other; do printf 'RIFF' > "$dir/$s.wav"; done
"#;

const FAILING_ENGINE: &str = "echo 'model not found' >&2\nexit 3\n";

const SLOW_ENGINE: &str = "printf ' 1%%|\\r'\nsleep 30\n";

fn write_tool(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).expect("write tool");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    path.display().to_string()
}

/// Config whose engine runs `engine_body` as `sh engine.sh <output> <input> <model> <name>`.
fn config_with(tmp: &TempDir, engine_body: &str) -> ServiceConfig {
    let script = tmp.path().join("engine.sh");
    std::fs::write(&script, engine_body).expect("write engine");

    ServiceConfig::rooted_at(tmp.path()).with_engine(
        "sh",
        vec![
            script.display().to_string(),
            "{output}".into(),
            "{input}".into(),
            "{model}".into(),
            "{name}".into(),
        ],
    )
}

fn service_with(tmp: &TempDir, engine_body: &str) -> StemService {
    StemService::new(config_with(tmp, engine_body)).expect("service")
}

async fn wait_for_status(service: &StemService, job_id: &JobId, wanted: JobStatus) {
    for _ in 0..200 {
        if service.status(job_id).expect("status").status == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("job {} never reached {}", job_id, wanted);
}

struct CountingExtractor {
    calls: AtomicUsize,
}

#[async_trait]
impl FeatureExtractor for CountingExtractor {
    async fn extract(&self, _path: &Path) -> Result<Features, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // C major triad.
        let mut chroma = vec![0.1; 12];
        chroma[0] = 1.0;
        chroma[4] = 0.8;
        chroma[7] = 0.9;
        Ok(Features {
            tempo: Some(119.6),
            chroma,
        })
    }
}

#[tokio::test]
async fn test_upload_separates_and_serves_stems() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, FOUR_STEM_ENGINE);

    let mut submission = service
        .submit_upload("My Song.mp3", b"ID3")
        .await
        .expect("submit");
    let job_id = submission.job_id.clone();
    submission.wait().await;

    let status = service.status(&job_id).expect("status");
    assert_eq!(status.status, JobStatus::Done);
    assert_eq!(status.progress, 100);
    assert!(status.error.is_none());
    assert_eq!(status.stems.len(), 4);

    // The upload is consumed by the job.
    assert!(!tmp.path().join(format!("uploads/{}.mp3", job_id)).exists());

    let stem = service.stem(&job_id, "vocals", 0.0).await.expect("stem");
    assert!(stem.path.is_file());
    assert_eq!(stem.media_type, "audio/wav");
    assert_eq!(stem.download_name, "vocals.wav");

    let err = service.stem(&job_id, "piano", 0.0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let jobs = service.list_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].filename, "My Song.mp3");
}

#[tokio::test]
async fn test_engine_failure_is_recorded_on_job() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, FAILING_ENGINE);

    let mut submission = service.submit_upload("song.wav", b"RIFF").await.expect("submit");
    let job_id = submission.job_id.clone();
    submission.wait().await;

    let status = service.status(&job_id).expect("status");
    assert_eq!(status.status, JobStatus::Error);
    assert!(status.progress < 100);
    assert!(status.stems.is_empty());
    assert!(status.error.expect("error message").contains("non-zero"));
    assert_eq!(service.runner_stats().failed, 1);
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, FOUR_STEM_ENGINE);

    let err = service.submit_upload("", b"RIFF").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let err = service.submit_remote(RemoteRequest::new("  ")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    assert!(service.list_jobs().is_empty());

    let err = service.status(&JobId::from("missing")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = service.cancel(&JobId::from("missing")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_cancel_running_job() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, SLOW_ENGINE);

    let mut submission = service.submit_upload("song.wav", b"RIFF").await.expect("submit");
    let job_id = submission.job_id.clone();
    wait_for_status(&service, &job_id, JobStatus::Processing).await;

    assert!(service.cancel(&job_id).expect("cancel"));
    tokio::time::timeout(Duration::from_secs(10), submission.wait())
        .await
        .expect("cancelled job must finish promptly");

    let status = service.status(&job_id).expect("status");
    assert_eq!(status.status, JobStatus::Error);
    assert_eq!(status.error.as_deref(), Some("separation cancelled"));
    assert!(!service.cancel(&job_id).expect("cancel"));
}

#[tokio::test]
async fn test_remote_submission_downloads_then_separates() {
    let tmp = TempDir::new().expect("tempdir");

    // Fetch args: --extract-audio --audio-format wav --audio-quality 0 --output PATH ...
    let fetch = write_tool(tmp.path(), "fetch.sh", "printf 'RIFF' > \"$7\"\n");
    let config = config_with(&tmp, FOUR_STEM_ENGINE).with_fetch_program(fetch);
    let service = StemService::new(config).expect("service");

    let mut submission = service
        .submit_remote(RemoteRequest::new("dQw4w9WgXcQ").with_title("Never / Gonna?"))
        .await
        .expect("submit");
    let job_id = submission.job_id.clone();
    submission.wait().await;

    let status = service.status(&job_id).expect("status");
    assert_eq!(status.status, JobStatus::Done, "error: {:?}", status.error);
    assert_eq!(status.stems.len(), 4);

    let stems = service.stems(&job_id).expect("stems");
    let vocals = stems.get("vocals").expect("vocals");
    assert!(vocals.to_string_lossy().contains("Never"));
}

#[tokio::test]
async fn test_remote_download_failure_skips_engine() {
    let tmp = TempDir::new().expect("tempdir");
    let marker = tmp.path().join("engine-ran");
    let engine = format!("touch '{}'\n{}", marker.display(), FOUR_STEM_ENGINE);
    let fetch = write_tool(
        tmp.path(),
        "fetch.sh",
        "printf 'RIF' > \"$7\"\necho 'ERROR: video unavailable' >&2\nexit 1\n",
    );
    let service =
        StemService::new(config_with(&tmp, &engine).with_fetch_program(fetch)).expect("service");

    let mut submission = service
        .submit_remote(RemoteRequest::new("gone"))
        .await
        .expect("submit");
    let job_id = submission.job_id.clone();
    submission.wait().await;

    let status = service.status(&job_id).expect("status");
    assert_eq!(status.status, JobStatus::Error);
    assert!(status
        .error
        .expect("error message")
        .contains("video unavailable"));
    assert!(!marker.exists(), "engine must not run after a failed download");
    assert_eq!(
        std::fs::read_dir(tmp.path().join("uploads")).expect("uploads").count(),
        0,
        "partial download must be removed"
    );
}

#[tokio::test]
async fn test_stems_survive_restart() {
    let tmp = TempDir::new().expect("tempdir");
    let job_id = {
        let service = service_with(&tmp, FOUR_STEM_ENGINE);
        let mut submission = service.submit_upload("song.wav", b"RIFF").await.expect("submit");
        submission.wait().await;
        submission.job_id.clone()
    };

    // A fresh service has no record of the job but still finds its stems.
    let service = service_with(&tmp, FOUR_STEM_ENGINE);
    assert!(service.status(&job_id).is_err());

    let stem = service.stem(&job_id, "drums", 0.0).await.expect("stem");
    assert!(stem.path.ends_with("drums.wav"));
    assert_eq!(service.stems(&job_id).expect("stems").len(), 4);
}

#[tokio::test]
async fn test_analysis_is_memoized() {
    let tmp = TempDir::new().expect("tempdir");
    let extractor = Arc::new(CountingExtractor {
        calls: AtomicUsize::new(0),
    });
    let service = service_with(&tmp, FOUR_STEM_ENGINE).with_extractor(extractor.clone());

    let mut submission = service.submit_upload("song.wav", b"RIFF").await.expect("submit");
    let job_id = submission.job_id.clone();
    submission.wait().await;

    let first = service.analyze(&job_id).await.expect("analysis");
    assert_eq!(first.bpm, Some(120));
    assert_eq!(first.key.as_deref(), Some("C major"));
    assert_eq!(first.bpm_source, "drums.wav");
    assert_eq!(first.key_source, "other.wav");
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);

    let second = service.analyze(&job_id).await.expect("analysis");
    assert_eq!(first, second);
    assert_eq!(extractor.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_analysis_without_backend_or_stems() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, FOUR_STEM_ENGINE);

    let err = service.analyze(&JobId::from("whatever")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnavailableDependency);

    let service = service.with_extractor(Arc::new(CountingExtractor {
        calls: AtomicUsize::new(0),
    }));
    let err = service.analyze(&JobId::from("whatever")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_projects_protect_outputs_from_eviction() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, FOUR_STEM_ENGINE);

    let mut kept = service.submit_upload("keep.wav", b"RIFF").await.expect("submit");
    let mut dropped = service.submit_upload("drop.wav", b"RIFF").await.expect("submit");
    kept.wait().await;
    dropped.wait().await;

    service
        .save_project(json!({ "id": kept.job_id.as_str(), "name": "Keeper" }))
        .expect("save");

    let summary = service.evict_outputs();
    assert_eq!(summary.removed.protected, 1);
    // The dropped job and the pitch cache.
    assert_eq!(summary.removed.dirs, 2);
    assert_eq!(summary.projects_kept, 1);

    let outputs = tmp.path().join("outputs");
    assert!(outputs.join(kept.job_id.as_str()).is_dir());
    assert!(!outputs.join(dropped.job_id.as_str()).exists());

    service.delete_project(kept.job_id.as_str()).expect("delete");
    assert!(!outputs.join(kept.job_id.as_str()).exists());
    assert!(service.status(&kept.job_id).is_err());
    assert!(service.list_projects().is_empty());

    let err = service.delete_project(kept.job_id.as_str()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_delete_all_projects_cascades() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, FOUR_STEM_ENGINE);

    let mut ids = Vec::new();
    for name in ["a.wav", "b.wav"] {
        let mut submission = service.submit_upload(name, b"RIFF").await.expect("submit");
        submission.wait().await;
        service
            .save_project(json!({ "id": submission.job_id.as_str() }))
            .expect("save");
        ids.push(submission.job_id.clone());
    }

    assert_eq!(service.delete_all_projects().expect("clear"), 2);
    assert!(service.list_projects().is_empty());
    for id in &ids {
        assert!(!tmp.path().join("outputs").join(id.as_str()).exists());
    }
}

#[tokio::test]
async fn test_settings_round_trip_through_service() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, FOUR_STEM_ENGINE);

    let settings = service.settings();
    assert_eq!(settings.get("theme"), Some(&json!("dark")));

    let updated = service
        .update_settings(json!({ "theme": "light", "custom": 1 }))
        .expect("update");
    assert_eq!(updated.get("theme"), Some(&json!("light")));
    assert_eq!(updated.get("custom"), Some(&json!(1)));

    let err = service.update_settings(json!([1, 2])).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    // Reopening reads the persisted values.
    let reopened = service_with(&tmp, FOUR_STEM_ENGINE);
    assert_eq!(reopened.settings().get("theme"), Some(&json!("light")));
}

#[tokio::test]
async fn test_blank_search_returns_nothing() {
    let tmp = TempDir::new().expect("tempdir");
    let service = service_with(&tmp, FOUR_STEM_ENGINE);
    assert!(service.search("   ", 5).await.expect("search").is_empty());
}
