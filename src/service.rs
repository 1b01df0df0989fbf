//! Transport-facing facade.
//!
//! [`StemService`] owns every component and exposes the request/response
//! operations a transport layer needs. Job-internal failures never surface
//! here; they are recorded on the job and seen on the next status poll.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::analysis::{Analysis, Analyzer, FeatureExtractor};
use crate::config::{ServiceConfig, DEFAULT_MODEL};
use crate::error::{ConfigError, JobError, ServiceError, StemError, StoreError};
use crate::janitor::{EvictionReport, OutputJanitor};
use crate::jobs::{
    EngineSettings, JobId, JobRegistry, JobStatus, JobStatusView, JobSummary, StemMap,
};
use crate::metrics::MetricsCollector;
use crate::pitch::PitchCache;
use crate::projects::{Project, ProjectStore, SettingsStore};
use crate::scheduler::{RunnerStats, TaskRunner, TaskRunnerConfig};
use crate::separation::{safe_title, EngineCommand, FetchStage, SearchItem, SeparationOrchestrator};
use crate::stems::{media_type_for, StemResolver};

/// Default number of search results.
pub const DEFAULT_SEARCH_LIMIT: u32 = 12;

/// Remote separation request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteRequest {
    pub video_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "deserialize_numeric")]
    pub stems: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default, rename = "sampleRate", deserialize_with = "deserialize_numeric")]
    pub sample_rate: Option<u32>,
    #[serde(default, rename = "bitDepth", deserialize_with = "deserialize_numeric")]
    pub bit_depth: Option<u32>,
}

/// Accepts a number or a numeric string, as stored by the settings store.
fn deserialize_numeric<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Numeric {
        Number(u32),
        Text(String),
    }

    match Option::<Numeric>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Numeric::Number(n)) => Ok(Some(n)),
        Some(Numeric::Text(text)) => text.trim().parse().map(Some).map_err(|_| {
            serde::de::Error::custom(format!("expected an integer, got {:?}", text))
        }),
    }
}

impl RemoteRequest {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Engine settings for the job, defaults filled in.
    pub fn settings(&self) -> EngineSettings {
        let defaults = EngineSettings::default();
        EngineSettings {
            model: self
                .model
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            stems: self.stems.unwrap_or(defaults.stems),
            format: self.format.clone().unwrap_or(defaults.format),
            sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
            bit_depth: self.bit_depth.unwrap_or(defaults.bit_depth),
        }
    }
}

/// A job handed to the background runner.
#[derive(Debug)]
pub struct Submission {
    pub job_id: JobId,
    handle: JoinHandle<()>,
}

impl Submission {
    /// Waits for the background job to finish.
    ///
    /// Must not be called again once it has returned.
    pub async fn wait(&mut self) {
        if let Err(e) = (&mut self.handle).await {
            warn!(job_id = %self.job_id, error = %e, "Job task did not finish cleanly");
        }
    }
}

/// A stem ready to be streamed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StemFile {
    pub path: PathBuf,
    pub media_type: &'static str,
    pub download_name: String,
}

/// Result of an output eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EvictionSummary {
    pub removed: EvictionReport,
    pub projects_kept: usize,
}

/// Job orchestration, artifact resolution and cache management behind one
/// object.
pub struct StemService {
    config: ServiceConfig,
    registry: Arc<JobRegistry>,
    orchestrator: Arc<SeparationOrchestrator>,
    fetch: Arc<FetchStage>,
    resolver: Arc<StemResolver>,
    pitch: PitchCache,
    janitor: OutputJanitor,
    analyzer: Analyzer,
    projects: Arc<ProjectStore>,
    settings: SettingsStore,
    runner: TaskRunner,
    metrics: MetricsCollector,
}

impl StemService {
    /// Builds the service and creates its directories.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid or a directory
    /// cannot be created.
    pub fn new(config: ServiceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        config.ensure_directories()?;

        let registry = Arc::new(JobRegistry::new());
        let orchestrator = Arc::new(SeparationOrchestrator::new(
            Arc::clone(&registry),
            &config.output_dir,
            EngineCommand::from_config(&config),
        ));
        let fetch = Arc::new(FetchStage::new(&config, Arc::clone(&orchestrator)));
        let resolver = Arc::new(StemResolver::new(Arc::clone(&registry), &config.output_dir));
        let pitch = PitchCache::new(&config, Arc::clone(&resolver));
        let projects = Arc::new(ProjectStore::open(&config.projects_file));
        let janitor = OutputJanitor::new(&config, Arc::clone(&registry), projects.clone());
        let settings = SettingsStore::open(config.settings_file());
        let analyzer = Analyzer::from_program(config.analyzer_program.as_deref());

        let mut runner_config = TaskRunnerConfig::default();
        if let Some(max) = config.max_concurrent_jobs {
            runner_config = runner_config.with_max_concurrent(max);
        }
        if let Some(timeout) = config.job_timeout {
            runner_config = runner_config.with_task_timeout(timeout);
        }

        info!(
            upload_dir = %config.upload_dir.display(),
            output_dir = %config.output_dir.display(),
            engine = %config.engine_program,
            analyzer = analyzer.is_available(),
            "Stem service ready"
        );

        Ok(Self {
            registry,
            orchestrator,
            fetch,
            resolver,
            pitch,
            janitor,
            analyzer,
            projects,
            settings,
            runner: TaskRunner::new(runner_config),
            metrics: MetricsCollector::new(),
            config,
        })
    }

    /// Replaces the feature extractor used for analysis.
    pub fn with_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.analyzer = Analyzer::new(extractor);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn runner_stats(&self) -> RunnerStats {
        self.runner.stats()
    }

    /// Stores uploaded audio and starts separating it.
    ///
    /// # Errors
    ///
    /// - `JobError::InvalidInput` if `filename` is empty
    /// - `JobError::Io` if the upload cannot be written
    pub async fn submit_upload(&self, filename: &str, bytes: &[u8]) -> Result<Submission, ServiceError> {
        if filename.trim().is_empty() {
            return Err(JobError::InvalidInput("No filename".to_string()).into());
        }

        let job_id = self
            .registry
            .create(EngineSettings::default(), filename, JobStatus::Queued);
        let input = self
            .config
            .upload_dir
            .join(format!("{}{}", job_id, upload_suffix(filename)));

        if let Err(e) = tokio::fs::write(&input, bytes).await {
            self.registry.remove(&job_id);
            return Err(JobError::Io(e).into());
        }

        info!(job_id = %job_id, filename = %filename, bytes = bytes.len(), "Upload accepted");
        self.metrics.record_submission("upload");

        let orchestrator = Arc::clone(&self.orchestrator);
        let id = job_id.clone();
        let handle = self.runner.spawn(job_id.clone(), move |cancel| async move {
            orchestrator.run(&id, &input, cancel).await
        });

        Ok(Submission { job_id, handle })
    }

    /// Starts downloading and separating remote audio.
    ///
    /// # Errors
    ///
    /// Returns `JobError::InvalidInput` if `video_id` is blank.
    pub async fn submit_remote(&self, request: RemoteRequest) -> Result<Submission, ServiceError> {
        let video_id = request.video_id.trim().to_string();
        if video_id.is_empty() {
            return Err(JobError::InvalidInput("video_id is required".to_string()).into());
        }

        let title = request
            .title
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(&video_id);
        let safe = safe_title(title);

        let job_id = self.registry.create(
            request.settings(),
            format!("{}.wav", safe),
            JobStatus::Downloading,
        );
        let out_path = self.fetch.download_path(&job_id, &safe);

        info!(job_id = %job_id, video_id = %video_id, "Remote submission accepted");
        self.metrics.record_submission("remote");

        let fetch = Arc::clone(&self.fetch);
        let id = job_id.clone();
        let handle = self.runner.spawn(job_id.clone(), move |cancel| async move {
            fetch.run(&id, &video_id, &out_path, cancel).await
        });

        Ok(Submission { job_id, handle })
    }

    /// Poll view of a job.
    pub fn status(&self, job_id: &JobId) -> Result<JobStatusView, ServiceError> {
        Ok(self.registry.get(job_id)?.status_view())
    }

    /// Every known job without its stem paths, oldest first.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.registry.list().iter().map(|r| r.summary()).collect()
    }

    /// Cancels a running job. Returns `false` if the job already finished.
    ///
    /// # Errors
    ///
    /// Returns `JobError::NotFound` for unknown jobs.
    pub fn cancel(&self, job_id: &JobId) -> Result<bool, ServiceError> {
        if !self.registry.contains(job_id) {
            return Err(JobError::NotFound(job_id.to_string()).into());
        }
        Ok(self.runner.cancel(job_id))
    }

    /// Cancels every running job.
    pub fn shutdown(&self) {
        self.runner.shutdown();
    }

    /// Locates a stem, transposed by `semitones` when that is more than a
    /// hundredth of a semitone. A failed transposition serves the original.
    ///
    /// # Errors
    ///
    /// Returns `StemError::NotFound` if the stem does not exist.
    pub async fn stem(
        &self,
        job_id: &JobId,
        stem_name: &str,
        semitones: f64,
    ) -> Result<StemFile, ServiceError> {
        let path = self
            .pitch
            .get_or_create(job_id, stem_name, semitones)
            .await?;
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        Ok(StemFile {
            media_type: media_type_for(&path),
            download_name: format!("{}{}", stem_name, ext),
            path,
        })
    }

    /// Tempo/key analysis, computed once per job and memoized.
    ///
    /// # Errors
    ///
    /// - `AnalysisError::Unavailable` without an analyzer
    /// - `AnalysisError::NoStems` if the job has no stems
    pub async fn analyze(&self, job_id: &JobId) -> Result<Analysis, ServiceError> {
        if let Ok(record) = self.registry.get(job_id) {
            if let Some(analysis) = record.analysis {
                return Ok(analysis);
            }
        }

        let stems = self.resolver.resolve(job_id);
        let analysis = self.analyzer.analyze(&stems).await?;

        let cached = analysis.clone();
        let _ = self.registry.update(job_id, move |r| r.set_analysis(cached));
        Ok(analysis)
    }

    /// Deletes all job output except directories of saved projects.
    pub fn evict_outputs(&self) -> EvictionSummary {
        EvictionSummary {
            removed: self.janitor.evict_all(),
            projects_kept: self.projects.len(),
        }
    }

    /// Saves a project and returns it with its id filled in.
    pub fn save_project(&self, payload: Value) -> Result<Project, ServiceError> {
        Ok(self.projects.upsert(payload)?)
    }

    pub fn list_projects(&self) -> Vec<Project> {
        self.projects.list()
    }

    /// Deletes a project and every artifact derived from it.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ProjectNotFound` if no such project is saved.
    pub fn delete_project(&self, project_id: &str) -> Result<(), ServiceError> {
        if !self.projects.remove(project_id)? {
            return Err(StoreError::ProjectNotFound(project_id.to_string()).into());
        }
        self.janitor.delete_project(project_id);
        Ok(())
    }

    /// Deletes every project and its artifacts. Returns how many there were.
    pub fn delete_all_projects(&self) -> Result<usize, ServiceError> {
        let ids = self.projects.clear()?;
        for id in &ids {
            self.janitor.delete_project(id);
        }
        Ok(ids.len())
    }

    pub fn settings(&self) -> Map<String, Value> {
        self.settings.get()
    }

    /// Merges `patch` into the settings.
    pub fn update_settings(&self, patch: Value) -> Result<Map<String, Value>, ServiceError> {
        Ok(self.settings.update(patch)?)
    }

    /// Searches remote audio.
    pub async fn search(&self, query: &str, limit: u32) -> Result<Vec<SearchItem>, ServiceError> {
        Ok(self.fetch.search(query, limit).await?)
    }

    /// Resolved stem paths for a job.
    pub fn stems(&self, job_id: &JobId) -> Result<StemMap, ServiceError> {
        let stems = self.resolver.resolve(job_id);
        if stems.is_empty() {
            return Err(StemError::NoStems(job_id.to_string()).into());
        }
        Ok(stems)
    }
}

/// Extension of an uploaded file name, `.wav` when it has none.
fn upload_suffix(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_else(|| ".wav".to_string())
}
