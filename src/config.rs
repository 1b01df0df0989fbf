//! Service configuration.
//!
//! Holds the filesystem layout (uploads, job outputs, pitch cache, persisted
//! projects and settings), the external tool invocations, and the time and
//! concurrency budgets. Values come from defaults, `with_*` builder methods,
//! or `STEMSPLIT_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Name of the pitch cache directory under the output root.
pub const PITCH_CACHE_DIRNAME: &str = "_pitch_cache";

/// Default separation model.
pub const DEFAULT_MODEL: &str = "htdemucs";

/// Configuration for the stem service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // Filesystem layout
    /// Directory receiving uploaded and downloaded input audio.
    pub upload_dir: PathBuf,
    /// Root of the per-job output tree.
    pub output_dir: PathBuf,
    /// Flat directory of pitch-shifted renders.
    pub pitch_cache_dir: PathBuf,
    /// Directory holding `settings.json`.
    pub config_dir: PathBuf,
    /// JSON array of saved projects.
    pub projects_file: PathBuf,

    // External tools
    /// Separation engine executable.
    pub engine_program: String,
    /// Engine argument template; see [`crate::separation::EngineCommand`].
    pub engine_args: Vec<String>,
    /// Remote audio fetch tool.
    pub fetch_program: String,
    /// Sample-rate probe utility.
    pub probe_program: String,
    /// Resample/tempo transform utility.
    pub transform_program: String,
    /// Optional tempo/chroma feature extractor. Analysis is unavailable without it.
    pub analyzer_program: Option<String>,

    // Budgets
    /// Wall-clock budget for a remote download.
    pub fetch_timeout: Duration,
    /// Wall-clock budget for a remote search.
    pub search_timeout: Duration,
    /// Optional budget for a whole separation job. `None` means no timeout.
    pub job_timeout: Option<Duration>,
    /// Optional bound on simultaneously running jobs. `None` means unbounded.
    pub max_concurrent_jobs: Option<usize>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let output_dir = PathBuf::from("outputs");
        Self {
            upload_dir: PathBuf::from("uploads"),
            pitch_cache_dir: output_dir.join(PITCH_CACHE_DIRNAME),
            output_dir,
            config_dir: PathBuf::from("config"),
            projects_file: PathBuf::from("projects.json"),

            engine_program: "python".to_string(),
            engine_args: default_engine_args(),
            fetch_program: "yt-dlp".to_string(),
            probe_program: "ffprobe".to_string(),
            transform_program: "ffmpeg".to_string(),
            analyzer_program: None,

            fetch_timeout: Duration::from_secs(120),
            search_timeout: Duration::from_secs(20),
            job_timeout: None,
            max_concurrent_jobs: None,
        }
    }
}

/// Default engine argument template.
pub fn default_engine_args() -> Vec<String> {
    ["-m", "demucs", "-n", "{model}", "-o", "{output}", "{input}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl ServiceConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration whose directories all live under `root`.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        let output_dir = root.join("outputs");
        Self {
            upload_dir: root.join("uploads"),
            pitch_cache_dir: output_dir.join(PITCH_CACHE_DIRNAME),
            output_dir,
            config_dir: root.join("config"),
            projects_file: root.join("projects.json"),
            ..Self::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `STEMSPLIT_ROOT`: base directory for all paths below (default: cwd)
    /// - `STEMSPLIT_UPLOAD_DIR`, `STEMSPLIT_OUTPUT_DIR`, `STEMSPLIT_PITCH_CACHE_DIR`,
    ///   `STEMSPLIT_CONFIG_DIR`, `STEMSPLIT_PROJECTS_FILE`: individual path overrides
    /// - `STEMSPLIT_ENGINE_PROGRAM`: separation engine (default: python)
    /// - `STEMSPLIT_ENGINE_ARGS`: whitespace-separated argument template
    /// - `STEMSPLIT_FETCH_PROGRAM`: fetch tool (default: yt-dlp)
    /// - `STEMSPLIT_PROBE_PROGRAM`: probe utility (default: ffprobe)
    /// - `STEMSPLIT_TRANSFORM_PROGRAM`: transform utility (default: ffmpeg)
    /// - `STEMSPLIT_ANALYZER`: tempo/chroma extractor (default: unset)
    /// - `STEMSPLIT_FETCH_TIMEOUT_SECS` (default: 120)
    /// - `STEMSPLIT_SEARCH_TIMEOUT_SECS` (default: 20)
    /// - `STEMSPLIT_JOB_TIMEOUT_SECS` (default: unset, no timeout)
    /// - `STEMSPLIT_MAX_CONCURRENT_JOBS` (default: unset, unbounded)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("STEMSPLIT_ROOT") {
            Ok(root) => Self::rooted_at(root),
            Err(_) => Self::default(),
        };

        // Paths
        if let Ok(val) = std::env::var("STEMSPLIT_UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("STEMSPLIT_OUTPUT_DIR") {
            config.pitch_cache_dir = PathBuf::from(&val).join(PITCH_CACHE_DIRNAME);
            config.output_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("STEMSPLIT_PITCH_CACHE_DIR") {
            config.pitch_cache_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("STEMSPLIT_CONFIG_DIR") {
            config.config_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("STEMSPLIT_PROJECTS_FILE") {
            config.projects_file = PathBuf::from(val);
        }

        // Tools
        if let Ok(val) = std::env::var("STEMSPLIT_ENGINE_PROGRAM") {
            config.engine_program = val;
        }
        if let Ok(val) = std::env::var("STEMSPLIT_ENGINE_ARGS") {
            config.engine_args = val.split_whitespace().map(String::from).collect();
        }
        if let Ok(val) = std::env::var("STEMSPLIT_FETCH_PROGRAM") {
            config.fetch_program = val;
        }
        if let Ok(val) = std::env::var("STEMSPLIT_PROBE_PROGRAM") {
            config.probe_program = val;
        }
        if let Ok(val) = std::env::var("STEMSPLIT_TRANSFORM_PROGRAM") {
            config.transform_program = val;
        }
        if let Ok(val) = std::env::var("STEMSPLIT_ANALYZER") {
            if !val.trim().is_empty() {
                config.analyzer_program = Some(val);
            }
        }

        // Budgets
        if let Ok(val) = std::env::var("STEMSPLIT_FETCH_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "STEMSPLIT_FETCH_TIMEOUT_SECS")?;
            config.fetch_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("STEMSPLIT_SEARCH_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "STEMSPLIT_SEARCH_TIMEOUT_SECS")?;
            config.search_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("STEMSPLIT_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "STEMSPLIT_JOB_TIMEOUT_SECS")?;
            config.job_timeout = Some(Duration::from_secs(secs));
        }
        if let Ok(val) = std::env::var("STEMSPLIT_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs =
                Some(parse_env_value(&val, "STEMSPLIT_MAX_CONCURRENT_JOBS")?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine_program.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "engine_program cannot be empty".to_string(),
            ));
        }

        if !self.engine_args.iter().any(|a| a.contains("{input}")) {
            return Err(ConfigError::ValidationFailed(
                "engine_args must reference {input}".to_string(),
            ));
        }

        if !self.engine_args.iter().any(|a| a.contains("{output}")) {
            return Err(ConfigError::ValidationFailed(
                "engine_args must reference {output}".to_string(),
            ));
        }

        if self.fetch_program.trim().is_empty()
            || self.probe_program.trim().is_empty()
            || self.transform_program.trim().is_empty()
        {
            return Err(ConfigError::ValidationFailed(
                "tool programs cannot be empty".to_string(),
            ));
        }

        if self.fetch_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "fetch_timeout must be greater than 0".to_string(),
            ));
        }

        if self.search_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "search_timeout must be greater than 0".to_string(),
            ));
        }

        if matches!(self.job_timeout, Some(t) if t.is_zero()) {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0 when set".to_string(),
            ));
        }

        if self.max_concurrent_jobs == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent_jobs must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of the persisted settings object.
    pub fn settings_file(&self) -> PathBuf {
        self.config_dir.join("settings.json")
    }

    /// Creates the upload, output, pitch cache and config directories.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        for dir in [
            &self.upload_dir,
            &self.output_dir,
            &self.pitch_cache_dir,
            &self.config_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Sets the separation engine program and argument template.
    pub fn with_engine(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.engine_program = program.into();
        self.engine_args = args;
        self
    }

    /// Sets the fetch tool program.
    pub fn with_fetch_program(mut self, program: impl Into<String>) -> Self {
        self.fetch_program = program.into();
        self
    }

    /// Sets the probe utility program.
    pub fn with_probe_program(mut self, program: impl Into<String>) -> Self {
        self.probe_program = program.into();
        self
    }

    /// Sets the transform utility program.
    pub fn with_transform_program(mut self, program: impl Into<String>) -> Self {
        self.transform_program = program.into();
        self
    }

    /// Sets the analyzer program.
    pub fn with_analyzer_program(mut self, program: impl Into<String>) -> Self {
        self.analyzer_program = Some(program.into());
        self
    }

    /// Sets the fetch timeout.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the search timeout.
    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout = timeout;
        self
    }

    /// Sets the per-job timeout.
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Bounds the number of simultaneously running jobs.
    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = Some(max);
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.upload_dir, PathBuf::from("uploads"));
        assert_eq!(config.output_dir, PathBuf::from("outputs"));
        assert_eq!(config.pitch_cache_dir, PathBuf::from("outputs/_pitch_cache"));
        assert_eq!(config.settings_file(), PathBuf::from("config/settings.json"));
        assert_eq!(config.fetch_timeout, Duration::from_secs(120));
        assert_eq!(config.search_timeout, Duration::from_secs(20));
        assert!(config.job_timeout.is_none());
        assert!(config.max_concurrent_jobs.is_none());
        assert!(config.analyzer_program.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rooted_at() {
        let config = ServiceConfig::rooted_at("/srv/stems");
        assert_eq!(config.upload_dir, PathBuf::from("/srv/stems/uploads"));
        assert_eq!(
            config.pitch_cache_dir,
            PathBuf::from("/srv/stems/outputs/_pitch_cache")
        );
        assert_eq!(config.projects_file, PathBuf::from("/srv/stems/projects.json"));
    }

    #[test]
    fn test_config_builder() {
        let config = ServiceConfig::new()
            .with_engine("sh", vec!["-c".into(), "run {input} {output}".into()])
            .with_fetch_program("fetcher")
            .with_probe_program("probe")
            .with_transform_program("transform")
            .with_analyzer_program("analyze")
            .with_fetch_timeout(Duration::from_secs(5))
            .with_search_timeout(Duration::from_secs(2))
            .with_job_timeout(Duration::from_secs(600))
            .with_max_concurrent_jobs(2);

        assert_eq!(config.engine_program, "sh");
        assert_eq!(config.fetch_program, "fetcher");
        assert_eq!(config.analyzer_program.as_deref(), Some("analyze"));
        assert_eq!(config.job_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.max_concurrent_jobs, Some(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_requires_input_placeholder() {
        let config = ServiceConfig::new().with_engine("demucs", vec!["-o".into(), "{output}".into()]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed(_))
        ));
    }

    #[test]
    fn test_validation_zero_budgets() {
        let config = ServiceConfig::new().with_fetch_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = ServiceConfig::new().with_max_concurrent_jobs(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_env_value() {
        let v: u64 = parse_env_value(" 42 ", "KEY").expect("should parse");
        assert_eq!(v, 42);

        let err = parse_env_value::<u64>("abc", "KEY").unwrap_err();
        assert!(err.to_string().contains("KEY"));
    }

    #[test]
    fn test_ensure_directories() {
        let tmp = tempfile::TempDir::new().expect("tempdir");
        let config = ServiceConfig::rooted_at(tmp.path());
        config.ensure_directories().expect("create dirs");
        assert!(config.upload_dir.is_dir());
        assert!(config.pitch_cache_dir.is_dir());
        assert!(config.config_dir.is_dir());
    }
}
