//! CLI command definitions for stemsplit.
//!
//! Every command builds a [`StemService`] from the environment and calls one
//! of its operations. Job records live only as long as the process, so the
//! `stem` and `analyze` commands rely on on-disk recovery of earlier runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::jobs::{JobId, JobStatus};
use crate::metrics::{export_metrics, init_metrics};
use crate::separation::ProgressMonitor;
use crate::service::{RemoteRequest, StemService, Submission, DEFAULT_SEARCH_LIMIT};

/// How often a running job's progress is logged.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);

/// Stem separation, transposition and project management.
#[derive(Parser)]
#[command(name = "stemsplit")]
#[command(about = "Split songs into stems and manage the results")]
#[command(version)]
#[command(
    long_about = "stemsplit runs an external separation engine over local or remote audio and manages the resulting stems.\n\nPaths and tools are configured through STEMSPLIT_* environment variables.\n\nExample usage:\n  stemsplit separate song.mp3 --json\n  stemsplit stem <JOB_ID> vocals --semitones -2"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Separate a local audio file and wait for the result.
    #[command(alias = "sep")]
    Separate(SeparateArgs),

    /// Download remote audio by video id, then separate it.
    Fetch(FetchArgs),

    /// Search remote audio.
    Search(SearchArgs),

    /// Print the path of a stem, optionally transposed.
    Stem(StemArgs),

    /// Detect tempo and key of a finished job.
    Analyze(AnalyzeArgs),

    /// Delete all job output except saved projects.
    Evict,

    /// Manage saved projects.
    Projects(ProjectsArgs),

    /// Show or change user settings.
    Settings(SettingsArgs),

    /// Print metrics in Prometheus text format.
    Metrics,
}

/// Arguments for `stemsplit separate`.
#[derive(Parser, Debug)]
pub struct SeparateArgs {
    /// Audio file to separate.
    pub file: PathBuf,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `stemsplit fetch`.
#[derive(Parser, Debug)]
pub struct FetchArgs {
    /// Remote video identifier.
    pub video_id: String,

    /// Title used to name the download.
    #[arg(short, long)]
    pub title: Option<String>,

    /// Separation model.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Output JSON to stdout.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `stemsplit search`.
#[derive(Parser, Debug)]
pub struct SearchArgs {
    /// Free-text query.
    pub query: String,

    /// Maximum number of results.
    #[arg(short = 'n', long, default_value_t = DEFAULT_SEARCH_LIMIT)]
    pub limit: u32,
}

/// Arguments for `stemsplit stem`.
#[derive(Parser, Debug)]
pub struct StemArgs {
    /// Job identifier.
    pub job_id: String,

    /// Stem name (vocals, drums, bass, other, ...).
    pub stem: String,

    /// Transposition in semitones, clamped to [-12, 12].
    #[arg(short, long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub semitones: f64,
}

/// Arguments for `stemsplit analyze`.
#[derive(Parser, Debug)]
pub struct AnalyzeArgs {
    /// Job identifier.
    pub job_id: String,
}

/// Arguments for `stemsplit projects`.
#[derive(Parser, Debug)]
pub struct ProjectsArgs {
    #[command(subcommand)]
    pub command: ProjectsSubcommand,
}

/// Project subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum ProjectsSubcommand {
    /// List saved projects, most recent first.
    List,

    /// Delete a project and its artifacts.
    Delete {
        /// Project identifier.
        id: String,
    },

    /// Delete every project and its artifacts.
    Clear,
}

/// Arguments for `stemsplit settings`.
#[derive(Parser, Debug)]
pub struct SettingsArgs {
    #[command(subcommand)]
    pub command: SettingsSubcommand,
}

/// Settings subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum SettingsSubcommand {
    /// Print the merged settings.
    Show,

    /// Set one key. VALUE is parsed as JSON, falling back to a string.
    Set { key: String, value: String },
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registry unavailable");
    }

    if let Commands::Metrics = cli.command {
        print!("{}", export_metrics());
        return Ok(());
    }

    let service = build_service()?;
    match cli.command {
        Commands::Separate(args) => run_separate_command(&service, args).await,
        Commands::Fetch(args) => run_fetch_command(&service, args).await,
        Commands::Search(args) => run_search_command(&service, args).await,
        Commands::Stem(args) => run_stem_command(&service, args).await,
        Commands::Analyze(args) => run_analyze_command(&service, args).await,
        Commands::Evict => print_json(&service.evict_outputs()),
        Commands::Projects(args) => run_projects_command(&service, args),
        Commands::Settings(args) => run_settings_command(&service, args),
        Commands::Metrics => Ok(()),
    }
}

fn build_service() -> anyhow::Result<StemService> {
    let config = ServiceConfig::from_env()?;
    Ok(StemService::new(config)?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let output = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize JSON: {}", e))?;
    println!("{}", output);
    Ok(())
}

// ============================================================================
// Job commands
// ============================================================================

async fn run_separate_command(service: &StemService, args: SeparateArgs) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&args.file)
        .await
        .map_err(|e| anyhow::anyhow!("Cannot read {}: {}", args.file.display(), e))?;
    let filename = file_name_of(&args.file);

    let submission = service.submit_upload(&filename, &bytes).await?;
    await_job(service, submission, args.json).await
}

async fn run_fetch_command(service: &StemService, args: FetchArgs) -> anyhow::Result<()> {
    let mut request = RemoteRequest::new(args.video_id);
    if let Some(title) = args.title {
        request = request.with_title(title);
    }
    if let Some(model) = args.model {
        request = request.with_model(model);
    }

    let submission = service.submit_remote(request).await?;
    await_job(service, submission, args.json).await
}

/// Waits for a submitted job, cancelling it on Ctrl-C, and reports the result.
async fn await_job(
    service: &StemService,
    mut submission: Submission,
    json_output: bool,
) -> anyhow::Result<()> {
    let job_id = submission.job_id.clone();
    info!(job_id = %job_id, "Job submitted");

    let monitor = ProgressMonitor::start(
        service.registry().clone(),
        job_id.clone(),
        PROGRESS_LOG_INTERVAL,
    );

    tokio::select! {
        _ = submission.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!(job_id = %job_id, "Interrupted, cancelling job");
            service.cancel(&job_id)?;
            submission.wait().await;
        }
    }
    monitor.stop().await;

    let status = service.status(&job_id)?;
    let stems = service.stems(&job_id).unwrap_or_default();

    if json_output {
        print_json(&json!({
            "job_id": job_id,
            "status": status.status,
            "progress": status.progress,
            "error": status.error,
            "stems": stems,
        }))?;
    } else {
        println!("Job {}: {}", job_id, status.status);
        for (name, path) in &stems {
            println!("  {:<8} {}", name, path.display());
        }
        if let Some(error) = &status.error {
            println!("  error: {}", error);
        }
    }

    if status.status == JobStatus::Error {
        anyhow::bail!(
            "Job {} failed: {}",
            job_id,
            status.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

async fn run_search_command(service: &StemService, args: SearchArgs) -> anyhow::Result<()> {
    let items = service.search(&args.query, args.limit).await?;
    print_json(&json!({ "results": items }))
}

async fn run_stem_command(service: &StemService, args: StemArgs) -> anyhow::Result<()> {
    let job_id = JobId::from(args.job_id);
    let stem = service.stem(&job_id, &args.stem, args.semitones).await?;
    println!("{}", stem.path.display());
    Ok(())
}

async fn run_analyze_command(service: &StemService, args: AnalyzeArgs) -> anyhow::Result<()> {
    let analysis = service.analyze(&JobId::from(args.job_id)).await?;
    print_json(&analysis)
}

// ============================================================================
// Project and settings commands
// ============================================================================

fn run_projects_command(service: &StemService, args: ProjectsArgs) -> anyhow::Result<()> {
    match args.command {
        ProjectsSubcommand::List => print_json(&service.list_projects()),
        ProjectsSubcommand::Delete { id } => {
            service.delete_project(&id)?;
            print_json(&json!({ "status": "deleted" }))
        }
        ProjectsSubcommand::Clear => {
            let count = service.delete_all_projects()?;
            print_json(&json!({ "status": "cleared", "count": count }))
        }
    }
}

fn run_settings_command(service: &StemService, args: SettingsArgs) -> anyhow::Result<()> {
    match args.command {
        SettingsSubcommand::Show => print_json(&service.settings()),
        SettingsSubcommand::Set { key, value } => {
            let patch = json!({ key: parse_setting_value(&value) });
            print_json(&service.update_settings(patch)?)
        }
    }
}

/// Parses a settings value as JSON, keeping bare words as strings.
fn parse_setting_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
