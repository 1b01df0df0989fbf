//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by stemsplit and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all stemsplit metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs submitted, labeled by source (`upload`, `remote`).
pub static JOBS_SUBMITTED: OnceLock<CounterVec> = OnceLock::new();

/// Jobs finished, labeled by outcome (`done`, `error`).
pub static JOBS_FINISHED: OnceLock<CounterVec> = OnceLock::new();

/// Wall-clock duration of finished jobs in seconds, labeled by outcome.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs currently running in the background.
pub static JOBS_ACTIVE: OnceLock<Gauge> = OnceLock::new();

/// Pitch-shift lookups, labeled by result (`hit`, `miss`, `fallback`).
pub static PITCH_CACHE_LOOKUPS: OnceLock<CounterVec> = OnceLock::new();

/// Output cache entries handled by eviction, labeled by kind
/// (`dir`, `file`, `protected`).
pub static EVICTED_ENTRIES: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at application startup. Later calls leave the first set of
/// metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_submitted = CounterVec::new(
        Opts::new("stemsplit_jobs_submitted_total", "Total separation jobs submitted"),
        &["source"],
    )?;

    let jobs_finished = CounterVec::new(
        Opts::new("stemsplit_jobs_finished_total", "Total separation jobs finished"),
        &["outcome"],
    )?;

    let job_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "stemsplit_job_duration_seconds",
            "Separation job duration in seconds",
        )
        .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
        &["outcome"],
    )?;

    let jobs_active = Gauge::new("stemsplit_jobs_active", "Separation jobs currently running")?;

    let pitch_cache_lookups = CounterVec::new(
        Opts::new("stemsplit_pitch_cache_lookups_total", "Pitch-shift cache lookups"),
        &["result"],
    )?;

    let evicted_entries = CounterVec::new(
        Opts::new(
            "stemsplit_output_eviction_entries_total",
            "Output cache entries removed or protected during eviction",
        ),
        &["kind"],
    )?;

    registry.register(Box::new(jobs_submitted.clone()))?;
    registry.register(Box::new(jobs_finished.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_active.clone()))?;
    registry.register(Box::new(pitch_cache_lookups.clone()))?;
    registry.register(Box::new(evicted_entries.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = JOBS_SUBMITTED.set(jobs_submitted);
    let _ = JOBS_FINISHED.set(jobs_finished);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_ACTIVE.set(jobs_active);
    let _ = PITCH_CACHE_LOOKUPS.set(pitch_cache_lookups);
    let _ = EVICTED_ENTRIES.set(evicted_entries);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
