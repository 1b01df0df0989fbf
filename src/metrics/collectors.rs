//! High-level recording interface over the raw Prometheus metrics.
//!
//! Every method is a no-op when [`super::init_metrics`] was never called, so
//! library code can record unconditionally.

use super::prometheus::{
    EVICTED_ENTRIES, JOBS_ACTIVE, JOBS_FINISHED, JOBS_SUBMITTED, JOB_DURATION,
    PITCH_CACHE_LOOKUPS,
};

/// Result of a pitch-shift cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PitchLookup {
    /// A fresh render was already on disk.
    Hit,
    /// A render was generated.
    Miss,
    /// Generation failed and the original stem was served.
    Fallback,
}

impl PitchLookup {
    fn label(&self) -> &'static str {
        match self {
            PitchLookup::Hit => "hit",
            PitchLookup::Miss => "miss",
            PitchLookup::Fallback => "fallback",
        }
    }
}

/// Metrics collector for recording stemsplit operational metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a job submission from `source` (`upload` or `remote`).
    pub fn record_submission(&self, source: &str) {
        if let Some(counter) = JOBS_SUBMITTED.get() {
            counter.with_label_values(&[source]).inc();
        }
    }

    /// Record a job entering its background task.
    pub fn job_started(&self) {
        if let Some(gauge) = JOBS_ACTIVE.get() {
            gauge.inc();
        }
    }

    /// Record a finished job.
    ///
    /// # Arguments
    ///
    /// * `outcome` - Terminal status (`done` or `error`)
    /// * `duration_secs` - Time spent in the background task
    pub fn job_finished(&self, outcome: &str, duration_secs: f64) {
        if let Some(gauge) = JOBS_ACTIVE.get() {
            gauge.dec();
        }
        if let Some(counter) = JOBS_FINISHED.get() {
            counter.with_label_values(&[outcome]).inc();
        }
        if let Some(histogram) = JOB_DURATION.get() {
            histogram.with_label_values(&[outcome]).observe(duration_secs);
        }

        tracing::trace!(outcome = outcome, duration_secs = duration_secs, "Recorded job metric");
    }

    /// Record a pitch-shift cache lookup.
    pub fn record_pitch_lookup(&self, lookup: PitchLookup) {
        if let Some(counter) = PITCH_CACHE_LOOKUPS.get() {
            counter.with_label_values(&[lookup.label()]).inc();
        }
    }

    /// Record the counts of one eviction pass.
    pub fn record_eviction(&self, dirs: u64, files: u64, protected: u64) {
        if let Some(counter) = EVICTED_ENTRIES.get() {
            counter.with_label_values(&["dir"]).inc_by(dirs as f64);
            counter.with_label_values(&["file"]).inc_by(files as f64);
            counter.with_label_values(&["protected"]).inc_by(protected as f64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_init_is_noop() {
        let collector = MetricsCollector::new();
        collector.record_submission("upload");
        collector.job_started();
        collector.job_finished("done", 1.5);
        collector.record_pitch_lookup(PitchLookup::Hit);
        collector.record_eviction(1, 2, 3);
    }

    #[test]
    fn test_recording_after_init() {
        let _ = super::super::init_metrics();
        let collector = MetricsCollector::new();
        collector.record_pitch_lookup(PitchLookup::Fallback);
        collector.record_eviction(2, 0, 1);

        let text = super::super::export_metrics();
        assert!(text.contains("stemsplit_pitch_cache_lookups_total"));
    }

    #[test]
    fn test_pitch_lookup_labels() {
        assert_eq!(PitchLookup::Hit.label(), "hit");
        assert_eq!(PitchLookup::Miss.label(), "miss");
        assert_eq!(PitchLookup::Fallback.label(), "fallback");
    }
}
