//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks job submissions and outcomes, pitch-shift cache effectiveness and
//! output eviction.
//!
//! # Example
//!
//! ```ignore
//! use stemsplit::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_submission("upload");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, PitchLookup};
pub use self::prometheus::{export_metrics, init_metrics};
