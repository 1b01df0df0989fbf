//! Command-line interface for stemsplit.
//!
//! Provides commands for separating local and remote audio, reading and
//! transposing stems, analysis, and project and cache management.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
