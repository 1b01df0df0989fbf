//! Separation pipeline: engine supervision, progress parsing and the
//! optional remote fetch stage in front of it.

pub mod engine;
pub mod fetch;
pub mod orchestrator;
pub mod progress;

pub use engine::EngineCommand;
pub use fetch::{safe_title, FetchStage, SearchItem};
pub use orchestrator::SeparationOrchestrator;
pub use progress::{PercentTokenParser, ProgressMonitor, ProgressParser};
