//! Background execution of separation jobs.
//!
//! - **TaskRunner**: one tokio task per job, each with a cancellation token
//! - **TaskRunnerConfig**: optional concurrency bound and per-job timeout
//!
//! # Example
//!
//! ```rust,ignore
//! use stemsplit::scheduler::{TaskRunner, TaskRunnerConfig};
//!
//! let runner = TaskRunner::new(TaskRunnerConfig::default().with_max_concurrent(2));
//! let handle = runner.spawn(job_id.clone(), move |cancel| async move {
//!     orchestrator.run(&job_id, &input, cancel).await
//! });
//! ```

pub mod task_runner;

pub use task_runner::{RunnerStats, TaskRunner, TaskRunnerConfig};
