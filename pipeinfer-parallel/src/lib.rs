//! Parallel executors for pipeinfer pipelines
//!
//! This crate provides the concurrent members of the executor family:
//! - [`ThreadExecutor`]: item-level work on a shared-memory thread pool
//! - [`ProcessExecutor`]: fixed-size batches in isolated worker processes
//! - [`PipelinedExecutor`]: overlapping, adaptively sized batches on
//!   either threads or processes
//!
//! All of them keep outputs in input order and cap the number of items
//! pulled but not yet yielded. [`build_executor`] picks one from an
//! [`ExecutorKind`](pipeinfer_core::ExecutorKind).

#![warn(missing_docs)]

mod batch;
pub mod factory;
pub mod pipelined;
pub mod pool;
pub mod process;
pub mod thread;

pub use batch::AdaptiveBatcher;
pub use factory::{build_executor, executor_for};
pub use pipelined::PipelinedExecutor;
pub use pool::WorkerPool;
pub use process::{is_worker_process, run_worker, ProcessExecutor, ProcessPool, TaskRegistry};
pub use thread::ThreadExecutor;

/// How often a consumer waiting without a deadline rechecks cancellation
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(25);
