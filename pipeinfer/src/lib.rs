//! Pipelined DAG execution of operators with pluggable executors
//!
//! A [`Pipeline`] is a named graph of [`PipelineOperator`]s. Each operator
//! runs its transform on an executor from the family in
//! [`pipeinfer_parallel`] (sequential, threads, processes, or overlapping
//! batches). Execution walks the graph either stage by stage or with every
//! node running at once over bounded edges, on a tokio runtime or on plain
//! threads. Listeners observe the run through events. The result is a
//! [`PipelineReport`] with a status per node.
//!
//! The building blocks live in their own crates and are re-exported here:
//! - [`pipeinfer_core`]: items, transforms, events, dispatch, monitor, errors
//! - [`pipeinfer_parallel`]: thread, process and pipelined executors
//! - [`pipeinfer_readers`]: file-backed sources

#![warn(missing_docs)]

pub mod dag;
pub mod ops;
pub mod pipeline;
mod scheduler;

pub use dag::Dag;
pub use pipeline::Pipeline;

pub use pipeinfer_core::{
    shared, CancellationToken, CollectingListener, DispatchConfig, DispatchStats, Error, ErrorKind,
    ErrorPolicy, Event, EventKind, EventListener, EventMode, ExecContext, ExecutionMode, Executor,
    ExecutorConfig, ExecutorKind, InFlightGauge, Item, ItemStream, LoggingListener, NodeOutput,
    NodeReport, NodeStatus, NodeTiming, OperatorStats, OverflowPolicy, PerformanceListener,
    PipelineConfig, PipelineOperator, PipelineReport, ProgressConfig, Result, SchedulerBackend,
    SharedListener, SharedMonitor, Source, Transform, YieldStream, Yielded,
};
pub use pipeinfer_parallel::{
    build_executor, executor_for, PipelinedExecutor, ProcessExecutor, ThreadExecutor,
};

pub use pipeinfer_parallel as parallel;
pub use pipeinfer_readers as readers;
