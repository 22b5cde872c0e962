//! Core traits, events and executors for pipeinfer pipelines
//!
//! This crate defines the contract every other pipeinfer crate builds on:
//! the item and transform types, the executor trait, the operator
//! contract, the event model with its dispatchers, the shared performance
//! monitor and the error taxonomy.

#![warn(missing_docs)]

pub mod cancel;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod executor;
pub mod listener;
pub mod memory;
pub mod monitor;
pub mod operator;
pub mod schedule;
pub mod source;
pub mod transform;

// Re-export key types for convenience
pub use cancel::CancellationToken;
pub use config::{
    DispatchConfig, ErrorPolicy, EventMode, ExecutorConfig, ExecutorKind, OverflowPolicy,
    ProgressConfig, RetryFallback, WorkerCommand,
};
pub use dispatch::{DispatchStats, EventDispatcher, ListenerRegistry, ListenerScope};
pub use error::{Error, ErrorKind, Result};
pub use event::{Event, EventKind, ItemContext};
pub use executor::{ExecContext, Executor, SequentialExecutor, YieldStream};
pub use listener::{
    shared, CollectingListener, EventListener, LoggingListener, OperatorStats,
    PerformanceListener, SharedListener,
};
pub use memory::InFlightGauge;
pub use monitor::{MonitorHandle, Session, SharedMonitor};
pub use operator::{OperatorRun, OperatorStream, PipelineOperator, RunSummary};
pub use schedule::{
    ExecutionMode, NodeOutput, NodeReport, NodeStatus, NodeTiming, PipelineConfig,
    PipelineReport, SchedulerBackend,
};
pub use source::{GeneratorSource, IterSource, Source, SourceStream};
pub use transform::{Item, ItemFailure, ItemStream, Transform, TransformKind, Yielded};
