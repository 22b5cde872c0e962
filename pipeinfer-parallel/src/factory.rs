//! Executor construction keyed on [`ExecutorKind`]

use std::sync::Arc;

use pipeinfer_core::{
    Error, Executor, ExecutorConfig, ExecutorKind, Item, Result, SequentialExecutor,
};

use crate::pipelined::PipelinedExecutor;
use crate::process::ProcessExecutor;
use crate::thread::ThreadExecutor;

/// Build the executor for `kind` with the given configuration.
///
/// The kind is resolved against `config.max_workers` first, so one worker
/// or fewer always yields a [`SequentialExecutor`].
pub fn build_executor<T: Item>(
    kind: ExecutorKind,
    config: &ExecutorConfig,
) -> Result<Arc<dyn Executor<T>>> {
    config.validate()?;
    let resolved = kind.resolve(config.max_workers);
    tracing::debug!(
        requested = %kind,
        %resolved,
        workers = config.max_workers,
        "building executor"
    );

    let executor: Arc<dyn Executor<T>> = match resolved {
        ExecutorKind::Sequential => Arc::new(SequentialExecutor::new()),
        ExecutorKind::Thread => Arc::new(ThreadExecutor::new(config.clone())?),
        ExecutorKind::Process => Arc::new(ProcessExecutor::new(config.clone())?),
        ExecutorKind::PipelinedThread => Arc::new(PipelinedExecutor::threads(config.clone())?),
        ExecutorKind::PipelinedProcess => Arc::new(PipelinedExecutor::processes(config.clone())?),
        ExecutorKind::Auto => return Err(Error::setup("executor kind 'auto' did not resolve")),
    };
    Ok(executor)
}

/// Build the executor for `kind` with defaults tuned for `parallel_degree`
pub fn executor_for<T: Item>(
    kind: ExecutorKind,
    parallel_degree: usize,
) -> Result<Arc<dyn Executor<T>>> {
    build_executor(kind, &ExecutorConfig::for_kind(kind, parallel_degree))
}
