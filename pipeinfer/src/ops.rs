//! Operator constructors bound to a freshly built executor
//!
//! The operator owns its executor and shuts it down when dropped. Process
//! kinds run the transform in worker processes, which look it up by the
//! operator's name; the worker binary must register a task of that name.

use pipeinfer_core::{ErrorPolicy, ExecutorKind, Item, PipelineOperator, Result};
use pipeinfer_parallel::executor_for;

fn bind<T: Item>(
    operator: PipelineOperator<T>,
    parallel_degree: usize,
    kind: ExecutorKind,
) -> Result<PipelineOperator<T>> {
    let executor = executor_for::<T>(kind, parallel_degree)?;
    Ok(operator.with_owned_executor(executor))
}

/// A map running on `parallel_degree` workers of `kind`
pub fn map<T, F>(
    name: &str,
    f: F,
    parallel_degree: usize,
    kind: ExecutorKind,
) -> Result<PipelineOperator<T>>
where
    T: Item,
    F: Fn(&T) -> anyhow::Result<T> + Send + Sync + 'static,
{
    bind(PipelineOperator::map(name, f), parallel_degree, kind)
}

/// A filter running on `parallel_degree` workers of `kind`
pub fn filter<T, P>(
    name: &str,
    predicate: P,
    parallel_degree: usize,
    kind: ExecutorKind,
) -> Result<PipelineOperator<T>>
where
    T: Item,
    P: Fn(&T) -> bool + Send + Sync + 'static,
{
    bind(PipelineOperator::filter(name, predicate), parallel_degree, kind)
}

/// A sink running on `parallel_degree` workers of `kind`
pub fn sink<T, F>(
    name: &str,
    f: F,
    parallel_degree: usize,
    kind: ExecutorKind,
) -> Result<PipelineOperator<T>>
where
    T: Item,
    F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
{
    bind(PipelineOperator::sink(name, f), parallel_degree, kind)
}

/// A sequential map with the given error policy
pub fn map_with_policy<T, F>(name: &str, f: F, policy: ErrorPolicy) -> PipelineOperator<T>
where
    T: Item,
    F: Fn(&T) -> anyhow::Result<T> + Send + Sync + 'static,
{
    PipelineOperator::map(name, f).with_error_policy(policy)
}
