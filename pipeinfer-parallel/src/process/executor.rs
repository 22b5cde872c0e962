//! Process-isolated executor

use std::sync::Arc;

use pipeinfer_core::{
    Error, ErrorPolicy, ExecContext, Executor, ExecutorConfig, ExecutorKind, Item, ItemStream,
    Result, Transform, WorkerCommand, YieldStream,
};

use super::pool::{ProcessJob, ProcessPool};
use super::protocol::{decode, encode, Request, Response};
use crate::batch::{run_batches, BatchBackend, BatchJob, BatchPlan};

/// Sends whole batches to worker processes
pub(crate) struct ProcessBatches {
    pool: Arc<ProcessPool>,
}

impl ProcessBatches {
    pub(crate) fn new(pool: Arc<ProcessPool>) -> Self {
        Self { pool }
    }
}

impl<T: Item> BatchBackend<T> for ProcessBatches {
    fn dispatch(
        &self,
        transform: &Transform<T>,
        policy: ErrorPolicy,
        job: BatchJob<T>,
    ) -> Result<()> {
        let BatchJob { start, items, ticket } = job;
        let expected = items.len();
        let request = Request {
            task: transform.name().to_string(),
            start_index: start,
            max_attempts: policy.max_attempts(),
            items,
        };
        let request = match encode(&request) {
            Ok(bytes) => bytes,
            Err(err) => {
                let message = format!("failed to encode batch: {err}");
                ticket.complete(Err(err));
                return Err(Error::resource(message));
            }
        };

        let reply = Box::new(move |response: Result<Vec<u8>>| {
            let outcomes = response
                .and_then(|bytes| decode::<Response<T>>(&bytes))
                .and_then(|response| match response {
                    Response::Done { outcomes } if outcomes.len() == expected => Ok(outcomes),
                    Response::Done { outcomes } => Err(Error::resource(format!(
                        "worker answered {} outcomes for a batch of {expected}",
                        outcomes.len()
                    ))),
                    Response::Rejected { message } => Err(Error::setup(message)),
                });
            ticket.complete(outcomes);
        });
        self.pool.submit(ProcessJob { request, reply })
    }
}

/// Runs a transform in worker processes, one fixed-size batch at a time
/// per worker.
///
/// Items are grouped into `batch_size` batches before crossing the process
/// boundary. Batches go out in rounds of `max_memory_items / batch_size`,
/// and the next round starts only after the consumer has drained the
/// current one, so in-flight items never exceed `max_memory_items`.
/// Results are re-sorted by batch before they are yielded.
///
/// The worker binary must register a transform with the same name; see
/// [`TaskRegistry`](super::TaskRegistry).
pub struct ProcessExecutor {
    pool: Arc<ProcessPool>,
    config: ExecutorConfig,
}

impl ProcessExecutor {
    /// Launch `config.max_workers` workers from `config.worker_command`,
    /// or from the running executable if none is set
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let command = match &config.worker_command {
            Some(command) => command.clone(),
            None => WorkerCommand::current_exe()?,
        };
        let pool = ProcessPool::spawn(&command, config.max_workers)?;
        Ok(Self {
            pool: Arc::new(pool),
            config,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Workers still running
    pub fn alive_workers(&self) -> usize {
        self.pool.alive()
    }

    fn plan(&self) -> BatchPlan {
        let batch_size = self.config.batch_size.clamp(1, self.config.max_memory_items);
        BatchPlan {
            depth: (self.config.max_memory_items / batch_size).max(1),
            rounds: true,
            batch_size,
            batcher: None,
        }
    }
}

impl<T: Item> Executor<T> for ProcessExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Process
    }

    fn execute(
        &self,
        transform: Transform<T>,
        input: ItemStream<T>,
        ctx: ExecContext,
    ) -> Result<YieldStream<T>> {
        if self.pool.alive() == 0 {
            return Err(Error::resource("process executor has no live workers"));
        }
        let backend = Arc::new(ProcessBatches::new(Arc::clone(&self.pool)));
        let timeout = ctx.item_timeout.or_else(|| self.config.item_timeout());
        run_batches(backend, transform, input, ctx, self.plan(), timeout)
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_worker_binary_is_resource_error() {
        let config = ExecutorConfig {
            max_workers: 2,
            worker_command: Some(WorkerCommand::new("/nonexistent/pipeinfer-worker")),
            ..ExecutorConfig::default()
        };
        assert!(matches!(ProcessExecutor::new(config), Err(Error::ExecutorResource(_))));
    }

    #[test]
    fn test_rounds_respect_memory_cap() {
        let config = ExecutorConfig {
            max_workers: 2,
            max_memory_items: 10,
            batch_size: 4,
            worker_command: Some(WorkerCommand::new("/bin/cat")),
            ..ExecutorConfig::default()
        };
        let executor = ProcessExecutor::new(config).unwrap();
        let plan = executor.plan();
        assert_eq!(plan.batch_size, 4);
        assert_eq!(plan.depth, 2);
        assert!(plan.rounds);
        Executor::<i64>::shutdown(&executor);
    }
}
