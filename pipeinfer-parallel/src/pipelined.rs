//! Pipelined executor overlapping consecutive batches

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use pipeinfer_core::{
    Error, ErrorPolicy, ExecContext, Executor, ExecutorConfig, ExecutorKind, Item, ItemStream,
    Result, Transform, WorkerCommand, YieldStream, Yielded,
};

use crate::batch::{run_batches, AdaptiveBatcher, BatchBackend, BatchJob, BatchPlan, BatchTicket};
use crate::pool::WorkerPool;
use crate::process::{ProcessBatches, ProcessPool};

enum Backend {
    Threads(WorkerPool),
    Processes(Arc<ProcessPool>),
}

/// Keeps up to `pipeline_depth` batches in flight.
///
/// While batch *k* is being consumed downstream, batches *k+1* and later
/// are already computing. A batch slot frees up once the consumer has
/// yielded the whole batch. With adaptive batching on, batch sizes follow
/// an [`AdaptiveBatcher`] shared by every call on this executor, capped
/// at `max_memory_items / pipeline_depth`.
pub struct PipelinedExecutor {
    backend: Backend,
    config: ExecutorConfig,
    batcher: Option<Arc<Mutex<AdaptiveBatcher>>>,
}

impl PipelinedExecutor {
    /// Overlap batches on a thread pool
    pub fn threads(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new("pipelined", config.max_workers, config.max_memory_items)?;
        Ok(Self::with_backend(Backend::Threads(pool), config))
    }

    /// Overlap batches on worker processes
    pub fn processes(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let command = match &config.worker_command {
            Some(command) => command.clone(),
            None => WorkerCommand::current_exe()?,
        };
        let pool = ProcessPool::spawn(&command, config.max_workers)?;
        Ok(Self::with_backend(Backend::Processes(Arc::new(pool)), config))
    }

    fn with_backend(backend: Backend, config: ExecutorConfig) -> Self {
        let batcher = config.adaptive_batching.then(|| {
            let cap = memory_cap(&config);
            Arc::new(Mutex::new(AdaptiveBatcher::new(
                config.batch_size,
                config.min_batch_size.min(cap),
                config.max_batch_size.min(cap),
            )))
        });
        Self {
            backend,
            config,
            batcher,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Size the next batch will have
    pub fn current_batch_size(&self) -> usize {
        self.batcher
            .as_ref()
            .and_then(|b| b.lock().ok().map(|b| b.size()))
            .unwrap_or_else(|| self.config.batch_size.min(memory_cap(&self.config)))
    }
}

/// Largest batch that keeps `pipeline_depth` batches within the memory cap
fn memory_cap(config: &ExecutorConfig) -> usize {
    (config.max_memory_items / config.pipeline_depth).max(1)
}

impl<T: Item> Executor<T> for PipelinedExecutor {
    fn kind(&self) -> ExecutorKind {
        match self.backend {
            Backend::Threads(_) => ExecutorKind::PipelinedThread,
            Backend::Processes(_) => ExecutorKind::PipelinedProcess,
        }
    }

    fn execute(
        &self,
        transform: Transform<T>,
        input: ItemStream<T>,
        ctx: ExecContext,
    ) -> Result<YieldStream<T>> {
        let backend: Arc<dyn BatchBackend<T>> = match &self.backend {
            Backend::Threads(pool) if pool.is_shut_down() => {
                return Err(Error::resource("pipelined executor is shut down"));
            }
            Backend::Threads(pool) => Arc::new(ThreadBatches { pool: pool.clone() }),
            Backend::Processes(pool) => Arc::new(ProcessBatches::new(Arc::clone(pool))),
        };
        let plan = BatchPlan {
            depth: self.config.pipeline_depth,
            rounds: false,
            batch_size: self.config.batch_size.min(memory_cap(&self.config)),
            batcher: self.batcher.clone(),
        };
        let timeout = ctx.item_timeout.or_else(|| self.config.item_timeout());
        run_batches(backend, transform, input, ctx, plan, timeout)
    }

    fn shutdown(&self) {
        match &self.backend {
            Backend::Threads(pool) => pool.shutdown(),
            Backend::Processes(pool) => pool.shutdown(),
        }
    }
}

/// Spreads the items of each batch over pool threads
struct ThreadBatches {
    pool: WorkerPool,
}

struct BatchState<T> {
    remaining: AtomicUsize,
    outcomes: Mutex<Vec<Option<Yielded<T>>>>,
    ticket: Mutex<Option<BatchTicket<T>>>,
}

impl<T> BatchState<T> {
    fn store(&self, offset: usize, yielded: Yielded<T>) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes[offset] = Some(yielded);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish();
        }
    }

    fn take_ticket(&self) -> Option<BatchTicket<T>> {
        self.ticket.lock().ok().and_then(|mut ticket| ticket.take())
    }

    fn finish(&self) {
        let Some(ticket) = self.take_ticket() else {
            return;
        };
        let outcomes = self
            .outcomes
            .lock()
            .map(|mut outcomes| std::mem::take(&mut *outcomes).into_iter().flatten().collect())
            .map_err(|_| Error::resource("batch results lock poisoned"));
        ticket.complete(outcomes);
    }

    fn fail(&self, err: Error) {
        if let Some(ticket) = self.take_ticket() {
            ticket.complete(Err(err));
        }
    }
}

impl<T: Item> BatchBackend<T> for ThreadBatches {
    fn dispatch(
        &self,
        transform: &Transform<T>,
        policy: ErrorPolicy,
        job: BatchJob<T>,
    ) -> Result<()> {
        let BatchJob { start, items, ticket } = job;
        let size = items.len();
        let state = Arc::new(BatchState {
            remaining: AtomicUsize::new(size),
            outcomes: Mutex::new((0..size).map(|_| None).collect()),
            ticket: Mutex::new(Some(ticket)),
        });

        for (offset, item) in items.into_iter().enumerate() {
            let state_for_job = Arc::clone(&state);
            let transform = transform.clone();
            let job = Box::new(move || {
                let yielded = transform.run(start + offset as u64, &item, &policy);
                state_for_job.store(offset, yielded);
            });
            if let Err(err) = self.pool.submit(job) {
                state.fail(Error::resource(format!("thread pool rejected batch item: {err}")));
                return Err(err);
            }
        }
        Ok(())
    }
}
