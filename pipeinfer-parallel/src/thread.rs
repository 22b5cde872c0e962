//! Shared-memory executor backed by a worker thread pool

use std::collections::{BTreeMap, HashMap, HashSet};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use pipeinfer_core::{
    CancellationToken, Error, ExecContext, Executor, ExecutorConfig, ExecutorKind, InFlightGauge,
    Item, ItemFailure, ItemStream, Result, Transform, YieldStream, Yielded,
};

use crate::pool::WorkerPool;
use crate::POLL_INTERVAL;

/// Runs a transform item by item on a pool of threads.
///
/// A feeder thread takes a permit before pulling each input item, and the
/// consumer returns the permit when it yields that item's result, so at
/// most `max_memory_items` items are ever pulled but not yet yielded.
/// Results are re-sequenced by input index before they are yielded.
///
/// An item's timeout runs from the moment it is handed to the pool, so a
/// slow input stream never counts against the items it has yet to produce.
pub struct ThreadExecutor {
    pool: WorkerPool,
    config: ExecutorConfig,
}

impl ThreadExecutor {
    /// Start a pool of `config.max_workers` threads
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new("thread", config.max_workers, config.max_memory_items)?;
        Ok(Self { pool, config })
    }

    /// Run on an existing pool
    pub fn with_pool(pool: WorkerPool, config: ExecutorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    /// Configuration in use
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

enum Slot<T> {
    Submitted(u64, Instant),
    Done(u64, Yielded<T>),
    End(u64),
    Broken(Error),
}

impl<T: Item> Executor<T> for ThreadExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Thread
    }

    fn execute(
        &self,
        transform: Transform<T>,
        input: ItemStream<T>,
        ctx: ExecContext,
    ) -> Result<YieldStream<T>> {
        if self.pool.is_shut_down() {
            return Err(Error::resource("thread executor is shut down"));
        }
        let capacity = self.config.max_memory_items;
        let (permit_tx, permit_rx) = channel::bounded::<()>(capacity);
        // One submission and one result per permit, plus the end marker.
        let (result_tx, result_rx) = channel::bounded::<Slot<T>>(2 * capacity + 1);

        let feeder = Feeder {
            pool: self.pool.clone(),
            transform,
            input,
            ctx: ctx.clone(),
            permits: permit_tx,
            results: result_tx,
        };
        thread::Builder::new()
            .name(format!("pipeinfer-{}-feeder", ctx.operator))
            .spawn(move || feeder.run())
            .map_err(|e| Error::resource(format!("failed to spawn feeder thread: {e}")))?;

        Ok(Box::new(OrderedResults {
            results: result_rx,
            permits: permit_rx,
            pending: BTreeMap::new(),
            submitted: HashMap::new(),
            timed_out: HashSet::new(),
            next_index: 0,
            total: None,
            gauge: ctx.gauge,
            cancel: ctx.cancel,
            timeout: ctx.item_timeout.or_else(|| self.config.item_timeout()),
            finished: false,
        }))
    }

    fn shutdown(&self) {
        self.pool.shutdown();
    }
}

struct Feeder<T> {
    pool: WorkerPool,
    transform: Transform<T>,
    input: ItemStream<T>,
    ctx: ExecContext,
    permits: Sender<()>,
    results: Sender<Slot<T>>,
}

impl<T: Item> Feeder<T> {
    fn run(mut self) {
        let mut index = 0_u64;
        loop {
            if self.ctx.cancel.is_cancelled() {
                break;
            }
            // Blocks while the in-flight cap is reached; fails once the consumer is gone.
            if self.permits.send(()).is_err() {
                return;
            }
            let Some(item) = self.input.next() else {
                break;
            };
            self.ctx.gauge.enter(1);

            if self.results.send(Slot::Submitted(index, Instant::now())).is_err() {
                return;
            }
            let transform = self.transform.clone();
            let policy = self.ctx.policy;
            let results = self.results.clone();
            let job = Box::new(move || {
                let yielded = transform.run(index, &item, &policy);
                let _ = results.send(Slot::Done(index, yielded));
            });
            if let Err(err) = self.pool.submit(job) {
                let _ = self.results.send(Slot::Broken(err));
                return;
            }
            index += 1;
        }
        let _ = self.results.send(Slot::End(index));
    }
}

struct OrderedResults<T> {
    results: Receiver<Slot<T>>,
    permits: Receiver<()>,
    pending: BTreeMap<u64, Yielded<T>>,
    submitted: HashMap<u64, Instant>,
    timed_out: HashSet<u64>,
    next_index: u64,
    total: Option<u64>,
    gauge: InFlightGauge,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    finished: bool,
}

impl<T> OrderedResults<T> {
    fn release(&self) {
        let _ = self.permits.try_recv();
        self.gauge.leave(1);
    }

    /// When the next item in order runs out of time.
    ///
    /// `None` until that item has been handed to the pool.
    fn deadline(&self) -> Option<Instant> {
        let timeout = self.timeout?;
        self.submitted.get(&self.next_index).map(|at| *at + timeout)
    }

    fn expire(&mut self) -> Yielded<T> {
        let index = self.next_index;
        self.next_index += 1;
        self.submitted.remove(&index);
        self.timed_out.insert(index);
        let waited = self.timeout.unwrap_or_default();
        tracing::warn!(index, ?waited, "item timed out");
        Yielded::Failed(ItemFailure::timed_out(index, format!("no result after {waited:?}")))
    }

    fn stop(&mut self, err: Error) -> Option<Result<Yielded<T>>> {
        self.finished = true;
        Some(Err(err))
    }
}

impl<T: Item> Iterator for OrderedResults<T> {
    type Item = Result<Yielded<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                return self.stop(Error::Cancelled);
            }
            if let Some(yielded) = self.pending.remove(&self.next_index) {
                self.next_index += 1;
                self.release();
                return Some(Ok(yielded));
            }
            if self.total.is_some_and(|total| self.next_index >= total) {
                self.finished = true;
                return None;
            }

            // Once overdue, only results already queued can still save the item.
            let left = self
                .deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let wait = left.map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL));

            match self.results.recv_timeout(wait) {
                Ok(Slot::Submitted(index, at)) => {
                    self.submitted.insert(index, at);
                }
                Ok(Slot::Done(index, yielded)) => {
                    self.submitted.remove(&index);
                    if self.timed_out.remove(&index) {
                        // Already reported as timed out; free its slot.
                        self.release();
                    } else {
                        self.pending.insert(index, yielded);
                    }
                }
                Ok(Slot::End(total)) => self.total = Some(total),
                Ok(Slot::Broken(err)) => return self.stop(err),
                Err(RecvTimeoutError::Timeout) if left.is_some_and(|left| left.is_zero()) => {
                    return Some(Ok(self.expire()));
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    let err = Error::resource("thread executor feeder stopped unexpectedly");
                    return self.stop(err);
                }
            }
        }
    }
}
