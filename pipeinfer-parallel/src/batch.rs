//! Batch dispatch shared by the process and pipelined executors

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use pipeinfer_core::{
    CancellationToken, Error, ErrorPolicy, Event, EventDispatcher, ExecContext, InFlightGauge, Item,
    ItemFailure, ItemStream, Result, Transform, YieldStream, Yielded,
};

use crate::POLL_INTERVAL;

/// Smoothing factor of the per-item latency average
const LATENCY_ALPHA: f64 = 0.3;

/// Relative latency change that triggers a resize
const LATENCY_TOLERANCE: f64 = 0.1;

/// Resizes batches from observed per-item latency.
///
/// Keeps an exponential moving average of per-item latency. When the
/// average falls more than 10% below the level at the last resize the
/// batch doubles; when it rises more than 10% above, or completed
/// batches pile up waiting for the consumer, the batch halves.
#[derive(Debug, Clone)]
pub struct AdaptiveBatcher {
    size: usize,
    min: usize,
    max: usize,
    average: Option<f64>,
    baseline: Option<f64>,
}

impl AdaptiveBatcher {
    /// Start at `initial`, clamped to `[min, max]`
    pub fn new(initial: usize, min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        Self {
            size: initial.clamp(min, max),
            min,
            max,
            average: None,
            baseline: None,
        }
    }

    /// Size of the next batch
    pub fn size(&self) -> usize {
        self.size
    }

    /// Smoothed per-item latency, once a batch has been observed
    pub fn average_latency(&self) -> Option<Duration> {
        self.average.map(Duration::from_secs_f64)
    }

    /// Feed one completed batch.
    ///
    /// `backed_up` reports that finished batches are waiting on the
    /// consumer, which always shrinks the next batch.
    pub fn observe(&mut self, elapsed: Duration, items: usize, backed_up: bool) {
        if items == 0 {
            return;
        }
        let per_item = elapsed.as_secs_f64() / items as f64;
        let average = match self.average {
            Some(average) => average + LATENCY_ALPHA * (per_item - average),
            None => per_item,
        };
        self.average = Some(average);

        if backed_up {
            self.shrink();
            self.baseline = Some(average);
            return;
        }
        match self.baseline {
            None => self.baseline = Some(average),
            Some(baseline) if average < baseline * (1.0 - LATENCY_TOLERANCE) => {
                self.grow();
                self.baseline = Some(average);
            }
            Some(baseline) if average > baseline * (1.0 + LATENCY_TOLERANCE) => {
                self.shrink();
                self.baseline = Some(average);
            }
            Some(_) => {}
        }
    }

    fn grow(&mut self) {
        let size = self.size.saturating_mul(2).min(self.max);
        if size != self.size {
            tracing::debug!(from = self.size, to = size, "growing batch size");
            self.size = size;
        }
    }

    fn shrink(&mut self) {
        let size = (self.size / 2).max(self.min);
        if size != self.size {
            tracing::debug!(from = self.size, to = size, "shrinking batch size");
            self.size = size;
        }
    }
}

/// Result of one batch, sent back to the consuming side
pub(crate) struct BatchDone<T> {
    id: u64,
    size: usize,
    elapsed: Duration,
    outcomes: Result<Vec<Yielded<T>>>,
}

/// Completion handle travelling with a batch.
///
/// A ticket dropped without `complete` reports the batch as abandoned,
/// so a lost batch never leaves the consumer waiting.
pub(crate) struct BatchTicket<T> {
    id: u64,
    size: usize,
    started: Instant,
    operator: Arc<str>,
    events: Option<Arc<EventDispatcher>>,
    done: Option<Sender<BatchDone<T>>>,
}

impl<T> BatchTicket<T> {
    fn new(id: u64, size: usize, ctx: &ExecContext, done: Sender<BatchDone<T>>) -> Self {
        Self {
            id,
            size,
            started: Instant::now(),
            operator: Arc::clone(&ctx.operator),
            events: ctx.events.clone(),
            done: Some(done),
        }
    }

    /// Report the batch outcome and emit its completion event
    pub(crate) fn complete(mut self, outcomes: Result<Vec<Yielded<T>>>) {
        let elapsed = self.started.elapsed();
        if outcomes.is_ok() {
            if let Some(events) = &self.events {
                events.notify(Event::batch_complete(&*self.operator, self.id, self.size, elapsed));
            }
        }
        if let Some(done) = self.done.take() {
            let _ = done.send(BatchDone {
                id: self.id,
                size: self.size,
                elapsed,
                outcomes,
            });
        }
    }
}

impl<T> Drop for BatchTicket<T> {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(BatchDone {
                id: self.id,
                size: self.size,
                elapsed: self.started.elapsed(),
                outcomes: Err(Error::resource(format!("batch {} was abandoned", self.id))),
            });
        }
    }
}

/// Items of one batch with their global start index
pub(crate) struct BatchJob<T> {
    pub(crate) start: u64,
    pub(crate) items: Vec<T>,
    pub(crate) ticket: BatchTicket<T>,
}

/// Something that can compute a batch off the consuming thread
pub(crate) trait BatchBackend<T: Item>: Send + Sync {
    /// Start computing `job`.
    ///
    /// The job's ticket must eventually be completed or dropped. On `Err`
    /// the backend has already completed the ticket with the cause, and
    /// no further batches are dispatched.
    fn dispatch(
        &self,
        transform: &Transform<T>,
        policy: ErrorPolicy,
        job: BatchJob<T>,
    ) -> Result<()>;
}

/// How batches are sized and overlapped
pub(crate) struct BatchPlan {
    /// Batches allowed in flight at once
    pub(crate) depth: usize,

    /// Wait for a whole group of `depth` batches to be consumed before
    /// dispatching the next group, instead of refilling slot by slot
    pub(crate) rounds: bool,

    /// Fixed batch size, or the starting size when adaptive
    pub(crate) batch_size: usize,

    /// Runtime resizing, shared across calls on one executor
    pub(crate) batcher: Option<Arc<Mutex<AdaptiveBatcher>>>,
}

impl BatchPlan {
    fn next_size(&self) -> usize {
        self.batcher
            .as_ref()
            .and_then(|b| b.lock().ok().map(|b| b.size()))
            .unwrap_or(self.batch_size)
            .max(1)
    }
}

struct Announced {
    start: u64,
    size: usize,
    at: Instant,
}

/// Drive `input` through `backend` in batches and yield results in order.
///
/// `timeout` bounds each batch from the moment it is dispatched. Time
/// spent waiting on `input` to fill a batch is never counted.
pub(crate) fn run_batches<T: Item>(
    backend: Arc<dyn BatchBackend<T>>,
    transform: Transform<T>,
    input: ItemStream<T>,
    ctx: ExecContext,
    plan: BatchPlan,
    timeout: Option<Duration>,
) -> Result<YieldStream<T>> {
    let plan = Arc::new(plan);
    let (done_tx, done_rx) = channel::unbounded();
    let (consumed_tx, consumed_rx) = channel::unbounded();
    let (announce_tx, announce_rx) = channel::unbounded();

    let feeder = BatchFeeder {
        backend,
        transform,
        input,
        ctx: ctx.clone(),
        plan: Arc::clone(&plan),
        done: done_tx,
        consumed: consumed_rx,
        announce: announce_tx,
    };
    thread::Builder::new()
        .name(format!("pipeinfer-{}-batcher", ctx.operator))
        .spawn(move || feeder.run())
        .map_err(|e| Error::resource(format!("failed to spawn batch feeder: {e}")))?;

    Ok(Box::new(BatchedResults {
        done: done_rx,
        consumed: consumed_tx,
        announced: announce_rx,
        feeder_done: false,
        known: HashMap::new(),
        pending: BTreeMap::new(),
        abandoned: HashSet::new(),
        current: VecDeque::new(),
        next_batch: 0,
        gauge: ctx.gauge,
        cancel: ctx.cancel,
        timeout,
        plan,
        finished: false,
    }))
}

struct BatchFeeder<T: Item> {
    backend: Arc<dyn BatchBackend<T>>,
    transform: Transform<T>,
    input: ItemStream<T>,
    ctx: ExecContext,
    plan: Arc<BatchPlan>,
    done: Sender<BatchDone<T>>,
    consumed: Receiver<()>,
    announce: Sender<(u64, Announced)>,
}

impl<T: Item> BatchFeeder<T> {
    fn run(mut self) {
        let mut in_flight = 0_usize;
        let mut id = 0_u64;
        let mut start = 0_u64;

        loop {
            if !self.plan.rounds {
                while self.consumed.try_recv().is_ok() {
                    in_flight = in_flight.saturating_sub(1);
                }
            }
            if in_flight >= self.plan.depth {
                let wait = if self.plan.rounds { in_flight } else { 1 };
                for _ in 0..wait {
                    if self.consumed.recv().is_err() {
                        return;
                    }
                    in_flight -= 1;
                }
            }
            if self.ctx.cancel.is_cancelled() {
                return;
            }

            let size = self.plan.next_size();
            let mut items = Vec::with_capacity(size);
            while items.len() < size {
                match self.input.next() {
                    Some(item) => {
                        self.ctx.gauge.enter(1);
                        items.push(item);
                    }
                    None => break,
                }
            }
            if items.is_empty() {
                return;
            }
            let exhausted = items.len() < size;
            let count = items.len();

            let announced = Announced {
                start,
                size: count,
                at: Instant::now(),
            };
            let _ = self.announce.send((id, announced));
            self.ctx.emit(Event::batch_start(&*self.ctx.operator, id, count));
            let job = BatchJob {
                start,
                items,
                ticket: BatchTicket::new(id, count, &self.ctx, self.done.clone()),
            };
            if let Err(err) = self.backend.dispatch(&self.transform, self.ctx.policy, job) {
                tracing::error!(
                    operator = %self.ctx.operator,
                    batch = id,
                    error = %err,
                    "batch dispatch failed"
                );
                return;
            }

            in_flight += 1;
            id += 1;
            start += count as u64;
            if exhausted {
                return;
            }
        }
    }
}

struct BatchedResults<T> {
    done: Receiver<BatchDone<T>>,
    consumed: Sender<()>,
    announced: Receiver<(u64, Announced)>,
    feeder_done: bool,
    known: HashMap<u64, Announced>,
    pending: BTreeMap<u64, BatchDone<T>>,
    abandoned: HashSet<u64>,
    current: VecDeque<Yielded<T>>,
    next_batch: u64,
    gauge: InFlightGauge,
    cancel: CancellationToken,
    timeout: Option<Duration>,
    plan: Arc<BatchPlan>,
    finished: bool,
}

impl<T> BatchedResults<T> {
    fn stop(&mut self, err: Error) -> Option<Result<Yielded<T>>> {
        self.finished = true;
        Some(Err(err))
    }

    /// Record newly dispatched batches; notes when the feeder has returned
    fn drain_announced(&mut self) {
        loop {
            match self.announced.try_recv() {
                Ok((id, announced)) => {
                    self.known.insert(id, announced);
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.feeder_done = true;
                    return;
                }
            }
        }
    }

    /// When the next batch in order runs out of time.
    ///
    /// `None` until that batch has been dispatched.
    fn deadline(&self) -> Option<Instant> {
        let timeout = self.timeout?;
        self.known.get(&self.next_batch).map(|announced| announced.at + timeout)
    }

    fn accept(&mut self, done: BatchDone<T>) {
        if self.abandoned.remove(&done.id) {
            return;
        }
        if let (Some(batcher), Ok(_)) = (&self.plan.batcher, &done.outcomes) {
            let backed_up = self.plan.depth > 1 && self.pending.len() + 1 >= self.plan.depth - 1;
            if let Ok(mut batcher) = batcher.lock() {
                batcher.observe(done.elapsed, done.size, backed_up);
            }
        }
        self.pending.insert(done.id, done);
    }

    /// Replace an overdue batch with per-item timeout failures
    fn expire(&mut self) {
        let Some(announced) = self.known.remove(&self.next_batch) else {
            return;
        };
        let waited = self.timeout.unwrap_or_default();
        tracing::warn!(batch = self.next_batch, ?waited, "batch timed out");
        self.abandoned.insert(self.next_batch);
        self.next_batch += 1;
        let message = format!("no result after {waited:?}");
        self.current = (announced.start..announced.start + announced.size as u64)
            .map(|index| Yielded::Failed(ItemFailure::timed_out(index, message.clone())))
            .collect();
    }
}

impl<T: Item> Iterator for BatchedResults<T> {
    type Item = Result<Yielded<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                return self.stop(Error::Cancelled);
            }
            if let Some(yielded) = self.current.pop_front() {
                self.gauge.leave(1);
                if self.current.is_empty() {
                    let _ = self.consumed.send(());
                }
                return Some(Ok(yielded));
            }
            self.drain_announced();
            if let Some(done) = self.pending.remove(&self.next_batch) {
                self.known.remove(&self.next_batch);
                self.next_batch += 1;
                match done.outcomes {
                    Ok(outcomes) => self.current = outcomes.into(),
                    Err(err) => return self.stop(err),
                }
                continue;
            }

            if self.feeder_done && self.known.is_empty() {
                self.finished = true;
                return None;
            }

            // Once overdue, only results already queued can still save the batch.
            let left = self
                .deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let wait = left.map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL));

            match self.done.recv_timeout(wait) {
                Ok(done) => self.accept(done),
                Err(RecvTimeoutError::Timeout) if left.is_some_and(|left| left.is_zero()) => {
                    self.expire();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}
