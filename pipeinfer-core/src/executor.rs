//! Executor trait and the sequential executor

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::config::{ErrorPolicy, ExecutorKind, ProgressConfig};
use crate::dispatch::EventDispatcher;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::memory::InFlightGauge;
use crate::monitor::SharedMonitor;
use crate::transform::{Item, ItemStream, Transform, Yielded};

/// Lazy executor output, one entry per input item in input order.
///
/// An `Err` is terminal: cancellation, a failed worker pool, or a
/// timeout during shutdown.
pub type YieldStream<T> = Box<dyn Iterator<Item = Result<Yielded<T>>> + Send>;

/// Everything an executor or operator needs besides the data
#[derive(Clone)]
pub struct ExecContext {
    /// Name of the operator being run
    pub operator: Arc<str>,

    /// Policy for failing items
    pub policy: ErrorPolicy,

    /// Where lifecycle, batch and error events go
    pub events: Option<Arc<EventDispatcher>>,

    /// Checked before pulling each input item
    pub cancel: CancellationToken,

    /// Live count of pulled-but-not-yielded items
    pub gauge: InFlightGauge,

    /// Longest wait for an item's result once it was handed to a worker
    pub item_timeout: Option<Duration>,

    /// Monitor that receives the operator's session
    pub monitor: Option<SharedMonitor>,

    /// Progress event throttling
    pub progress: ProgressConfig,
}

impl ExecContext {
    /// A context with no listeners, no monitor and a fresh token
    pub fn new(operator: impl Into<Arc<str>>) -> Self {
        Self {
            operator: operator.into(),
            policy: ErrorPolicy::Abort,
            events: None,
            cancel: CancellationToken::new(),
            gauge: InFlightGauge::new(),
            item_timeout: None,
            monitor: None,
            progress: ProgressConfig::default(),
        }
    }

    /// Builder-style policy override
    pub fn with_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builder-style dispatcher
    pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Builder-style cancellation token
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Builder-style gauge
    pub fn with_gauge(mut self, gauge: InFlightGauge) -> Self {
        self.gauge = gauge;
        self
    }

    /// Builder-style monitor
    pub fn with_monitor(mut self, monitor: SharedMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Send an event if a dispatcher is attached
    pub fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.notify(event);
        }
    }
}

/// Runs a transform over a lazy input with a fixed concurrency policy.
///
/// Executors hold worker resources for their lifetime but no data: every
/// call brings its own transform and input. Outputs come back in input
/// order, and no executor materialises its whole input.
pub trait Executor<T: Item>: Send + Sync {
    /// Concurrency strategy implemented
    fn kind(&self) -> ExecutorKind;

    /// Apply `transform` to every item of `input`
    fn execute(
        &self,
        transform: Transform<T>,
        input: ItemStream<T>,
        ctx: ExecContext,
    ) -> Result<YieldStream<T>>;

    /// Release worker resources; later calls to `execute` fail
    fn shutdown(&self) {}
}

/// Applies the transform item by item on the consuming thread
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialExecutor;

impl SequentialExecutor {
    /// Create a sequential executor
    pub fn new() -> Self {
        Self
    }
}

impl<T: Item> Executor<T> for SequentialExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Sequential
    }

    fn execute(
        &self,
        transform: Transform<T>,
        input: ItemStream<T>,
        ctx: ExecContext,
    ) -> Result<YieldStream<T>> {
        Ok(Box::new(SequentialStream {
            transform,
            input,
            ctx,
            index: 0,
            done: false,
        }))
    }
}

struct SequentialStream<T> {
    transform: Transform<T>,
    input: ItemStream<T>,
    ctx: ExecContext,
    index: u64,
    done: bool,
}

impl<T: Item> Iterator for SequentialStream<T> {
    type Item = Result<Yielded<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.ctx.cancel.is_cancelled() {
            self.done = true;
            return Some(Err(Error::Cancelled));
        }

        let Some(item) = self.input.next() else {
            self.done = true;
            return None;
        };
        self.ctx.gauge.enter(1);
        let yielded = self.transform.run(self.index, &item, &self.ctx.policy);
        self.index += 1;
        self.ctx.gauge.leave(1);
        Some(Ok(yielded))
    }
}

/// Collect the values of a yield stream, stopping at the first error
pub fn collect_values<T>(stream: YieldStream<T>) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for yielded in stream {
        if let Yielded::Value(value) = yielded? {
            values.push(value);
        }
    }
    Ok(values)
}
