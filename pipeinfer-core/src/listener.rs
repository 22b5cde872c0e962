//! Event listeners and a few built-in implementations

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::event::{Event, EventKind};

/// Consumes events one at a time.
///
/// Implementations need not be thread-safe: the dispatcher serialises
/// calls to each listener. Returned errors are reported and counted but
/// never affect the data path.
pub trait EventListener: Send {
    /// Handle a single event
    fn on_event(&mut self, event: &Event) -> anyhow::Result<()>;
}

impl<F> EventListener for F
where
    F: FnMut(&Event) + Send,
{
    fn on_event(&mut self, event: &Event) -> anyhow::Result<()> {
        self(event);
        Ok(())
    }
}

/// A listener shared between registries
pub type SharedListener = Arc<Mutex<dyn EventListener>>;

/// Wrap a listener for registration
pub fn shared<L: EventListener + 'static>(listener: L) -> SharedListener {
    Arc::new(Mutex::new(listener))
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Records every event it sees; clones share the same record
#[derive(Debug, Clone, Default)]
pub struct CollectingListener {
    events: Arc<Mutex<Vec<Event>>>,
}

impl CollectingListener {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all events seen so far
    pub fn events(&self) -> Vec<Event> {
        lock(&self.events).clone()
    }

    /// Number of events seen so far
    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    /// Whether no events were seen
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events whose kind name matches `kind`
    pub fn of_kind(&self, kind: &str) -> Vec<Event> {
        lock(&self.events)
            .iter()
            .filter(|e| e.kind_name() == kind)
            .cloned()
            .collect()
    }

    /// Forget every recorded event
    pub fn clear(&self) {
        lock(&self.events).clear();
    }
}

impl EventListener for CollectingListener {
    fn on_event(&mut self, event: &Event) -> anyhow::Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_event(&mut self, event: &Event) -> anyhow::Result<()> {
        let operator = event.operator.as_str();
        match &event.kind {
            EventKind::OperatorStart => tracing::info!(operator, "operator started"),
            EventKind::OperatorComplete {
                duration,
                items_in,
                items_out,
            } => tracing::info!(operator, ?duration, items_in, items_out, "operator complete"),
            EventKind::Progress {
                processed,
                total_estimate,
            } => tracing::info!(operator, processed, ?total_estimate, "progress"),
            EventKind::Error { error, item_context } => tracing::warn!(
                operator,
                index = item_context.index,
                item = %item_context.item,
                error = %error,
                "item failed"
            ),
            EventKind::Performance {
                cpu_percent,
                memory_bytes,
                throughput,
                ..
            } => tracing::info!(operator, cpu_percent, memory_bytes, throughput, "performance"),
            EventKind::BatchStart { batch, size } => {
                tracing::debug!(operator, batch, size, "batch started");
            }
            EventKind::BatchComplete {
                batch,
                size,
                duration,
            } => tracing::debug!(operator, batch, size, ?duration, "batch complete"),
        }
        Ok(())
    }
}

/// Aggregated performance of one operator across runs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorStats {
    /// Completed runs
    pub runs: u64,

    /// Items processed over all runs
    pub total_items: u64,

    /// Time spent over all runs
    pub total_time: Duration,

    /// Mean of reported throughputs
    pub avg_throughput: f64,

    /// Mean of reported resident memory
    pub avg_memory_bytes: f64,

    /// Mean of reported CPU usage
    pub avg_cpu_percent: f64,

    /// `Performance` events folded into the means
    pub samples: u64,
}

#[derive(Debug, Default)]
struct Samples {
    runs: u64,
    total_items: u64,
    total_time: Duration,
    count: u64,
    throughput: f64,
    memory: f64,
    cpu: f64,
}

impl Samples {
    fn record(&mut self, throughput: f64, memory: f64, cpu: f64) {
        self.count += 1;
        self.throughput += throughput;
        self.memory += memory;
        self.cpu += cpu;
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            sum / self.count as f64
        }
    }
}

/// Aggregates `Performance` and `OperatorComplete` events per operator.
///
/// Only running sums are kept, so memory stays constant however long the
/// listener stays attached.
#[derive(Debug, Clone, Default)]
pub struct PerformanceListener {
    samples: Arc<Mutex<HashMap<String, Samples>>>,
}

impl PerformanceListener {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics for `operator`, if it reported anything
    pub fn stats(&self, operator: &str) -> Option<OperatorStats> {
        let samples = lock(&self.samples);
        samples.get(operator).map(|s| OperatorStats {
            runs: s.runs,
            total_items: s.total_items,
            total_time: s.total_time,
            avg_throughput: s.mean(s.throughput),
            avg_memory_bytes: s.mean(s.memory),
            avg_cpu_percent: s.mean(s.cpu),
            samples: s.count,
        })
    }

    /// Operators that reported at least once
    pub fn operators(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.samples).keys().cloned().collect();
        names.sort();
        names
    }
}

impl EventListener for PerformanceListener {
    fn on_event(&mut self, event: &Event) -> anyhow::Result<()> {
        match &event.kind {
            EventKind::Performance {
                cpu_percent,
                memory_bytes,
                throughput,
                ..
            } => {
                let mut samples = lock(&self.samples);
                let entry = samples.entry(event.operator.clone()).or_default();
                entry.record(*throughput, *memory_bytes as f64, f64::from(*cpu_percent));
            }
            EventKind::OperatorComplete {
                duration, items_in, ..
            } => {
                let mut samples = lock(&self.samples);
                let entry = samples.entry(event.operator.clone()).or_default();
                entry.runs += 1;
                entry.total_items += items_in;
                entry.total_time += *duration;
            }
            _ => {}
        }
        Ok(())
    }
}
