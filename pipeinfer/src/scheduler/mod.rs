//! Strategies for walking a pipeline graph
//!
//! Stage-sequential execution runs nodes one after another in topological
//! order. Pipelined execution runs every node at once, connected by
//! bounded edges, either as tokio tasks or as one OS thread per node. All
//! three report the same per-node outcomes.

mod asynchronous;
mod inbox;
mod stage;
mod threaded;

use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeinfer_core::{
    CancellationToken, Error, EventDispatcher, ExecContext, ExecutionMode, Item, NodeOutput,
    NodeStatus, OperatorRun, PipelineConfig, PipelineOperator, Result, RunSummary, SchedulerBackend,
    SharedMonitor,
};

use crate::dag::Dag;

pub(crate) use inbox::Inbox;

/// How long a blocked node sleeps before rechecking cancellation
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Bound on one suspension point, checked in [`POLL_INTERVAL`] slices
pub(crate) struct Deadline {
    started: Instant,
    limit: Option<Duration>,
}

impl Deadline {
    pub(crate) fn new(limit: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    /// How long to wait next, or why waiting must stop
    pub(crate) fn next_slice(&self, point: &str, cancel: &CancellationToken) -> Result<Duration> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        match self.limit {
            Some(limit) => {
                let left = limit.saturating_sub(self.started.elapsed());
                if left.is_zero() {
                    return Err(Error::timeout(point, limit));
                }
                Ok(left.min(POLL_INTERVAL))
            }
            None => Ok(POLL_INTERVAL),
        }
    }
}

/// Everything a scheduler needs to know about one execution
pub(crate) struct Plan<'a, T: Item> {
    pub(crate) dag: &'a Dag,
    pub(crate) operators: &'a [PipelineOperator<T>],
    pub(crate) order: Vec<usize>,
    pub(crate) initial: Option<Vec<T>>,
}

impl<T: Item> Plan<'_, T> {
    /// Input of a root transform
    pub(crate) fn initial_input(&self) -> Vec<T> {
        self.initial.clone().unwrap_or_default()
    }
}

/// Shared, per-execution environment handed to every node
pub(crate) struct RunEnv {
    pub(crate) events: Arc<EventDispatcher>,
    pub(crate) cancel: CancellationToken,
    pub(crate) monitor: Option<SharedMonitor>,
    pub(crate) config: PipelineConfig,
    pub(crate) started: Instant,
}

impl RunEnv {
    pub(crate) fn context<T: Item>(&self, op: &PipelineOperator<T>) -> ExecContext {
        let mut ctx = ExecContext::new(op.name_arc())
            .with_events(Arc::clone(&self.events))
            .with_cancel(self.cancel.clone());
        if let Some(monitor) = &self.monitor {
            ctx = ctx.with_monitor(monitor.clone());
        }
        ctx.progress = self.config.progress.clone();
        ctx
    }

    /// Whether a node's output is reported as items rather than a count
    pub(crate) fn retains(&self, dag: &Dag, node: usize) -> bool {
        self.config.retain_outputs || dag.downstream(node).is_empty()
    }
}

/// What one node ended with
pub(crate) struct NodeOutcome<T> {
    pub(crate) status: NodeStatus,
    pub(crate) output: NodeOutput<T>,
    pub(crate) summary: RunSummary,
    pub(crate) started_after: Duration,
    pub(crate) error: Option<Error>,
}

impl<T> NodeOutcome<T> {
    /// A node that never got to run
    pub(crate) fn unstarted(error: Error, started_after: Duration) -> Self {
        Self {
            status: status_of(&error),
            output: NodeOutput::Count(0),
            summary: RunSummary::default(),
            started_after,
            error: Some(error),
        }
    }
}

/// Node status implied by the error that stopped it
pub(crate) fn status_of(err: &Error) -> NodeStatus {
    match err {
        Error::Cancelled => NodeStatus::Cancelled,
        Error::UpstreamFailed(_) => NodeStatus::SkippedUpstreamFailure,
        _ => NodeStatus::Failed,
    }
}

/// Items a node produced, or just their number
pub(crate) struct Collected<T> {
    retain: bool,
    items: Vec<T>,
    count: u64,
}

impl<T: Clone> Collected<T> {
    pub(crate) fn new(retain: bool) -> Self {
        Self {
            retain,
            items: Vec::new(),
            count: 0,
        }
    }

    pub(crate) fn record(&mut self, items: &[T]) {
        self.count += items.len() as u64;
        if self.retain {
            self.items.extend_from_slice(items);
        }
    }

    pub(crate) fn into_output(self) -> NodeOutput<T> {
        if self.retain {
            NodeOutput::Items(self.items)
        } else {
            NodeOutput::Count(self.count)
        }
    }
}

/// One message on a pipelined edge
#[derive(Debug, Clone)]
pub(crate) enum EdgeMessage<T> {
    Item(T),
    /// The named upstream stopped on an error; nothing follows
    Failed(String),
}

/// Close a chunk-fed run and build the node's outcome
pub(crate) fn settle<T: Item>(
    run: OperatorRun<T>,
    result: Result<()>,
    collected: Collected<T>,
    started_after: Duration,
    cancel: &CancellationToken,
) -> NodeOutcome<T> {
    let result = match result {
        Ok(()) if cancel.is_cancelled() => Err(Error::Cancelled),
        other => other,
    };
    let (status, summary, error) = match result {
        Ok(()) => (NodeStatus::Completed, run.finish(), None),
        Err(err) => {
            tracing::debug!(operator = %run.operator(), error = %err, "node stopped");
            (status_of(&err), run.abandon(), Some(err))
        }
    };
    NodeOutcome {
        status,
        output: collected.into_output(),
        summary,
        started_after,
        error,
    }
}

/// Run the plan with the strategy the configuration selects.
///
/// Outcomes are indexed by node id.
pub(crate) fn run<T: Item>(plan: Plan<'_, T>, env: &RunEnv) -> Result<Vec<NodeOutcome<T>>> {
    match (env.config.mode, env.config.scheduler) {
        (ExecutionMode::StageSequential, _) => Ok(stage::run(plan, env)),
        (ExecutionMode::Pipelined, SchedulerBackend::Threaded) => threaded::run(plan, env),
        (ExecutionMode::Pipelined, SchedulerBackend::Async) => asynchronous::run(plan, env),
    }
}
