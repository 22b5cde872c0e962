//! Pipeline operators
//!
//! A [`PipelineOperator`] wraps a source or a transform together with the
//! executor that runs it, its error policy and its own listeners. Every
//! operator exposes the same contract: a lazy input sequence goes in and
//! a lazy output sequence comes out. Along the way it emits
//! `OperatorStart`, throttled `Progress`, `Error` for each failed item
//! and `OperatorComplete`.
//!
//! Two entry points share that behaviour: [`PipelineOperator::process`]
//! for whole streams, and [`PipelineOperator::begin`] for schedulers
//! that feed the operator in chunks.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{ErrorPolicy, ExecutorKind};
use crate::dispatch::{EventDispatcher, ListenerRegistry, ListenerScope};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::executor::{ExecContext, Executor, SequentialExecutor, YieldStream};
use crate::listener::SharedListener;
use crate::monitor::{MonitorHandle, Session};
use crate::source::{GeneratorSource, Source, SourceStream};
use crate::transform::{Item, ItemFailure, ItemStream, Transform, TransformKind, Yielded};

/// What an operator does with its input
pub enum OperatorKind<T> {
    /// Ignores input and produces from an external origin
    Source(Arc<dyn Source<T>>),
    /// Applies a map, filter or sink function to each input
    Transform(Transform<T>),
}

/// A named pipeline node
pub struct PipelineOperator<T: Item> {
    name: Arc<str>,
    kind: OperatorKind<T>,
    executor: Option<Arc<dyn Executor<T>>>,
    owns_executor: bool,
    policy: ErrorPolicy,
    listeners: Vec<SharedListener>,
    item_timeout: Option<Duration>,
}

impl<T: Item> fmt::Debug for PipelineOperator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineOperator")
            .field("name", &self.name)
            .field("executor", &self.executor_kind())
            .field("policy", &self.policy)
            .field("listeners", &self.listeners.len())
            .finish_non_exhaustive()
    }
}

/// Counters of one finished (or abandoned) operator run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Items consumed
    pub items_in: u64,

    /// Items produced
    pub items_out: u64,

    /// Items that failed for good
    pub items_failed: u64,

    /// Wall time of the run
    pub elapsed: Duration,
}

impl<T: Item> PipelineOperator<T> {
    fn with_kind(name: Arc<str>, kind: OperatorKind<T>) -> Self {
        Self {
            name,
            kind,
            executor: None,
            owns_executor: false,
            policy: ErrorPolicy::Abort,
            listeners: Vec::new(),
            item_timeout: None,
        }
    }

    /// A source driven by a generator closure, called once per run
    pub fn source<G, I>(name: impl Into<Arc<str>>, generator: G) -> Self
    where
        G: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::with_kind(
            name.into(),
            OperatorKind::Source(Arc::new(GeneratorSource::new(generator))),
        )
    }

    /// A source backed by any [`Source`] implementation
    pub fn source_from<S: Source<T> + 'static>(name: impl Into<Arc<str>>, source: S) -> Self {
        Self::with_kind(name.into(), OperatorKind::Source(Arc::new(source)))
    }

    /// A one-to-one transform
    pub fn map<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let name = name.into();
        let transform = Transform::map(Arc::clone(&name), f);
        Self::with_kind(name, OperatorKind::Transform(transform))
    }

    /// A predicate; only passing items are re-emitted, in order
    pub fn filter<P>(name: impl Into<Arc<str>>, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        let transform = Transform::filter(Arc::clone(&name), predicate);
        Self::with_kind(name, OperatorKind::Transform(transform))
    }

    /// A consumer that produces no output
    pub fn sink<F>(name: impl Into<Arc<str>>, f: F) -> Self
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let transform = Transform::sink(Arc::clone(&name), f);
        Self::with_kind(name, OperatorKind::Transform(transform))
    }

    /// Wrap an existing transform; the operator takes its name
    pub fn from_transform(transform: Transform<T>) -> Self {
        Self::with_kind(transform.name_arc(), OperatorKind::Transform(transform))
    }

    /// Bind an executor owned by someone else; it is not shut down on drop
    pub fn with_executor(mut self, executor: Arc<dyn Executor<T>>) -> Self {
        self.executor = Some(executor);
        self.owns_executor = false;
        self
    }

    /// Bind an executor this operator owns and shuts down on drop
    pub fn with_owned_executor(mut self, executor: Arc<dyn Executor<T>>) -> Self {
        self.executor = Some(executor);
        self.owns_executor = true;
        self
    }

    /// Set the error policy
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Attach a listener that only sees this operator's events
    pub fn with_listener(mut self, listener: SharedListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Bound the wait for each in-order result
    pub fn with_item_timeout(mut self, timeout: Duration) -> Self {
        self.item_timeout = Some(timeout);
        self
    }

    /// Operator name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle to the name
    pub fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Whether this operator ignores its input
    pub fn is_source(&self) -> bool {
        matches!(self.kind, OperatorKind::Source(_))
    }

    /// Kind of the wrapped transform, `None` for sources
    pub fn transform_kind(&self) -> Option<TransformKind> {
        match &self.kind {
            OperatorKind::Source(_) => None,
            OperatorKind::Transform(t) => Some(t.kind()),
        }
    }

    /// Error policy
    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Listeners attached to this operator
    pub fn listeners(&self) -> &[SharedListener] {
        &self.listeners
    }

    /// Kind of the bound executor
    pub fn executor_kind(&self) -> ExecutorKind {
        self.executor
            .as_ref()
            .map_or(ExecutorKind::Sequential, |e| e.kind())
    }

    /// Item count of a source, when known
    pub fn size_hint(&self) -> Option<u64> {
        match &self.kind {
            OperatorKind::Source(source) => source.size_hint(),
            OperatorKind::Transform(_) => None,
        }
    }

    fn executor(&self) -> Arc<dyn Executor<T>> {
        match &self.executor {
            Some(executor) => Arc::clone(executor),
            None => Arc::new(SequentialExecutor),
        }
    }

    fn context(&self, ctx: ExecContext) -> ExecContext {
        let mut ctx = ExecContext {
            operator: Arc::clone(&self.name),
            policy: self.policy,
            item_timeout: self.item_timeout.or(ctx.item_timeout),
            ..ctx
        };
        if ctx.events.is_none() && !self.listeners.is_empty() {
            let mut registry = ListenerRegistry::new();
            for listener in &self.listeners {
                registry.register(ListenerScope::All, Arc::clone(listener));
            }
            ctx.events = Some(Arc::new(EventDispatcher::sync(registry)));
        }
        ctx
    }

    /// Process a whole input sequence lazily.
    ///
    /// Sources ignore `input`. The returned stream ends after the first
    /// `Err`, which is either an aborting item failure or a terminal
    /// executor error.
    pub fn process(&self, input: ItemStream<T>, ctx: ExecContext) -> Result<OperatorStream<T>> {
        let tracker = RunTracker::start(self.context(ctx), self.size_hint());
        let inner = match &self.kind {
            OperatorKind::Source(source) => StreamInner::Source(source.open()?),
            OperatorKind::Transform(transform) => StreamInner::Exec(self.executor().execute(
                transform.clone(),
                input,
                tracker.ctx.clone(),
            )?),
        };
        Ok(OperatorStream {
            tracker,
            inner,
            done: false,
        })
    }

    /// Start a run that is fed in chunks
    pub fn begin(&self, ctx: ExecContext) -> Result<OperatorRun<T>> {
        let tracker = RunTracker::start(self.context(ctx), self.size_hint());
        let body = match &self.kind {
            OperatorKind::Source(source) => RunBody::Source(source.open()?),
            OperatorKind::Transform(transform) => RunBody::Transform {
                transform: transform.clone(),
                executor: self.executor(),
            },
        };
        Ok(OperatorRun { tracker, body })
    }
}

impl<T: Item> Drop for PipelineOperator<T> {
    fn drop(&mut self) {
        if self.owns_executor {
            if let Some(executor) = self.executor.take() {
                tracing::debug!(
                    operator = %self.name,
                    kind = %executor.kind(),
                    "releasing executor"
                );
                executor.shutdown();
            }
        }
    }
}

struct RunTracker {
    ctx: ExecContext,
    total_estimate: Option<u64>,
    started: Instant,
    items_in: u64,
    items_out: u64,
    items_failed: u64,
    since_progress: u64,
    last_progress: Instant,
    monitor: Option<(MonitorHandle, Session)>,
    finished: bool,
}

impl RunTracker {
    fn start(ctx: ExecContext, total_estimate: Option<u64>) -> Self {
        ctx.emit(Event::operator_start(ctx.operator.as_ref()));
        let monitor = ctx.monitor.as_ref().map(|monitor| {
            let handle = monitor.acquire();
            let session = handle.start_session(Arc::clone(&ctx.operator));
            (handle, session)
        });
        tracing::debug!(operator = %ctx.operator, "operator started");
        let now = Instant::now();
        Self {
            ctx,
            total_estimate,
            started: now,
            items_in: 0,
            items_out: 0,
            items_failed: 0,
            since_progress: 0,
            last_progress: now,
            monitor,
            finished: false,
        }
    }

    fn record<T>(&mut self, yielded: Yielded<T>, index_base: u64) -> Result<Option<T>> {
        self.items_in += 1;
        let out = match yielded {
            Yielded::Value(value) => {
                self.items_out += 1;
                Some(value)
            }
            Yielded::Dropped => None,
            Yielded::Failed(mut failure) => {
                failure.index += index_base;
                self.fail_item(&failure)?;
                None
            }
        };
        if let Some((_, session)) = &self.monitor {
            session.record(1);
        }
        self.progress();
        Ok(out)
    }

    fn fail_item(&mut self, failure: &ItemFailure) -> Result<()> {
        self.items_failed += 1;
        self.ctx.emit(Event::item_error(self.ctx.operator.as_ref(), failure));
        if self.ctx.policy.skips_failures() {
            tracing::warn!(
                operator = %self.ctx.operator,
                index = failure.index,
                error = %failure.message,
                "skipping failed item"
            );
            Ok(())
        } else {
            tracing::error!(
                operator = %self.ctx.operator,
                index = failure.index,
                error = %failure.message,
                "aborting operator"
            );
            Err(Error::ItemProcessing {
                operator: self.ctx.operator.to_string(),
                index: failure.index,
                message: failure.message.clone(),
                attempts: failure.attempts,
            })
        }
    }

    fn progress(&mut self) {
        self.since_progress += 1;
        let progress = &self.ctx.progress;
        let due = self.since_progress >= progress.every_items.max(1)
            || self.last_progress.elapsed() >= progress.every();
        if due {
            self.ctx.emit(Event::progress(
                self.ctx.operator.as_ref(),
                self.items_in,
                self.total_estimate,
            ));
            self.since_progress = 0;
            self.last_progress = Instant::now();
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            items_in: self.items_in,
            items_out: self.items_out,
            items_failed: self.items_failed,
            elapsed: self.started.elapsed(),
        }
    }

    fn finish(&mut self, completed: bool) -> RunSummary {
        let summary = self.summary();
        if self.finished {
            return summary;
        }
        self.finished = true;

        if completed {
            self.ctx.emit(Event::operator_complete(
                self.ctx.operator.as_ref(),
                summary.elapsed,
                summary.items_in,
                summary.items_out,
            ));
        }
        if let Some((handle, session)) = self.monitor.take() {
            self.ctx.emit(handle.end_session(session));
        }
        tracing::debug!(
            operator = %self.ctx.operator,
            completed,
            items_in = summary.items_in,
            items_out = summary.items_out,
            "operator finished"
        );
        summary
    }
}

impl Drop for RunTracker {
    fn drop(&mut self) {
        self.finish(false);
    }
}

enum StreamInner<T> {
    Source(SourceStream<T>),
    Exec(YieldStream<T>),
}

/// Lazy output of [`PipelineOperator::process`]
pub struct OperatorStream<T> {
    tracker: RunTracker,
    inner: StreamInner<T>,
    done: bool,
}

impl<T> OperatorStream<T> {
    /// Expected number of input items, used in progress events
    pub fn set_total_estimate(&mut self, total: Option<u64>) {
        if total.is_some() {
            self.tracker.total_estimate = total;
        }
    }

    /// Counters so far
    pub fn summary(&self) -> RunSummary {
        self.tracker.summary()
    }
}

impl<T: Item> Iterator for OperatorStream<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let next = match &mut self.inner {
                StreamInner::Exec(stream) => stream.next(),
                StreamInner::Source(stream) => {
                    if self.tracker.ctx.cancel.is_cancelled() {
                        Some(Err(Error::Cancelled))
                    } else {
                        let index = self.tracker.items_in;
                        stream.next().map(|r| Ok(source_outcome(r, index)))
                    }
                }
            };

            match next {
                None => {
                    self.done = true;
                    self.tracker.finish(true);
                }
                Some(Err(err)) => {
                    self.done = true;
                    self.tracker.finish(false);
                    return Some(Err(err));
                }
                Some(Ok(yielded)) => match self.tracker.record(yielded, 0) {
                    Ok(Some(value)) => return Some(Ok(value)),
                    Ok(None) => {}
                    Err(err) => {
                        self.done = true;
                        self.tracker.finish(false);
                        return Some(Err(err));
                    }
                },
            }
        }
        None
    }
}

fn source_outcome<T: Item>(result: Result<T>, index: u64) -> Yielded<T> {
    match result {
        Ok(item) => Yielded::Value(item),
        Err(err) => Yielded::Failed(ItemFailure {
            index,
            message: err.to_string(),
            attempts: 1,
            context: String::from("<source>"),
            timed_out: false,
        }),
    }
}

enum RunBody<T> {
    Source(SourceStream<T>),
    Transform {
        transform: Transform<T>,
        executor: Arc<dyn Executor<T>>,
    },
}

/// A chunk-fed operator run, used by DAG schedulers
pub struct OperatorRun<T> {
    tracker: RunTracker,
    body: RunBody<T>,
}

impl<T: Item> OperatorRun<T> {
    /// Name of the operator
    pub fn operator(&self) -> &str {
        &self.tracker.ctx.operator
    }

    /// Whether this run produces from a source
    pub fn is_source(&self) -> bool {
        matches!(self.body, RunBody::Source(_))
    }

    /// Pull up to `max` items from a source; `None` once exhausted
    pub fn pull_source(&mut self, max: usize) -> Result<Option<Vec<T>>> {
        let RunBody::Source(stream) = &mut self.body else {
            return Err(Error::setup(format!(
                "operator `{}` is not a source",
                self.tracker.ctx.operator
            )));
        };

        let mut out = Vec::with_capacity(max);
        let mut exhausted = false;
        while out.len() < max.max(1) {
            if self.tracker.ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some(result) = stream.next() else {
                exhausted = true;
                break;
            };
            let yielded = source_outcome(result, self.tracker.items_in);
            if let Some(value) = self.tracker.record(yielded, 0)? {
                out.push(value);
            }
        }

        if exhausted && out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    /// Run one chunk of input through the transform
    pub fn process_chunk(&mut self, chunk: Vec<T>) -> Result<Vec<T>> {
        let RunBody::Transform { transform, executor } = &self.body else {
            return Err(Error::setup(format!(
                "operator `{}` is a source and takes no input",
                self.tracker.ctx.operator
            )));
        };

        let base = self.tracker.items_in;
        let mut out = Vec::with_capacity(chunk.len());
        let stream = executor.execute(
            transform.clone(),
            Box::new(chunk.into_iter()),
            self.tracker.ctx.clone(),
        )?;
        for yielded in stream {
            if let Some(value) = self.tracker.record(yielded?, base)? {
                out.push(value);
            }
        }
        Ok(out)
    }

    /// Counters so far
    pub fn summary(&self) -> RunSummary {
        self.tracker.summary()
    }

    /// Complete the run, emitting `OperatorComplete`
    pub fn finish(mut self) -> RunSummary {
        self.tracker.finish(true)
    }

    /// Abandon the run without a completion event
    pub fn abandon(mut self) -> RunSummary {
        self.tracker.finish(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressConfig;
    use crate::event::EventKind;
    use crate::listener::{shared, CollectingListener};
    use crate::monitor::SharedMonitor;

    fn ctx(name: &str) -> ExecContext {
        ExecContext::new(name)
    }

    #[test]
    fn test_map_operator_emits_lifecycle() {
        let collector = CollectingListener::new();
        let op = PipelineOperator::map("double", |x: &i64| Ok(x * 2))
            .with_listener(shared(collector.clone()));

        let out: Vec<i64> = op
            .process(Box::new(vec![1, 2, 3].into_iter()), ctx("double"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(out, vec![2, 4, 6]);
        let events = collector.events();
        let kinds: Vec<&str> = events.iter().map(Event::kind_name).collect();
        assert_eq!(kinds.first(), Some(&"operator_start"));
        assert_eq!(kinds.last(), Some(&"operator_complete"));
    }

    #[test]
    fn test_filter_preserves_order() {
        let op = PipelineOperator::filter("even", |x: &i64| x % 2 == 0);
        let out: Vec<i64> = op
            .process(Box::new((1..=10).collect::<Vec<_>>().into_iter()), ctx("even"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(out, vec![2, 4, 6, 8, 10]);
    }

    #[test]
    fn test_skip_policy_drops_failing_item() {
        let collector = CollectingListener::new();
        let op = PipelineOperator::map("fragile", |x: &i64| {
            if *x == 5 {
                anyhow::bail!("cannot handle 5");
            }
            Ok(*x)
        })
        .with_error_policy(ErrorPolicy::Skip)
        .with_listener(shared(collector.clone()));

        let out: Vec<i64> = op
            .process(Box::new((0..10).collect::<Vec<i64>>().into_iter()), ctx("fragile"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(out, vec![0, 1, 2, 3, 4, 6, 7, 8, 9]);
        let errors = collector.of_kind("error");
        assert_eq!(errors.len(), 1);
        match &errors[0].kind {
            EventKind::Error { item_context, .. } => {
                assert_eq!(item_context.index, 5);
                assert_eq!(item_context.item, "5");
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_abort_policy_stops_stream() {
        let op = PipelineOperator::map("fragile", |x: &i64| {
            if *x == 2 {
                anyhow::bail!("bad");
            }
            Ok(*x)
        });
        let results: Vec<Result<i64>> = op
            .process(Box::new((0..10).collect::<Vec<i64>>().into_iter()), ctx("fragile"))
            .unwrap()
            .collect();

        assert_eq!(results.len(), 3);
        assert!(matches!(results[2], Err(Error::ItemProcessing { index: 2, .. })));
    }

    #[test]
    fn test_source_ignores_input() {
        let op = PipelineOperator::source("numbers", || vec![7_i64, 8, 9]);
        assert!(op.is_source());
        let out: Vec<i64> = op
            .process(Box::new(vec![1, 2].into_iter()), ctx("numbers"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(out, vec![7, 8, 9]);
    }

    #[test]
    fn test_progress_is_throttled() {
        let collector = CollectingListener::new();
        let op = PipelineOperator::map("inc", |x: &i64| Ok(x + 1))
            .with_listener(shared(collector.clone()));
        let mut context = ctx("inc");
        context.progress = ProgressConfig {
            every_items: 100,
            every_ms: 60_000,
        };

        let count = op
            .process(Box::new((0..1_000).collect::<Vec<i64>>().into_iter()), context)
            .unwrap()
            .count();
        assert_eq!(count, 1_000);
        assert_eq!(collector.of_kind("progress").len(), 10);
    }

    #[test]
    fn test_chunked_run_offsets_indices() {
        let collector = CollectingListener::new();
        let op = PipelineOperator::map("fragile", |x: &i64| {
            if *x == 13 {
                anyhow::bail!("unlucky");
            }
            Ok(*x)
        })
        .with_error_policy(ErrorPolicy::Skip)
        .with_listener(shared(collector.clone()));

        let mut run = op.begin(ctx("fragile")).unwrap();
        assert_eq!(run.process_chunk((0..10).collect()).unwrap().len(), 10);
        assert_eq!(run.process_chunk((10..20).collect()).unwrap().len(), 9);
        let summary = run.finish();

        assert_eq!(summary.items_in, 20);
        assert_eq!(summary.items_out, 19);
        assert_eq!(summary.items_failed, 1);
        match &collector.of_kind("error")[0].kind {
            EventKind::Error { item_context, .. } => assert_eq!(item_context.index, 13),
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(collector.of_kind("operator_complete").len(), 1);
    }

    #[test]
    fn test_source_run_pulls_in_chunks() {
        let op = PipelineOperator::source("numbers", || 0..5_i64);
        let mut run = op.begin(ctx("numbers")).unwrap();
        assert_eq!(run.pull_source(2).unwrap(), Some(vec![0, 1]));
        assert_eq!(run.pull_source(2).unwrap(), Some(vec![2, 3]));
        assert_eq!(run.pull_source(2).unwrap(), Some(vec![4]));
        assert_eq!(run.pull_source(2).unwrap(), None);
    }

    #[test]
    fn test_monitor_session_emits_performance() {
        let collector = CollectingListener::new();
        let monitor = SharedMonitor::new(Duration::from_millis(10));
        let op = PipelineOperator::map("inc", |x: &i64| Ok(x + 1))
            .with_listener(shared(collector.clone()));

        let count = op
            .process(
                Box::new((0..50).collect::<Vec<i64>>().into_iter()),
                ctx("inc").with_monitor(monitor.clone()),
            )
            .unwrap()
            .count();

        assert_eq!(count, 50);
        assert_eq!(collector.of_kind("performance").len(), 1);
        assert!(!monitor.is_running());
        assert_eq!(monitor.stats().total_sessions, 1);
    }
}
