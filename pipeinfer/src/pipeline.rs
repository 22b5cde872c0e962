//! Pipeline construction and execution

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use pipeinfer_core::{
    CancellationToken, Error, EventDispatcher, ExecutorKind, Item, ListenerRegistry, ListenerScope,
    NodeReport, NodeTiming, PipelineConfig, PipelineOperator, PipelineReport, Result,
    SharedListener, SharedMonitor, Source,
};
use uuid::Uuid;

use crate::dag::Dag;
use crate::ops;
use crate::scheduler::{self, Plan, RunEnv};

/// A named DAG of operators with global listeners.
///
/// Construction is fluent: each call adds operators after the current
/// *frontier*, the nodes the next operator will be attached to.
///
/// ```
/// use pipeinfer::{ExecutorKind, Pipeline};
///
/// # fn main() -> pipeinfer::Result<()> {
/// let report = Pipeline::new("double")
///     .source("numbers", || 1..=5_i64)?
///     .map("double", |x: &i64| Ok(x * 2), 1, ExecutorKind::Sequential)?
///     .execute(None)?;
/// assert_eq!(report.output("double"), Some(&[2, 4, 6, 8, 10][..]));
/// # Ok(())
/// # }
/// ```
///
/// The graph is checked on every edge, so a cycle is rejected while the
/// pipeline is being built. Operators are immutable once added, and a
/// pipeline can be executed any number of times.
pub struct Pipeline<T: Item> {
    name: String,
    dag: Dag,
    operators: Vec<PipelineOperator<T>>,
    frontier: Vec<usize>,
    listeners: Vec<SharedListener>,
    config: PipelineConfig,
    monitor: Option<SharedMonitor>,
    cancel: CancellationToken,
}

impl<T: Item> std::fmt::Debug for Pipeline<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("operators", &self.operators)
            .field("config", &self.config)
            .finish()
    }
}

impl<T: Item> Pipeline<T> {
    /// Empty pipeline with default configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dag: Dag::new(),
            operators: Vec::new(),
            frontier: Vec::new(),
            listeners: Vec::new(),
            config: PipelineConfig::default(),
            monitor: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the configuration
    pub fn with_config(mut self, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Use this monitor instead of the process-wide one
    pub fn with_monitor(mut self, monitor: SharedMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Attach a listener that sees every operator's events
    pub fn add_listener(mut self, listener: SharedListener) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Add a source; it becomes the new frontier
    pub fn source<G, I>(self, name: &str, generator: G) -> Result<Self>
    where
        G: Fn() -> I + Send + Sync + 'static,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.start(PipelineOperator::source(name, generator))
    }

    /// Add a source backed by any [`Source`] implementation
    pub fn source_from<S: Source<T> + 'static>(self, name: &str, source: S) -> Result<Self> {
        self.start(PipelineOperator::source_from(name, source))
    }

    /// Add a map with an executor of `executor_kind` and `parallel_degree` workers
    pub fn map<F>(
        self,
        name: &str,
        f: F,
        parallel_degree: usize,
        executor_kind: ExecutorKind,
    ) -> Result<Self>
    where
        F: Fn(&T) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.then(ops::map(name, f, parallel_degree, executor_kind)?)
    }

    /// Add a filter with an executor of `executor_kind` and `parallel_degree` workers
    pub fn filter<P>(
        self,
        name: &str,
        predicate: P,
        parallel_degree: usize,
        executor_kind: ExecutorKind,
    ) -> Result<Self>
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.then(ops::filter(name, predicate, parallel_degree, executor_kind)?)
    }

    /// Add a sink with an executor of `executor_kind` and `parallel_degree` workers
    pub fn sink<F>(
        self,
        name: &str,
        f: F,
        parallel_degree: usize,
        executor_kind: ExecutorKind,
    ) -> Result<Self>
    where
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.then(ops::sink(name, f, parallel_degree, executor_kind)?)
    }

    /// Append an operator after every frontier node.
    ///
    /// On an empty frontier the operator becomes a root fed by the initial
    /// input. A source always starts a new frontier of its own.
    pub fn then(mut self, operator: PipelineOperator<T>) -> Result<Self> {
        if operator.is_source() {
            return self.start(operator);
        }
        let frontier = std::mem::take(&mut self.frontier);
        let id = self.add(operator)?;
        for from in frontier {
            self.dag.add_edge(from, id)?;
        }
        self.frontier = vec![id];
        Ok(self)
    }

    /// Fan the frontier out to several operators; they become the frontier
    pub fn branch(mut self, operators: Vec<PipelineOperator<T>>) -> Result<Self> {
        if self.frontier.is_empty() {
            return Err(Error::setup("branch needs an upstream operator"));
        }
        if operators.is_empty() {
            return Err(Error::setup("branch needs at least one operator"));
        }
        let frontier = std::mem::take(&mut self.frontier);
        let mut heads = Vec::with_capacity(operators.len());
        for operator in operators {
            let id = self.add(operator)?;
            for &from in &frontier {
                self.connect_ids(from, id)?;
            }
            heads.push(id);
        }
        self.frontier = heads;
        Ok(self)
    }

    /// Merge every frontier node into one operator
    pub fn join(self, operator: PipelineOperator<T>) -> Result<Self> {
        if self.frontier.is_empty() {
            return Err(Error::setup(format!(
                "join into `{}` needs at least one upstream operator",
                operator.name()
            )));
        }
        self.then(operator)
    }

    /// Merge every frontier node into an operator that is already present
    pub fn join_into(mut self, name: &str) -> Result<Self> {
        let to = self.node(name)?;
        if self.frontier.is_empty() {
            return Err(Error::setup(format!(
                "join into `{name}` needs at least one upstream operator"
            )));
        }
        for from in std::mem::take(&mut self.frontier) {
            self.connect_ids(from, to)?;
        }
        self.frontier = vec![to];
        Ok(self)
    }

    /// Add the edge `from -> to` between existing operators
    pub fn connect(mut self, from: &str, to: &str) -> Result<Self> {
        let (from, to) = (self.node(from)?, self.node(to)?);
        self.connect_ids(from, to)?;
        Ok(self)
    }

    /// Continue building after an existing operator
    pub fn after(mut self, name: &str) -> Result<Self> {
        self.frontier = vec![self.node(name)?];
        Ok(self)
    }

    fn start(mut self, operator: PipelineOperator<T>) -> Result<Self> {
        let id = self.add(operator)?;
        self.frontier = vec![id];
        Ok(self)
    }

    fn add(&mut self, operator: PipelineOperator<T>) -> Result<usize> {
        let id = self.dag.add_node(operator.name())?;
        tracing::debug!(
            pipeline = %self.name,
            operator = operator.name(),
            executor = %operator.executor_kind(),
            "operator added"
        );
        self.operators.push(operator);
        Ok(id)
    }

    fn connect_ids(&mut self, from: usize, to: usize) -> Result<()> {
        if self.operators[to].is_source() {
            return Err(Error::setup(format!(
                "source `{}` cannot have upstream operators",
                self.operators[to].name()
            )));
        }
        self.dag.add_edge(from, to)
    }

    fn node(&self, name: &str) -> Result<usize> {
        self.dag
            .id(name)
            .ok_or_else(|| {
                Error::setup(format!("pipeline `{}` has no operator `{name}`", self.name))
            })
    }

    /// Pipeline name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in use
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Number of operators
    pub fn len(&self) -> usize {
        self.operators.len()
    }

    /// Whether no operator was added
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    /// Operator by name
    pub fn operator(&self, name: &str) -> Option<&PipelineOperator<T>> {
        self.dag.id(name).map(|id| &self.operators[id])
    }

    /// The underlying graph
    pub fn dag(&self) -> &Dag {
        &self.dag
    }

    /// Token that stops a running execution when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline once.
    ///
    /// `initial` feeds every root that is not a source. Setup errors and
    /// timeouts while shutting down are returned as `Err`. Any other
    /// failure, a dead executor included, is recorded in the failing
    /// node's report while the rest of the graph carries on.
    pub fn execute(&self, initial: Option<Vec<T>>) -> Result<PipelineReport<T>> {
        if self.operators.is_empty() {
            return Err(Error::setup(format!("pipeline `{}` has no operators", self.name)));
        }
        self.config.validate()?;
        let order = self.dag.topological_order()?;
        if initial.is_none() {
            let unfed = self
                .dag
                .roots()
                .into_iter()
                .find(|&id| !self.operators[id].is_source());
            if let Some(root) = unfed {
                return Err(Error::setup(format!(
                    "operator `{}` has no upstream and no initial input was given",
                    self.dag.name(root)
                )));
            }
        }

        let mut registry = ListenerRegistry::new();
        for listener in &self.listeners {
            registry.register(ListenerScope::All, Arc::clone(listener));
        }
        for operator in &self.operators {
            for listener in operator.listeners() {
                registry.register(
                    ListenerScope::Operator(operator.name().to_string()),
                    Arc::clone(listener),
                );
            }
        }
        let events = Arc::new(EventDispatcher::new(&self.config.events, registry)?);

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("pipeline", pipeline = %self.name, %run_id);
        let _enter = span.enter();
        tracing::info!(
            mode = ?self.config.mode,
            nodes = self.operators.len(),
            "executing pipeline"
        );

        let env = RunEnv {
            events: Arc::clone(&events),
            cancel: self.cancel.clone(),
            monitor: self
                .monitor
                .clone()
                .or_else(|| self.config.monitoring.then(SharedMonitor::shared)),
            config: self.config.clone(),
            started: Instant::now(),
        };
        let plan = Plan {
            dag: &self.dag,
            operators: &self.operators,
            order: order.clone(),
            initial,
        };
        let outcomes = scheduler::run(plan, &env);
        let shutdown = events.shutdown(self.config.events.shutdown_timeout());
        let mut outcomes = outcomes?;
        shutdown?;

        for &node in &order {
            if outcomes[node].error.as_ref().is_some_and(Error::is_fatal) {
                if let Some(err) = outcomes[node].error.take() {
                    tracing::error!(
                        operator = self.dag.name(node),
                        error = %err,
                        "pipeline failed"
                    );
                    return Err(err);
                }
            }
        }

        let mut nodes = BTreeMap::new();
        for (node, outcome) in outcomes.into_iter().enumerate() {
            let name = self.dag.name(node).to_string();
            let report = NodeReport {
                name: name.clone(),
                status: outcome.status,
                output: outcome.output,
                timing: NodeTiming {
                    started_after: outcome.started_after,
                    elapsed: outcome.summary.elapsed,
                    items_in: outcome.summary.items_in,
                    items_out: outcome.summary.items_out,
                    items_failed: outcome.summary.items_failed,
                },
                error: outcome.error.map(|err| err.to_string()),
            };
            nodes.insert(name, report);
        }
        let report = PipelineReport {
            pipeline: self.name.clone(),
            run_id,
            mode: self.config.mode,
            nodes,
            elapsed: env.started.elapsed(),
            events: events.stats(),
        };
        if report.is_success() {
            tracing::info!(elapsed = ?report.elapsed, "pipeline completed");
        } else {
            tracing::warn!(
                unsuccessful = ?report.unsuccessful(),
                "pipeline finished with failures"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbers() -> Pipeline<i64> {
        Pipeline::new("numbers").source("numbers", || 1..=5_i64).unwrap()
    }

    #[test]
    fn test_then_chains_operators() {
        let pipeline = numbers()
            .map("double", |x: &i64| Ok(x * 2), 1, ExecutorKind::Sequential)
            .unwrap()
            .filter("big", |x: &i64| *x > 4, 1, ExecutorKind::Sequential)
            .unwrap();
        assert_eq!(pipeline.len(), 3);
        let dag = pipeline.dag();
        assert_eq!(dag.upstream(2), &[1]);
        assert_eq!(dag.upstream(1), &[0]);
    }

    #[test]
    fn test_branch_and_join_shape() {
        let pipeline = numbers()
            .branch(vec![
                PipelineOperator::map("left", |x: &i64| Ok(x + 1)),
                PipelineOperator::map("right", |x: &i64| Ok(x - 1)),
            ])
            .unwrap()
            .join(PipelineOperator::map("merge", |x: &i64| Ok(*x)))
            .unwrap();
        let dag = pipeline.dag();
        assert_eq!(dag.downstream(0), &[1, 2]);
        assert_eq!(dag.upstream(3), &[1, 2]);
        assert_eq!(dag.leaves(), vec![3]);
    }

    #[test]
    fn test_edge_into_source_rejected() {
        let result = numbers()
            .map("double", |x: &i64| Ok(x * 2), 1, ExecutorKind::Sequential)
            .unwrap()
            .source("other", || 0..3_i64)
            .unwrap()
            .connect("double", "other");
        assert!(matches!(result, Err(Error::OperatorSetup(_))));
    }

    #[test]
    fn test_join_without_upstream_rejected() {
        let merge = PipelineOperator::map("merge", |x: &i64| Ok(*x));
        let result = Pipeline::<i64>::new("empty").join(merge);
        assert!(matches!(result, Err(Error::OperatorSetup(_))));
        let result = numbers().branch(Vec::new());
        assert!(matches!(result, Err(Error::OperatorSetup(_))));
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let result = numbers().connect("numbers", "missing");
        assert!(matches!(result, Err(Error::OperatorSetup(msg)) if msg.contains("missing")));
    }

    #[test]
    fn test_execute_requires_input_for_transform_roots() {
        let pipeline = Pipeline::new("rootless")
            .map("double", |x: &i64| Ok(x * 2), 1, ExecutorKind::Sequential)
            .unwrap();
        assert!(matches!(pipeline.execute(None), Err(Error::OperatorSetup(_))));
        let report = pipeline.execute(Some(vec![1, 2])).unwrap();
        assert_eq!(report.output("double"), Some(&[2, 4][..]));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let result = Pipeline::<i64>::new("empty").execute(None);
        assert!(matches!(result, Err(Error::OperatorSetup(_))));
    }
}
