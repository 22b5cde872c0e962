mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pipeinfer::ops;
use pipeinfer::{
    shared, CollectingListener, Error, ErrorPolicy, EventKind, ExecContext, Executor, ExecutorKind,
    ItemStream, NodeStatus, Pipeline, PipelineConfig, PipelineOperator, Transform, YieldStream,
};
use test_case::test_case;

fn doubled(config: PipelineConfig) -> Pipeline<i64> {
    Pipeline::new("doubled")
        .with_config(config)
        .unwrap()
        .source("numbers", || 1..=5_i64)
        .unwrap()
        .map("double", |x: &i64| Ok(x * 2), 1, ExecutorKind::Sequential)
        .unwrap()
}

#[test_case(common::stage() ; "stage")]
#[test_case(common::pipelined_async() ; "pipelined async")]
#[test_case(common::pipelined_threaded() ; "pipelined threaded")]
fn test_linear_chain(config: PipelineConfig) {
    let report = doubled(config).execute(None).unwrap();
    assert!(report.is_success());
    assert_eq!(report.output("double"), Some(&[2, 4, 6, 8, 10][..]));
    assert_eq!(report.node("numbers").unwrap().output.len(), 5);
    assert_eq!(report.node("double").unwrap().timing.items_in, 5);
}

#[test_case(common::stage() ; "stage")]
#[test_case(common::pipelined_threaded() ; "pipelined threaded")]
fn test_skip_policy_drops_failed_item(config: PipelineConfig) {
    let listener = CollectingListener::new();
    let pipeline = Pipeline::new("skipping")
        .with_config(config)
        .unwrap()
        .add_listener(shared(listener.clone()))
        .source("numbers", || 1..=10_i64)
        .unwrap()
        .then(ops::map_with_policy(
            "checked",
            |x: &i64| {
                anyhow::ensure!(*x != 5, "five is rejected");
                Ok(*x)
            },
            ErrorPolicy::Skip,
        ))
        .unwrap();

    let report = pipeline.execute(None).unwrap();
    let output = report.output("checked").unwrap();
    assert_eq!(output.len(), 9);
    assert!(!output.contains(&5));
    assert_eq!(report.status("checked"), Some(NodeStatus::Completed));
    assert_eq!(report.node("checked").unwrap().timing.items_failed, 1);

    let errors = listener.of_kind("error");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].operator, "checked");
}

#[test_case(common::stage() ; "stage")]
#[test_case(common::pipelined_async() ; "pipelined async")]
#[test_case(common::pipelined_threaded() ; "pipelined threaded")]
fn test_branch_failure_is_isolated(config: PipelineConfig) {
    let report = Pipeline::new("branches")
        .with_config(config)
        .unwrap()
        .source("numbers", || 0..50_i64)
        .unwrap()
        .branch(vec![
            PipelineOperator::map("healthy", |x: &i64| Ok(x + 1)),
            PipelineOperator::map("broken", |x: &i64| {
                anyhow::ensure!(*x < 10, "cannot handle {x}");
                Ok(*x)
            }),
        ])
        .unwrap()
        .execute(None)
        .unwrap();

    assert_eq!(report.status("healthy"), Some(NodeStatus::Completed));
    assert_eq!(report.status("broken"), Some(NodeStatus::Failed));
    assert_eq!(report.output("healthy").unwrap().len(), 50);
    let error = report.node("broken").unwrap().error.as_deref().unwrap();
    assert!(error.contains("cannot handle 10"), "{error}");
    assert_eq!(report.unsuccessful(), vec!["broken"]);
}

/// Runs a few items, then loses its worker the way a crashed child would
struct CrashingExecutor {
    survives: usize,
}

impl Executor<i64> for CrashingExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Process
    }

    fn execute(
        &self,
        transform: Transform<i64>,
        input: ItemStream<i64>,
        ctx: ExecContext,
    ) -> pipeinfer::Result<YieldStream<i64>> {
        let survives = self.survives;
        let policy = ctx.policy;
        let outcomes = input.enumerate().take(survives + 1).map(move |(index, item)| {
            if index < survives {
                Ok(transform.run(index as u64, &item, &policy))
            } else {
                Err(Error::resource("worker 0 exited with status 13"))
            }
        });
        Ok(Box::new(outcomes))
    }
}

#[test_case(common::stage() ; "stage")]
#[test_case(common::pipelined_async() ; "pipelined async")]
#[test_case(common::pipelined_threaded() ; "pipelined threaded")]
fn test_crashed_worker_fails_only_its_branch(config: PipelineConfig) {
    let offloaded = PipelineOperator::map("offloaded", |x: &i64| Ok(x * 10))
        .with_executor(Arc::new(CrashingExecutor { survives: 5 }));
    let report = Pipeline::new("crash")
        .with_config(config)
        .unwrap()
        .source("numbers", || 0..30_i64)
        .unwrap()
        .branch(vec![PipelineOperator::map("local", |x: &i64| Ok(x + 1)), offloaded])
        .unwrap()
        .execute(None)
        .unwrap();

    assert_eq!(report.status("local"), Some(NodeStatus::Completed));
    assert_eq!(report.output("local").unwrap().len(), 30);
    assert_eq!(report.status("offloaded"), Some(NodeStatus::Failed));
    let error = report.node("offloaded").unwrap().error.as_deref().unwrap();
    assert!(error.contains("exited with status 13"), "{error}");
    assert_eq!(report.unsuccessful(), vec!["offloaded"]);
}

#[test_case(common::stage() ; "stage")]
#[test_case(common::pipelined_async() ; "pipelined async")]
#[test_case(common::pipelined_threaded() ; "pipelined threaded")]
fn test_join_after_failure_is_skipped(config: PipelineConfig) {
    let report = Pipeline::new("joined")
        .with_config(config)
        .unwrap()
        .source("numbers", || 0..20_i64)
        .unwrap()
        .branch(vec![
            PipelineOperator::map("left", |x: &i64| Ok(*x)),
            PipelineOperator::map("right", |_: &i64| -> anyhow::Result<i64> {
                anyhow::bail!("always fails")
            }),
        ])
        .unwrap()
        .join(PipelineOperator::map("merge", |x: &i64| Ok(*x)))
        .unwrap()
        .execute(None)
        .unwrap();

    assert_eq!(report.status("left"), Some(NodeStatus::Completed));
    assert_eq!(report.status("right"), Some(NodeStatus::Failed));
    assert_eq!(report.status("merge"), Some(NodeStatus::SkippedUpstreamFailure));
    let error = report.node("merge").unwrap().error.as_deref().unwrap();
    assert!(error.contains("right"), "{error}");
}

#[test]
fn test_cycle_rejected_at_build_time() {
    let built = Pipeline::new("cyclic")
        .source("numbers", || 0..3_i64)
        .unwrap()
        .map("a", |x: &i64| Ok(*x), 1, ExecutorKind::Sequential)
        .unwrap()
        .map("b", |x: &i64| Ok(*x), 1, ExecutorKind::Sequential)
        .unwrap()
        .join_into("a");
    assert!(matches!(built, Err(Error::OperatorSetup(msg)) if msg.contains("cycle")));

    let built = Pipeline::new("cyclic")
        .source("numbers", || 0..3_i64)
        .unwrap()
        .map("a", |x: &i64| Ok(*x), 1, ExecutorKind::Sequential)
        .unwrap()
        .map("b", |x: &i64| Ok(*x), 1, ExecutorKind::Sequential)
        .unwrap()
        .connect("b", "a");
    assert!(matches!(built, Err(Error::OperatorSetup(_))));
}

#[test]
fn test_duplicate_operator_name_rejected() {
    let built = Pipeline::new("dupes")
        .source("numbers", || 0..3_i64)
        .unwrap()
        .map("numbers", |x: &i64| Ok(*x), 1, ExecutorKind::Sequential);
    assert!(matches!(built, Err(Error::OperatorSetup(_))));
}

#[test_case(common::stage() ; "stage")]
#[test_case(common::pipelined_async() ; "pipelined async")]
fn test_reexecution_is_idempotent(config: PipelineConfig) {
    let pipeline = doubled(config)
        .map("square", |x: &i64| Ok(x * x), 2, ExecutorKind::Thread)
        .unwrap();
    let first = pipeline.execute(None).unwrap();
    let second = pipeline.execute(None).unwrap();
    assert_eq!(first.output("square"), second.output("square"));
    assert_ne!(first.run_id, second.run_id);
}

#[test]
fn test_initial_input_feeds_transform_roots() {
    let pipeline = Pipeline::new("fed")
        .with_config(common::pipelined_threaded())
        .unwrap()
        .map("inc", |x: &i64| Ok(x + 1), 1, ExecutorKind::Sequential)
        .unwrap()
        .filter("odd", |x: &i64| x % 2 == 1, 1, ExecutorKind::Sequential)
        .unwrap();
    let report = pipeline.execute(Some((0..10).collect())).unwrap();
    assert_eq!(report.output("odd"), Some(&[1, 3, 5, 7, 9][..]));
}

#[test]
fn test_retain_outputs_keeps_inner_nodes() {
    let mut config = common::stage();
    config.retain_outputs = true;
    let report = doubled(config)
        .map("inc", |x: &i64| Ok(x + 1), 1, ExecutorKind::Sequential)
        .unwrap()
        .execute(None)
        .unwrap();
    assert_eq!(report.output("double"), Some(&[2, 4, 6, 8, 10][..]));
    assert_eq!(report.output("inc"), Some(&[3, 5, 7, 9, 11][..]));

    let report = doubled(common::stage())
        .map("inc", |x: &i64| Ok(x + 1), 1, ExecutorKind::Sequential)
        .unwrap()
        .execute(None)
        .unwrap();
    assert_eq!(report.output("double"), None);
    assert_eq!(report.node("double").unwrap().output.len(), 5);
}

#[test]
fn test_operator_listener_sees_only_its_operator() {
    let own = CollectingListener::new();
    let pipeline = Pipeline::new("scoped")
        .with_config(common::pipelined_async())
        .unwrap()
        .source("numbers", || 0..10_i64)
        .unwrap()
        .then(PipelineOperator::map("watched", |x: &i64| Ok(*x)).with_listener(shared(own.clone())))
        .unwrap()
        .map("other", |x: &i64| Ok(*x), 1, ExecutorKind::Sequential)
        .unwrap();
    pipeline.execute(None).unwrap();

    let events = own.events();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.operator == "watched"));
    assert!(events.iter().any(|e| matches!(e.kind, EventKind::OperatorComplete { .. })));
}

#[test_case(common::stage() ; "stage")]
#[test_case(common::pipelined_async() ; "pipelined async")]
#[test_case(common::pipelined_threaded() ; "pipelined threaded")]
fn test_cancellation_stops_unbounded_source(config: PipelineConfig) {
    let pipeline = Pipeline::new("endless")
        .with_config(config)
        .unwrap()
        .source("counter", || (0_i64..).inspect(|_| thread::sleep(Duration::from_micros(20))))
        .unwrap()
        .map(
            "slow",
            |x: &i64| {
                thread::sleep(Duration::from_micros(200));
                Ok(*x)
            },
            1,
            ExecutorKind::Sequential,
        )
        .unwrap();

    let token = pipeline.cancellation_token();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        token.cancel();
    });
    let report = pipeline.execute(None).unwrap();
    canceller.join().unwrap();

    assert_eq!(report.status("counter"), Some(NodeStatus::Cancelled));
    assert_eq!(report.status("slow"), Some(NodeStatus::Cancelled));
    assert!(!report.is_success());
}

#[test]
fn test_invalid_config_rejected() {
    let config = PipelineConfig {
        micro_batch: 0,
        ..PipelineConfig::default()
    };
    let result = Pipeline::<i64>::new("bad").with_config(config);
    assert!(matches!(result, Err(Error::OperatorSetup(_))));
}
