mod common;

use std::thread;
use std::time::Duration;

use pipeinfer::{
    ExecutorKind, NodeStatus, Pipeline, PipelineConfig, PipelineOperator, SchedulerBackend,
};
use proptest::prelude::*;
use test_case::test_case;

/// source -> {tens, evens} -> merge
fn diamond(config: PipelineConfig, items: i64) -> Pipeline<i64> {
    Pipeline::new("diamond")
        .with_config(config)
        .unwrap()
        .source("numbers", move || 0..items)
        .unwrap()
        .branch(vec![
            PipelineOperator::map("tens", |x: &i64| Ok(x * 10)),
            PipelineOperator::filter("evens", |x: &i64| x % 2 == 0),
        ])
        .unwrap()
        .join(PipelineOperator::map("merge", |x: &i64| Ok(x + 1)))
        .unwrap()
}

#[test]
fn test_modes_agree_on_diamond() {
    let mut expected: Option<Vec<i64>> = None;
    for (label, config) in common::all_configs() {
        let report = diamond(config, 200).execute(None).unwrap();
        assert!(report.is_success(), "{label}: {:?}", report.unsuccessful());
        let merged = common::sorted(report.output("merge").unwrap());
        assert_eq!(merged.len(), 300, "{label}");
        match &expected {
            Some(expected) => assert_eq!(&merged, expected, "{label}"),
            None => expected = Some(merged),
        }
    }
}

#[test]
fn test_modes_agree_on_linear_sequences() {
    let mut expected: Option<Vec<i64>> = None;
    for (label, config) in common::all_configs() {
        let report = Pipeline::new("chain")
            .with_config(config)
            .unwrap()
            .source("numbers", || 0..500_i64)
            .unwrap()
            .map("triple", |x: &i64| Ok(x * 3), 3, ExecutorKind::Thread)
            .unwrap()
            .filter("odd", |x: &i64| x % 2 == 1, 1, ExecutorKind::Sequential)
            .unwrap()
            .map("dec", |x: &i64| Ok(x - 1), 2, ExecutorKind::PipelinedThread)
            .unwrap()
            .execute(None)
            .unwrap();
        let output = report.output("dec").unwrap().to_vec();
        match &expected {
            Some(expected) => assert_eq!(&output, expected, "{label}"),
            None => expected = Some(output),
        }
    }
}

#[test_case(SchedulerBackend::Async ; "async")]
#[test_case(SchedulerBackend::Threaded ; "threaded")]
fn test_branch_that_drops_everything_does_not_stall_join(scheduler: SchedulerBackend) {
    let mut config = PipelineConfig::pipelined(scheduler);
    config.edge_capacity = 4;
    config.micro_batch = 2;
    config.monitoring = false;
    config.node_timeout_ms = Some(10_000);

    let report = Pipeline::new("lopsided")
        .with_config(config)
        .unwrap()
        .source("numbers", || 0..1_000_i64)
        .unwrap()
        .branch(vec![
            PipelineOperator::map("kept", |x: &i64| Ok(*x)),
            PipelineOperator::filter("nothing", |_: &i64| false),
        ])
        .unwrap()
        .join(PipelineOperator::map("merge", |x: &i64| Ok(*x)))
        .unwrap()
        .execute(None)
        .unwrap();

    assert!(report.is_success(), "{:?}", report.unsuccessful());
    assert_eq!(report.output("merge").unwrap(), (0..1_000).collect::<Vec<_>>().as_slice());
    assert_eq!(report.node("nothing").unwrap().output.len(), 0);
}

#[test_case(SchedulerBackend::Async ; "async")]
#[test_case(SchedulerBackend::Threaded ; "threaded")]
fn test_node_timeout_fails_waiting_node(scheduler: SchedulerBackend) {
    let mut config = PipelineConfig::pipelined(scheduler);
    config.micro_batch = 1;
    config.monitoring = false;
    config.node_timeout_ms = Some(50);

    let report = Pipeline::new("stalled")
        .with_config(config)
        .unwrap()
        .source("numbers", || 0..3_i64)
        .unwrap()
        .map(
            "sluggish",
            |x: &i64| {
                thread::sleep(Duration::from_millis(300));
                Ok(*x)
            },
            1,
            ExecutorKind::Sequential,
        )
        .unwrap()
        .map("waiting", |x: &i64| Ok(*x), 1, ExecutorKind::Sequential)
        .unwrap()
        .execute(None)
        .unwrap();

    assert_eq!(report.status("waiting"), Some(NodeStatus::Failed));
    let error = report.node("waiting").unwrap().error.as_deref().unwrap();
    assert!(error.contains("Timed out"), "{error}");
}

#[test]
fn test_concurrent_node_cap_of_one_still_completes() {
    let mut config = common::pipelined_threaded();
    config.max_concurrent_nodes = 1;
    let report = diamond(config, 100).execute(None).unwrap();
    assert!(report.is_success());
    assert_eq!(report.output("merge").unwrap().len(), 150);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn test_pipelined_matches_stage_sequential(
        items in 0_i64..300,
        modulus in 2_i64..7,
        edge_capacity in 1_usize..16,
        micro_batch in 1_usize..9,
    ) {
        let build = |config: PipelineConfig| {
            Pipeline::new("law")
                .with_config(config)
                .unwrap()
                .source("numbers", move || 0..items)
                .unwrap()
                .branch(vec![
                    PipelineOperator::filter("kept", move |x: &i64| x % modulus == 0),
                    PipelineOperator::map("scaled", |x: &i64| Ok(x * 7)),
                ])
                .unwrap()
                .join(PipelineOperator::map("merge", |x: &i64| Ok(x - 1)))
                .unwrap()
        };

        let stage = build(common::stage()).execute(None).unwrap();
        let mut config = common::pipelined_threaded();
        config.edge_capacity = edge_capacity;
        config.micro_batch = micro_batch;
        let pipelined = build(config).execute(None).unwrap();

        prop_assert_eq!(
            common::sorted(stage.output("merge").unwrap()),
            common::sorted(pipelined.output("merge").unwrap())
        );
    }
}
