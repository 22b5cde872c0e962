//! Every executor yields what sequential application would, in order

use std::thread;
use std::time::Duration;

use pipeinfer_core::{ExecContext, ExecutorConfig, ExecutorKind, SequentialExecutor, Transform};
use pipeinfer_core::{Executor, Yielded};
use pipeinfer_parallel::build_executor;
use proptest::prelude::*;

fn jittery() -> Transform<i64> {
    Transform::map("jittery", |x: &i64| {
        anyhow::ensure!(x % 11 != 5, "unlucky {x}");
        if x % 3 == 0 {
            thread::sleep(Duration::from_micros(200));
        }
        Ok(x.wrapping_mul(31).wrapping_add(7))
    })
}

fn run(executor: &dyn Executor<i64>, input: Vec<i64>) -> Vec<Yielded<i64>> {
    executor
        .execute(jittery(), Box::new(input.into_iter()), ExecContext::new("jittery"))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_thread_executors_match_sequential(
        input in prop::collection::vec(-1_000_i64..1_000, 0..200),
        workers in 1_usize..6,
        memory in 1_usize..16,
        pipelined in any::<bool>(),
    ) {
        let expected = run(&SequentialExecutor::new(), input.clone());

        let kind = if pipelined { ExecutorKind::PipelinedThread } else { ExecutorKind::Thread };
        let config = ExecutorConfig {
            max_workers: workers,
            max_memory_items: memory,
            batch_size: 3,
            ..ExecutorConfig::default()
        };
        let executor = build_executor::<i64>(kind, &config).unwrap();
        let actual = run(executor.as_ref(), input);
        executor.shutdown();

        prop_assert_eq!(actual, expected);
    }
}
