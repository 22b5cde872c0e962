//! Worker process for process-based executors over `i64` items
//!
//! Speaks the frame protocol on stdin and stdout; logs go to stderr.

use std::process::ExitCode;

use pipeinfer_core::Transform;
use pipeinfer_parallel::{run_worker, TaskRegistry};
use tracing_subscriber::EnvFilter;

fn registry() -> TaskRegistry<i64> {
    TaskRegistry::new()
        .with(Transform::map("double", |x: &i64| Ok(x * 2)))
        .with(Transform::map("increment", |x: &i64| Ok(x + 1)))
        .with(Transform::map("square", |x: &i64| Ok(x * x)))
        .with(Transform::map("fail_on_seven", |x: &i64| {
            anyhow::ensure!(*x != 7, "refusing to process {x}");
            Ok(*x)
        }))
        .with(Transform::map("exit_on_thirteen", |x: &i64| {
            if *x == 13 {
                std::process::exit(3);
            }
            Ok(*x)
        }))
        .with(Transform::filter("keep_even", |x: &i64| x % 2 == 0))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run_worker(&registry()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "worker stopped");
            ExitCode::FAILURE
        }
    }
}
