//! Common test utilities and helpers

#![allow(dead_code)] // Not every test file uses every helper

use pipeinfer_core::{ExecutorConfig, WorkerCommand, YieldStream, Yielded};

/// Launch command for the bundled `i64` worker binary
pub fn worker_command() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_pipeinfer-worker"))
}

/// Executor configuration running the bundled worker
pub fn process_config(
    workers: usize,
    batch_size: usize,
    max_memory_items: usize,
) -> ExecutorConfig {
    ExecutorConfig {
        max_workers: workers,
        batch_size,
        max_memory_items,
        worker_command: Some(worker_command()),
        ..ExecutorConfig::default()
    }
}

/// Drain a stream, panicking on terminal errors
pub fn outcomes<T>(stream: YieldStream<T>) -> Vec<Yielded<T>> {
    stream.map(|r| r.expect("stream failed")).collect()
}

/// Values of a stream, failures and drops removed
pub fn values<T>(stream: YieldStream<T>) -> Vec<T> {
    outcomes(stream).into_iter().filter_map(Yielded::into_value).collect()
}
