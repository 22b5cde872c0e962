//! Common test utilities and helpers

#![allow(dead_code)] // Not every test file uses every helper

use pipeinfer::{ExecutionMode, PipelineConfig, SchedulerBackend};

/// Small edges and chunks so that backpressure is exercised
pub fn config(mode: ExecutionMode, scheduler: SchedulerBackend) -> PipelineConfig {
    PipelineConfig {
        mode,
        scheduler,
        edge_capacity: 8,
        micro_batch: 4,
        node_timeout_ms: Some(10_000),
        monitoring: false,
        ..PipelineConfig::default()
    }
}

pub fn stage() -> PipelineConfig {
    config(ExecutionMode::StageSequential, SchedulerBackend::Async)
}

pub fn pipelined_async() -> PipelineConfig {
    config(ExecutionMode::Pipelined, SchedulerBackend::Async)
}

pub fn pipelined_threaded() -> PipelineConfig {
    config(ExecutionMode::Pipelined, SchedulerBackend::Threaded)
}

/// Every execution strategy, with a label for assertion messages
pub fn all_configs() -> Vec<(&'static str, PipelineConfig)> {
    vec![
        ("stage", stage()),
        ("async", pipelined_async()),
        ("threaded", pipelined_threaded()),
    ]
}

/// Sorted copy, for comparing outputs as multisets
pub fn sorted(items: &[i64]) -> Vec<i64> {
    let mut items = items.to_vec();
    items.sort_unstable();
    items
}
