//! Benchmarks for pipeinfer executors, schedulers and dispatchers

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeinfer::{
    executor_for, shared, DispatchConfig, Error, Event, EventMode, ExecContext, ExecutionMode,
    ExecutorKind, Pipeline, PipelineConfig, Result, SchedulerBackend, Transform, Yielded,
};
use pipeinfer_core::{EventDispatcher, ListenerRegistry, ListenerScope};
use sysinfo::{ProcessesToUpdate, System};

/// Benchmark configuration
#[derive(Debug, Clone)]
pub struct BenchConfig {
    /// Number of measured iterations
    pub iterations: usize,

    /// Warmup iterations
    pub warmup_iterations: usize,

    /// Items fed through each iteration
    pub items: usize,

    /// Rounds of arithmetic per item in CPU-bound maps
    pub work_per_item: u32,

    /// Number of threads for parallel benchmarks
    pub num_threads: usize,

    /// Whether to sample resident memory after the run
    pub track_memory: bool,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            warmup_iterations: 3,
            items: 10_000,
            work_per_item: 2_000,
            num_threads: 4,
            track_memory: true,
        }
    }
}

/// Benchmark result
#[derive(Debug, Clone)]
pub struct BenchResult {
    /// Name of the benchmark
    pub name: String,

    /// Total time taken
    pub total_time: Duration,

    /// Average time per iteration
    pub avg_time: Duration,

    /// Min time per iteration
    pub min_time: Duration,

    /// Max time per iteration
    pub max_time: Duration,

    /// Resident memory of this process after the run, in bytes
    pub memory_usage: Option<u64>,

    /// Throughput (items/second)
    pub throughput: f64,
}

/// Run a benchmark
pub fn run_benchmark<F>(name: &str, config: &BenchConfig, mut func: F) -> Result<BenchResult>
where
    F: FnMut() -> Result<()>,
{
    if config.iterations == 0 {
        return Err(Error::OperatorSetup("iterations must be positive".into()));
    }

    for _ in 0..config.warmup_iterations {
        func()?;
    }

    let mut times = Vec::with_capacity(config.iterations);
    let start_total = Instant::now();
    for _ in 0..config.iterations {
        let start = Instant::now();
        func()?;
        times.push(start.elapsed());
    }
    let total_time = start_total.elapsed();

    let avg_time = times.iter().sum::<Duration>() / times.len() as u32;
    let min_time = times.iter().min().copied().unwrap_or_default();
    let max_time = times.iter().max().copied().unwrap_or_default();
    let total_items = config.iterations * config.items;
    let throughput = total_items as f64 / total_time.as_secs_f64().max(f64::EPSILON);
    let memory_usage = config.track_memory.then(current_memory_usage).flatten();

    tracing::debug!(name, ?avg_time, throughput, "benchmark finished");
    Ok(BenchResult {
        name: name.to_string(),
        total_time,
        avg_time,
        min_time,
        max_time,
        memory_usage,
        throughput,
    })
}

/// Resident memory of the current process
fn current_memory_usage() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(sysinfo::Process::memory)
}

/// Deterministic CPU-bound work on one item
pub fn spin(x: i64, rounds: u32) -> i64 {
    let mut acc = x;
    for round in 0..rounds {
        acc = acc.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(i64::from(round)) >> 1;
    }
    acc
}

/// Run one CPU-bound map over `items` on an executor of `kind`
pub fn map_on(kind: ExecutorKind, config: &BenchConfig) -> Result<usize> {
    let executor = executor_for::<i64>(kind, config.num_threads)?;
    let rounds = config.work_per_item;
    let transform = Transform::map("spin", move |x: &i64| Ok(spin(*x, rounds)));
    let input = Box::new(0..config.items as i64);
    let mut produced = 0;
    for yielded in executor.execute(transform, input, ExecContext::new("spin"))? {
        if let Yielded::Value(_) = yielded? {
            produced += 1;
        }
    }
    executor.shutdown();
    Ok(produced)
}

/// Sequential, thread and pipelined-thread executors over the same map
pub fn bench_executors(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    [ExecutorKind::Sequential, ExecutorKind::Thread, ExecutorKind::PipelinedThread]
        .into_iter()
        .map(|kind| {
            run_benchmark(&format!("executor/{kind}"), config, || {
                map_on(kind, config).map(drop)
            })
        })
        .collect()
}

/// A three-stage chain: spin, filter, spin
pub fn chain(config: &BenchConfig, pipeline_config: PipelineConfig) -> Result<Pipeline<i64>> {
    let items = config.items as i64;
    let rounds = config.work_per_item;
    Pipeline::new("bench-chain")
        .with_config(pipeline_config)?
        .source("numbers", move || 0..items)?
        .map("first", move |x: &i64| Ok(spin(*x, rounds)), 1, ExecutorKind::Sequential)?
        .filter("odd", |x: &i64| x % 2 != 0, 1, ExecutorKind::Sequential)?
        .map("second", move |x: &i64| Ok(spin(*x, rounds)), 1, ExecutorKind::Sequential)
}

/// Stage-sequential against both pipelined schedulers over the same chain
pub fn bench_scheduling(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    let modes = [
        ("stage", ExecutionMode::StageSequential, SchedulerBackend::Async),
        ("pipelined-async", ExecutionMode::Pipelined, SchedulerBackend::Async),
        ("pipelined-threaded", ExecutionMode::Pipelined, SchedulerBackend::Threaded),
    ];
    modes
        .into_iter()
        .map(|(label, mode, scheduler)| {
            let pipeline = chain(
                config,
                PipelineConfig {
                    mode,
                    scheduler,
                    monitoring: false,
                    ..PipelineConfig::default()
                },
            )?;
            run_benchmark(&format!("scheduling/{label}"), config, || {
                let report = pipeline.execute(None)?;
                if report.is_success() {
                    Ok(())
                } else {
                    let failed = report.unsuccessful();
                    Err(Error::ExecutorResource(format!("nodes failed: {failed:?}")))
                }
            })
        })
        .collect()
}

/// Push `items` progress events through a dispatcher of `mode`
pub fn dispatch_events(mode: EventMode, items: usize) -> Result<u64> {
    let delivered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&delivered);
    let mut registry = ListenerRegistry::new();
    registry.register(
        ListenerScope::All,
        shared(move |_: &Event| {
            counter.fetch_add(1, Ordering::Relaxed);
        }),
    );

    let config = DispatchConfig::with_mode(mode);
    let dispatcher = EventDispatcher::new(&config, registry)?;
    for processed in 0..items as u64 {
        dispatcher.notify(Event::progress("bench", processed, Some(items as u64)));
    }
    dispatcher.shutdown(config.shutdown_timeout())?;
    Ok(delivered.load(Ordering::Relaxed))
}

/// Dispatcher throughput for every event mode
pub fn bench_dispatch(config: &BenchConfig) -> Result<Vec<BenchResult>> {
    [EventMode::Sync, EventMode::Async, EventMode::Buffered]
        .into_iter()
        .map(|mode| {
            run_benchmark(&format!("dispatch/{mode:?}"), config, || {
                dispatch_events(mode, config.items).map(drop)
            })
        })
        .collect()
}
