//! Benchmark runner for pipeinfer executors, schedulers and dispatchers

use std::process::ExitCode;

use pipeinfer_bench::{bench_dispatch, bench_executors, bench_scheduling, BenchConfig, BenchResult};
use tracing_subscriber::EnvFilter;

fn print_table(title: &str, results: &[BenchResult]) {
    println!("\n=== {title} ===");
    println!(
        "{:<28} {:>12} {:>12} {:>12} {:>16} {:>14}",
        "benchmark", "avg", "min", "max", "items/sec", "memory"
    );
    for result in results {
        let memory = result
            .memory_usage
            .map_or_else(
                || "-".to_string(),
                |bytes| format!("{:.1} MiB", bytes as f64 / 1_048_576.0),
            );
        println!(
            "{:<28} {:>12} {:>12} {:>12} {:>16.0} {:>14}",
            result.name,
            format!("{:.2?}", result.avg_time),
            format!("{:.2?}", result.min_time),
            format!("{:.2?}", result.max_time),
            result.throughput,
            memory,
        );
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== pipeinfer benchmarks ===");

    let cpu_bound = BenchConfig {
        iterations: 5,
        warmup_iterations: 1,
        items: 20_000,
        ..BenchConfig::default()
    };
    let events = BenchConfig {
        iterations: 5,
        warmup_iterations: 1,
        items: 100_000,
        ..BenchConfig::default()
    };

    let suites = [
        ("Executors", bench_executors(&cpu_bound)),
        ("Scheduling", bench_scheduling(&cpu_bound)),
        ("Dispatch", bench_dispatch(&events)),
    ];

    let mut failed = false;
    for (title, outcome) in suites {
        match outcome {
            Ok(results) => print_table(title, &results),
            Err(err) => {
                tracing::error!(suite = title, error = %err, "benchmark suite failed");
                failed = true;
            }
        }
    }

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
