//! Configuration for executors, error handling and event dispatch
//!
//! Every struct here has a `Default` and derives serde with
//! `#[serde(default)]`, so partial JSON documents fill in the rest.
//! Durations are expressed in milliseconds.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable that marks a process as a pipeinfer worker
pub const WORKER_ENV_VAR: &str = "PIPEINFER_WORKER";

/// Concurrency strategy used to run an operator's transform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    /// Item by item on the calling thread
    #[default]
    Sequential,
    /// Shared-memory worker threads
    Thread,
    /// Isolated worker processes fed with fixed-size batches
    Process,
    /// Worker threads with overlapping, adaptively sized batches
    PipelinedThread,
    /// Worker processes with overlapping, adaptively sized batches
    PipelinedProcess,
    /// Process pool for wide operators, thread pool otherwise
    Auto,
}

impl ExecutorKind {
    /// Resolve the concrete kind for the given parallel degree.
    ///
    /// A degree of one or less always means sequential execution.
    pub fn resolve(self, parallel_degree: usize) -> ExecutorKind {
        if parallel_degree <= 1 {
            return ExecutorKind::Sequential;
        }
        match self {
            ExecutorKind::Auto if parallel_degree > 4 => ExecutorKind::Process,
            ExecutorKind::Auto => ExecutorKind::Thread,
            other => other,
        }
    }

    /// Whether this kind moves items across a process boundary
    pub fn is_process_based(self) -> bool {
        matches!(self, ExecutorKind::Process | ExecutorKind::PipelinedProcess)
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutorKind::Sequential => "sequential",
            ExecutorKind::Thread => "thread",
            ExecutorKind::Process => "process",
            ExecutorKind::PipelinedThread => "pipelined-thread",
            ExecutorKind::PipelinedProcess => "pipelined-process",
            ExecutorKind::Auto => "auto",
        };
        f.write_str(name)
    }
}

impl FromStr for ExecutorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(ExecutorKind::Sequential),
            "thread" => Ok(ExecutorKind::Thread),
            "process" => Ok(ExecutorKind::Process),
            "pipelined-thread" | "pipeline-thread" => Ok(ExecutorKind::PipelinedThread),
            "pipelined-process" | "pipeline-process" => Ok(ExecutorKind::PipelinedProcess),
            "auto" => Ok(ExecutorKind::Auto),
            other => Err(Error::setup(format!("unknown executor kind `{other}`"))),
        }
    }
}

/// What to do once retries of a failing item are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetryFallback {
    /// Stop the operator
    #[default]
    Abort,
    /// Drop the item and continue
    Skip,
}

/// Per-operator policy for items whose transform fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorPolicy {
    /// Stop the owning operator and mark its output failed
    #[default]
    Abort,
    /// Drop the failing item and keep going
    Skip,
    /// Re-run the item on the same worker before falling back
    Retry {
        /// Extra attempts after the first failure
        attempts: u32,

        /// Policy applied when every attempt failed
        #[serde(default)]
        fallback: RetryFallback,
    },
}

impl ErrorPolicy {
    /// Retry `attempts` times, then abort
    pub fn retry(attempts: u32) -> Self {
        ErrorPolicy::Retry {
            attempts,
            fallback: RetryFallback::Abort,
        }
    }

    /// Total number of times an item may be tried
    pub fn max_attempts(&self) -> u32 {
        match self {
            ErrorPolicy::Abort | ErrorPolicy::Skip => 1,
            ErrorPolicy::Retry { attempts, .. } => attempts.saturating_add(1),
        }
    }

    /// Whether an item that failed for good is dropped rather than fatal
    pub fn skips_failures(&self) -> bool {
        matches!(
            self,
            ErrorPolicy::Skip
                | ErrorPolicy::Retry {
                    fallback: RetryFallback::Skip,
                    ..
                }
        )
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorPolicy::Abort => f.write_str("abort"),
            ErrorPolicy::Skip => f.write_str("skip"),
            ErrorPolicy::Retry {
                attempts,
                fallback: RetryFallback::Abort,
            } => write!(f, "retry({attempts})"),
            ErrorPolicy::Retry {
                attempts,
                fallback: RetryFallback::Skip,
            } => write!(f, "retry({attempts},skip)"),
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "abort" => return Ok(ErrorPolicy::Abort),
            "skip" => return Ok(ErrorPolicy::Skip),
            _ => {}
        }

        let inner = s
            .strip_prefix("retry(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| Error::setup(format!("unknown error policy `{s}`")))?;

        let (count, fallback) = match inner.split_once(',') {
            Some((count, "skip")) => (count, RetryFallback::Skip),
            Some((count, "abort")) => (count, RetryFallback::Abort),
            Some((_, other)) => {
                return Err(Error::setup(format!("unknown retry fallback `{other}`")))
            }
            None => (inner, RetryFallback::Abort),
        };

        let attempts = count
            .trim()
            .parse::<u32>()
            .map_err(|e| Error::setup(format!("invalid retry count `{count}`: {e}")))?;

        Ok(ErrorPolicy::Retry { attempts, fallback })
    }
}

/// Command line used to launch worker processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Executable to run
    pub program: PathBuf,

    /// Arguments passed to the executable
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl WorkerCommand {
    /// Run `program` as a worker
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: vec![(WORKER_ENV_VAR.to_string(), "1".to_string())],
        }
    }

    /// Re-launch the running executable in worker mode
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::resource(format!("cannot locate current executable: {e}")))?;
        Ok(Self::new(program))
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Configuration for one executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Number of worker threads or processes
    pub max_workers: usize,

    /// Cap on items pulled from the input but not yet yielded
    pub max_memory_items: usize,

    /// Number of batches allowed in flight at once (pipelined kinds)
    pub pipeline_depth: usize,

    /// Let pipelined kinds resize batches at runtime
    pub adaptive_batching: bool,

    /// Initial (or fixed) batch size
    pub batch_size: usize,

    /// Lower bound for adaptive batch sizes
    pub min_batch_size: usize,

    /// Upper bound for adaptive batch sizes
    pub max_batch_size: usize,

    /// How failing items are handled
    pub error_policy: ErrorPolicy,

    /// Longest wait for an item's result once it was handed to a worker,
    /// if bounded
    pub item_timeout_ms: Option<u64>,

    /// Worker launch command for process-based kinds
    pub worker_command: Option<WorkerCommand>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let max_workers = num_cpus::get().max(1);
        Self {
            max_workers,
            max_memory_items: 10_000,
            pipeline_depth: 3,
            adaptive_batching: true,
            batch_size: max_workers * 2,
            min_batch_size: 1,
            max_batch_size: 1024,
            error_policy: ErrorPolicy::Abort,
            item_timeout_ms: None,
            worker_command: None,
        }
    }
}

impl ExecutorConfig {
    /// Defaults tuned for `kind` running with `parallel_degree` workers
    pub fn for_kind(kind: ExecutorKind, parallel_degree: usize) -> Self {
        let max_workers = parallel_degree.max(1);
        let mut config = Self {
            max_workers,
            batch_size: max_workers * 2,
            ..Self::default()
        };

        match kind {
            ExecutorKind::Process | ExecutorKind::PipelinedProcess => {
                config.max_memory_items = 5_000;
                config.batch_size = (config.max_memory_items / max_workers).clamp(1, 256);
            }
            ExecutorKind::Auto if max_workers > 4 => {
                config.max_memory_items = (10_000 / max_workers).max(1);
                config.batch_size = (config.max_memory_items / max_workers).clamp(1, 256);
            }
            _ => {}
        }
        config.max_batch_size = config.max_batch_size.max(config.batch_size);
        config
    }

    /// Builder-style error policy override
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Builder-style in-flight cap override
    pub fn with_max_memory_items(mut self, max_memory_items: usize) -> Self {
        self.max_memory_items = max_memory_items;
        self
    }

    /// Result wait bound as a duration
    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_ms.map(Duration::from_millis)
    }

    /// Reject configurations no executor can run with
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::setup("max_workers must be at least 1"));
        }
        if self.max_memory_items == 0 {
            return Err(Error::setup("max_memory_items must be at least 1"));
        }
        if self.pipeline_depth == 0 {
            return Err(Error::setup("pipeline_depth must be at least 1"));
        }
        if self.batch_size == 0 || self.min_batch_size == 0 {
            return Err(Error::setup("batch sizes must be at least 1"));
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(Error::setup(format!(
                "min_batch_size ({}) exceeds max_batch_size ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        Ok(())
    }
}

/// Delivery mode for events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventMode {
    /// Listeners run on the emitting thread
    #[default]
    Sync,
    /// Events are queued and delivered in batches by background workers
    Async,
    /// Like `Async`, with bursts of progress events coalesced first
    Buffered,
}

impl FromStr for EventMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Ok(EventMode::Sync),
            "async" => Ok(EventMode::Async),
            "buffered" => Ok(EventMode::Buffered),
            other => Err(Error::setup(format!("unknown event mode `{other}`"))),
        }
    }
}

/// Behaviour of a full event queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Wait up to `timeout_ms` for room, then count the event as dropped
    Block {
        /// Longest wait for queue space
        timeout_ms: u64,
    },
    /// Count the event as dropped right away
    Drop,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        OverflowPolicy::Block { timeout_ms: 100 }
    }
}

/// Configuration for event dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Delivery mode
    pub mode: EventMode,

    /// Bounded queue capacity for asynchronous modes
    pub queue_capacity: usize,

    /// Largest batch handed to listeners at once
    pub batch_size: usize,

    /// Longest wait for a batch to fill
    pub batch_timeout_ms: u64,

    /// Number of delivery workers
    pub workers: usize,

    /// What happens when the queue is full
    pub overflow: OverflowPolicy,

    /// Time window for coalescing progress events
    pub coalesce_window_ms: u64,

    /// Buffered events that force a flush
    pub coalesce_max: usize,

    /// Longest wait for the queue to drain on shutdown
    pub shutdown_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: EventMode::Sync,
            queue_capacity: 10_000,
            batch_size: 50,
            batch_timeout_ms: 100,
            workers: 2,
            overflow: OverflowPolicy::default(),
            coalesce_window_ms: 50,
            coalesce_max: 20,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl DispatchConfig {
    /// Default configuration with the given mode
    pub fn with_mode(mode: EventMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Batch wait bound as a duration
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Coalescing window as a duration
    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    /// Shutdown drain bound as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject unusable dispatch settings
    pub fn validate(&self) -> Result<()> {
        if self.mode != EventMode::Sync {
            if self.queue_capacity == 0 {
                return Err(Error::setup("event queue_capacity must be at least 1"));
            }
            if self.workers == 0 || self.batch_size == 0 {
                return Err(Error::setup("event workers and batch_size must be at least 1"));
            }
        }
        Ok(())
    }
}

/// Throttling for progress events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Emit after this many items since the last progress event
    pub every_items: u64,

    /// Emit after this much time since the last progress event
    pub every_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            every_items: 1_000,
            every_ms: 500,
        }
    }
}

impl ProgressConfig {
    /// Time threshold as a duration
    pub fn every(&self) -> Duration {
        Duration::from_millis(self.every_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("sequential", ExecutorKind::Sequential)]
    #[test_case("thread", ExecutorKind::Thread)]
    #[test_case("process", ExecutorKind::Process)]
    #[test_case("pipelined-thread", ExecutorKind::PipelinedThread)]
    #[test_case("Pipelined-Process", ExecutorKind::PipelinedProcess)]
    fn test_executor_kind_parse(input: &str, expected: ExecutorKind) {
        assert_eq!(input.parse::<ExecutorKind>().unwrap(), expected);
        assert_eq!(expected.to_string().parse::<ExecutorKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_executor_kind() {
        let err = "gpu".parse::<ExecutorKind>().unwrap_err();
        assert!(matches!(err, Error::OperatorSetup(_)));
    }

    #[test]
    fn test_degree_one_forces_sequential() {
        assert_eq!(ExecutorKind::Process.resolve(1), ExecutorKind::Sequential);
        assert_eq!(ExecutorKind::Thread.resolve(0), ExecutorKind::Sequential);
        assert_eq!(ExecutorKind::Auto.resolve(8), ExecutorKind::Process);
        assert_eq!(ExecutorKind::Auto.resolve(2), ExecutorKind::Thread);
    }

    #[test_case("abort", ErrorPolicy::Abort)]
    #[test_case("skip", ErrorPolicy::Skip)]
    #[test_case("retry(3)", ErrorPolicy::retry(3))]
    #[test_case("retry(2,skip)", ErrorPolicy::Retry { attempts: 2, fallback: RetryFallback::Skip })]
    fn test_error_policy_parse(input: &str, expected: ErrorPolicy) {
        let parsed = input.parse::<ErrorPolicy>().unwrap();
        assert_eq!(parsed, expected);
        assert_eq!(parsed.to_string(), input);
    }

    #[test]
    fn test_error_policy_attempts() {
        assert_eq!(ErrorPolicy::Skip.max_attempts(), 1);
        assert_eq!(ErrorPolicy::retry(2).max_attempts(), 3);
        assert!(!ErrorPolicy::retry(2).skips_failures());
        assert!("retry(1,skip)".parse::<ErrorPolicy>().unwrap().skips_failures());
        assert!("retry(x)".parse::<ErrorPolicy>().is_err());
    }

    #[test]
    fn test_process_defaults_are_tighter() {
        let thread = ExecutorConfig::for_kind(ExecutorKind::Thread, 4);
        let process = ExecutorConfig::for_kind(ExecutorKind::Process, 4);
        assert_eq!(thread.max_memory_items, 10_000);
        assert_eq!(thread.batch_size, 8);
        assert!(process.max_memory_items < thread.max_memory_items);
        assert!(process.batch_size <= 256);

        let auto = ExecutorConfig::for_kind(ExecutorKind::Auto, 8);
        assert_eq!(auto.max_memory_items, 1_250);
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let config = ExecutorConfig {
            max_memory_items: 0,
            ..ExecutorConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ExecutorConfig {
            min_batch_size: 64,
            max_batch_size: 8,
            ..ExecutorConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(ExecutorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ExecutorConfig =
            serde_json::from_str(r#"{"max_workers": 3, "error_policy": "skip"}"#).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.error_policy, ErrorPolicy::Skip);
        assert_eq!(config.pipeline_depth, 3);

        let dispatch: DispatchConfig =
            serde_json::from_str(r#"{"mode": "buffered", "overflow": "drop"}"#).unwrap();
        assert_eq!(dispatch.mode, EventMode::Buffered);
        assert_eq!(dispatch.overflow, OverflowPolicy::Drop);
        assert_eq!(dispatch.coalesce_max, 20);
    }
}
