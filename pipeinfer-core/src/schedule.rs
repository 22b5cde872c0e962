//! Pipeline-level configuration and execution reports

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{DispatchConfig, ProgressConfig};
use crate::dispatch::DispatchStats;
use crate::error::{Error, Result};

/// How a pipeline walks its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Topological order; every node drains its upstreams before starting
    #[default]
    StageSequential,
    /// All nodes run concurrently, streaming over bounded edges
    Pipelined,
}

/// Which scheduler runs pipelined execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerBackend {
    /// Cooperative tasks on a tokio runtime
    #[default]
    Async,
    /// One OS thread per node
    Threaded,
}

/// Configuration for a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Execution strategy
    pub mode: ExecutionMode,

    /// Scheduler used when `mode` is pipelined
    pub scheduler: SchedulerBackend,

    /// Upper bound on node tasks processing a chunk at the same time
    pub max_concurrent_nodes: usize,

    /// Capacity of every edge queue, in items
    pub edge_capacity: usize,

    /// Largest chunk a pipelined node processes at once
    pub micro_batch: usize,

    /// Keep outputs of inner nodes, not only of leaves
    pub retain_outputs: bool,

    /// Longest wait at any scheduler suspension point
    pub node_timeout_ms: Option<u64>,

    /// Attach the shared performance monitor to every operator
    pub monitoring: bool,

    /// Event delivery
    pub events: DispatchConfig,

    /// Progress event throttling
    pub progress: ProgressConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::StageSequential,
            scheduler: SchedulerBackend::Async,
            max_concurrent_nodes: 4,
            edge_capacity: 1_024,
            micro_batch: 64,
            retain_outputs: false,
            node_timeout_ms: None,
            monitoring: true,
            events: DispatchConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse a configuration from JSON; missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::setup(format!("invalid pipeline configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    /// Pipelined execution on the given backend
    pub fn pipelined(scheduler: SchedulerBackend) -> Self {
        Self {
            mode: ExecutionMode::Pipelined,
            scheduler,
            ..Self::default()
        }
    }

    /// Scheduler wait bound as a duration
    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_ms.map(Duration::from_millis)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_nodes == 0 {
            return Err(Error::setup("max_concurrent_nodes must be at least 1"));
        }
        if self.edge_capacity == 0 {
            return Err(Error::setup("edge_capacity must be at least 1"));
        }
        if self.micro_batch == 0 {
            return Err(Error::setup("micro_batch must be at least 1"));
        }
        self.events.validate()
    }
}

/// Final state of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    /// Consumed all input and closed its outputs normally
    Completed,
    /// Stopped on an aborting error
    Failed,
    /// Never finished because an upstream node failed
    SkippedUpstreamFailure,
    /// Stopped by the cancellation token
    Cancelled,
}

/// What a node produced
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput<T> {
    /// Realised output sequence
    Items(Vec<T>),
    /// Only the number of produced items
    Count(u64),
}

impl<T> NodeOutput<T> {
    /// Number of produced items
    pub fn len(&self) -> u64 {
        match self {
            NodeOutput::Items(items) => items.len() as u64,
            NodeOutput::Count(count) => *count,
        }
    }

    /// Whether nothing was produced
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Realised items, if they were kept
    pub fn items(&self) -> Option<&[T]> {
        match self {
            NodeOutput::Items(items) => Some(items),
            NodeOutput::Count(_) => None,
        }
    }
}

/// Timing and throughput of one node
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NodeTiming {
    /// Offset of the node's start from the pipeline start
    pub started_after: Duration,

    /// Time the node was running
    pub elapsed: Duration,

    /// Items consumed
    pub items_in: u64,

    /// Items produced
    pub items_out: u64,

    /// Items that failed for good
    pub items_failed: u64,
}

impl NodeTiming {
    /// Items consumed per second
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.items_in as f64 / secs
        } else {
            0.0
        }
    }
}

/// Outcome of one node
#[derive(Debug, Clone)]
pub struct NodeReport<T> {
    /// Node name
    pub name: String,

    /// Final state
    pub status: NodeStatus,

    /// Realised output or its size
    pub output: NodeOutput<T>,

    /// Timing summary
    pub timing: NodeTiming,

    /// Rendered error for failed, skipped or cancelled nodes
    pub error: Option<String>,
}

/// Result of one pipeline execution
#[derive(Debug, Clone)]
pub struct PipelineReport<T> {
    /// Pipeline name
    pub pipeline: String,

    /// Identifier of this run
    pub run_id: Uuid,

    /// Strategy used
    pub mode: ExecutionMode,

    /// Per-node outcome, keyed by node name
    pub nodes: BTreeMap<String, NodeReport<T>>,

    /// Total wall time
    pub elapsed: Duration,

    /// Event dispatch counters
    pub events: DispatchStats,
}

impl<T> PipelineReport<T> {
    /// Report of the named node
    pub fn node(&self, name: &str) -> Option<&NodeReport<T>> {
        self.nodes.get(name)
    }

    /// Status of the named node
    pub fn status(&self, name: &str) -> Option<NodeStatus> {
        self.nodes.get(name).map(|n| n.status)
    }

    /// Realised output of the named node, if kept
    pub fn output(&self, name: &str) -> Option<&[T]> {
        self.nodes.get(name).and_then(|n| n.output.items())
    }

    /// Whether every node completed
    pub fn is_success(&self) -> bool {
        self.nodes.values().all(|n| n.status == NodeStatus::Completed)
    }

    /// Names of nodes that did not complete
    pub fn unsuccessful(&self) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.status != NodeStatus::Completed)
            .map(|n| n.name.as_str())
            .collect()
    }
}
