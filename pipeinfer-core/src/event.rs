//! Typed event records emitted while a pipeline runs

use std::time::{Duration, SystemTime};

use serde::Serialize;

use crate::transform::ItemFailure;

/// An immutable record of something that happened in an operator
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Operator that emitted the event
    pub operator: String,

    /// Wall-clock time of emission
    pub timestamp: SystemTime,

    /// What happened
    pub kind: EventKind,
}

/// The payload of an [`Event`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    /// The operator started pulling input
    OperatorStart,

    /// The operator exhausted its input
    OperatorComplete {
        /// Time between start and completion
        duration: Duration,

        /// Items consumed
        items_in: u64,

        /// Items produced
        items_out: u64,
    },

    /// Periodic progress report
    Progress {
        /// Items processed so far
        processed: u64,

        /// Expected total, when known
        total_estimate: Option<u64>,
    },

    /// One item failed
    Error {
        /// Rendered error
        error: String,

        /// The failing item
        item_context: ItemContext,
    },

    /// Resource usage attributed to the operator
    Performance {
        /// Process CPU usage, normalised to all cores (0-100)
        cpu_percent: f32,

        /// Resident memory of the process in bytes
        memory_bytes: u64,

        /// Items per second over the session
        throughput: f64,

        /// Items recorded in the session
        items: u64,

        /// Session length
        duration: Duration,
    },

    /// A pipelined executor dispatched a batch
    BatchStart {
        /// Batch sequence number within the call
        batch: u64,

        /// Items in the batch
        size: usize,
    },

    /// A pipelined executor finished computing a batch
    BatchComplete {
        /// Batch sequence number within the call
        batch: u64,

        /// Items in the batch
        size: usize,

        /// Time from dispatch to completion
        duration: Duration,
    },
}

/// Position and rendering of a failed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemContext {
    /// Position in the operator's input
    pub index: u64,

    /// Truncated `Debug` rendering
    pub item: String,
}

impl Event {
    /// Build an event stamped with the current time
    pub fn new(operator: impl Into<String>, kind: EventKind) -> Self {
        Self {
            operator: operator.into(),
            timestamp: SystemTime::now(),
            kind,
        }
    }

    /// `OperatorStart` for `operator`
    pub fn operator_start(operator: impl Into<String>) -> Self {
        Self::new(operator, EventKind::OperatorStart)
    }

    /// `OperatorComplete` for `operator`
    pub fn operator_complete(
        operator: impl Into<String>,
        duration: Duration,
        items_in: u64,
        items_out: u64,
    ) -> Self {
        Self::new(
            operator,
            EventKind::OperatorComplete {
                duration,
                items_in,
                items_out,
            },
        )
    }

    /// `Progress` for `operator`.
    ///
    /// An estimate below the processed count is meaningless and is dropped.
    pub fn progress(
        operator: impl Into<String>,
        processed: u64,
        total_estimate: Option<u64>,
    ) -> Self {
        let total_estimate = total_estimate.filter(|total| processed <= *total);
        Self::new(
            operator,
            EventKind::Progress {
                processed,
                total_estimate,
            },
        )
    }

    /// `Error` for a failed item
    pub fn item_error(operator: impl Into<String>, failure: &ItemFailure) -> Self {
        Self::new(
            operator,
            EventKind::Error {
                error: failure.message.clone(),
                item_context: ItemContext {
                    index: failure.index,
                    item: failure.context.clone(),
                },
            },
        )
    }

    /// `BatchStart` for a pipelined batch
    pub fn batch_start(operator: impl Into<String>, batch: u64, size: usize) -> Self {
        Self::new(operator, EventKind::BatchStart { batch, size })
    }

    /// `BatchComplete` for a pipelined batch
    pub fn batch_complete(
        operator: impl Into<String>,
        batch: u64,
        size: usize,
        duration: Duration,
    ) -> Self {
        Self::new(
            operator,
            EventKind::BatchComplete {
                batch,
                size,
                duration,
            },
        )
    }

    /// Short name of the event kind
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            EventKind::OperatorStart => "operator_start",
            EventKind::OperatorComplete { .. } => "operator_complete",
            EventKind::Progress { .. } => "progress",
            EventKind::Error { .. } => "error",
            EventKind::Performance { .. } => "performance",
            EventKind::BatchStart { .. } => "batch_start",
            EventKind::BatchComplete { .. } => "batch_complete",
        }
    }

    /// Whether this is a progress report
    pub fn is_progress(&self) -> bool {
        matches!(self.kind, EventKind::Progress { .. })
    }

    /// Completion ratio of a progress event with a known, non-zero estimate
    pub fn progress_ratio(&self) -> Option<f64> {
        match self.kind {
            EventKind::Progress {
                processed,
                total_estimate: Some(total),
            } if total > 0 => Some(processed as f64 / total as f64),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_validates_range() {
        let event = Event::progress("tiles", 5, Some(10));
        assert_eq!(event.progress_ratio(), Some(0.5));

        let event = Event::progress("tiles", 11, Some(10));
        assert_eq!(
            event.kind,
            EventKind::Progress {
                processed: 11,
                total_estimate: None
            }
        );
        assert_eq!(event.progress_ratio(), None);
    }

    #[test]
    fn test_item_error_carries_context() {
        let failure = ItemFailure {
            index: 4,
            message: "decode failed".into(),
            attempts: 1,
            context: "\"tile-4\"".into(),
            timed_out: false,
        };
        let event = Event::item_error("decode", &failure);
        assert_eq!(event.kind_name(), "error");
        match event.kind {
            EventKind::Error { error, item_context } => {
                assert_eq!(error, "decode failed");
                assert_eq!(item_context.index, 4);
                assert_eq!(item_context.item, "\"tile-4\"");
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn test_event_serializes() {
        let event = Event::operator_complete("sink", Duration::from_millis(20), 3, 0);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["operator"], "sink");
        assert_eq!(json["kind"]["OperatorComplete"]["items_in"], 3);
    }
}
