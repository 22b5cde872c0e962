//! Error types for pipeinfer pipelines

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pipeline operations
#[derive(Error, Debug)]
pub enum Error {
    /// One input item failed inside a transform or predicate
    #[error("item {index} failed in `{operator}` after {attempts} attempt(s): {message}")]
    ItemProcessing {
        /// Operator that owned the failing item
        operator: String,

        /// Position of the item in the operator's input
        index: u64,

        /// Rendered error raised by the user function
        message: String,

        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// Bad configuration or graph shape, detected before work starts
    #[error("Operator setup error: {0}")]
    OperatorSetup(String),

    /// A worker pool failed to start or a worker died unexpectedly
    #[error("Executor resource error: {0}")]
    ExecutorResource(String),

    /// A suspension point exceeded its configured bound
    #[error("Timed out after {waited:?} waiting on {point}")]
    Timeout {
        /// Where the wait happened
        point: String,

        /// How long was waited
        waited: Duration,

        /// Whether the wait happened while tearing down
        during_shutdown: bool,
    },

    /// A listener raised while handling an event
    #[error("Listener error: {0}")]
    Listener(String),

    /// Execution was cancelled through a cancellation token
    #[error("Execution cancelled")]
    Cancelled,

    /// An upstream node failed, so this node never ran to completion
    #[error("Upstream node `{0}` failed")]
    UpstreamFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error on a process boundary
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Coarse classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::ItemProcessing`]
    ItemProcessing,
    /// See [`Error::OperatorSetup`]
    OperatorSetup,
    /// See [`Error::ExecutorResource`]
    ExecutorResource,
    /// See [`Error::Timeout`]
    Timeout,
    /// See [`Error::Listener`]
    Listener,
    /// See [`Error::Cancelled`]
    Cancelled,
    /// See [`Error::UpstreamFailed`]
    UpstreamFailed,
    /// IO and serialization failures
    Io,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ItemProcessing { .. } => ErrorKind::ItemProcessing,
            Error::OperatorSetup(_) => ErrorKind::OperatorSetup,
            Error::ExecutorResource(_) => ErrorKind::ExecutorResource,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Listener(_) => ErrorKind::Listener,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::UpstreamFailed(_) => ErrorKind::UpstreamFailed,
            Error::Io(_) | Error::Serialization(_) => ErrorKind::Io,
        }
    }

    /// Whether this error must be surfaced to the caller of `execute`
    /// instead of being recorded as a node failure.
    ///
    /// A resource error ends its own executor's stream and fails that node
    /// only. A timeout only counts as fatal while shutting down; otherwise
    /// it is handled like a failed item.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::OperatorSetup(_) => true,
            Error::Timeout { during_shutdown, .. } => *during_shutdown,
            _ => false,
        }
    }

    /// Shorthand for an [`Error::OperatorSetup`]
    pub fn setup(message: impl Into<String>) -> Self {
        Error::OperatorSetup(message.into())
    }

    /// Shorthand for an [`Error::ExecutorResource`]
    pub fn resource(message: impl Into<String>) -> Self {
        Error::ExecutorResource(message.into())
    }

    /// Shorthand for a timeout outside of shutdown
    pub fn timeout(point: impl Into<String>, waited: Duration) -> Self {
        Error::Timeout {
            point: point.into(),
            waited,
            during_shutdown: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::setup("cycle").is_fatal());
        assert!(!Error::resource("worker died").is_fatal());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::timeout("edge", Duration::from_millis(5)).is_fatal());

        let shutdown = Error::Timeout {
            point: "dispatcher flush".into(),
            waited: Duration::from_secs(1),
            during_shutdown: true,
        };
        assert!(shutdown.is_fatal());
        assert_eq!(shutdown.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_item_error_message() {
        let err = Error::ItemProcessing {
            operator: "double".into(),
            index: 3,
            message: "boom".into(),
            attempts: 2,
        };
        assert_eq!(err.kind(), ErrorKind::ItemProcessing);
        assert_eq!(
            err.to_string(),
            "item 3 failed in `double` after 2 attempt(s): boom"
        );
    }
}
