//! File-backed sources for pipeinfer pipelines
//!
//! Every reader here implements [`pipeinfer_core::Source`] and opens its
//! file afresh on each pass, so a pipeline built on one can be executed
//! repeatedly. Reader errors convert into the core error type when a
//! stream is consumed by a pipeline.

#![warn(missing_docs)]

mod chunks;
mod directory;
mod error;
mod lines;

pub use chunks::ChunkSource;
pub use directory::DirectorySource;
pub use error::{Error, Result};
pub use lines::{LineOptions, LineSource};

// Re-export core types
pub use pipeinfer_core::{Source, SourceStream};
