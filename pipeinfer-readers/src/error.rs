//! Error types for file-backed sources

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Error type for readers
#[derive(Error, Debug)]
pub enum Error {
    /// The path does not exist
    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A reader was configured with an unusable value
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Core library error
    #[error("Core error: {0}")]
    Core(#[from] pipeinfer_core::Error),
}

/// Result type for readers
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attribute an I/O failure to `path`, keeping not-found distinct
    pub(crate) fn at(path: &Path, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            Error::NotFound(path.to_path_buf())
        } else {
            Error::Io(err)
        }
    }
}

impl From<Error> for pipeinfer_core::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(path) => pipeinfer_core::Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not found", path.display()),
            )),
            Error::Io(err) => pipeinfer_core::Error::Io(err),
            Error::InvalidArgument(message) => pipeinfer_core::Error::OperatorSetup(message),
            Error::Core(err) => err,
        }
    }
}
