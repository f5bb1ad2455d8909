use std::path::PathBuf;

/// Error taxonomy for the layer engine. Variant names mirror the abstract
/// kinds from the design doc; they are not meant to be matched against
/// string content.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} must not be empty")]
    InvalidArgument(&'static str),

    #[error("working directory {0:?} is not empty")]
    WorkingDirectoryNotEmpty(PathBuf),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("duplicate path under case-insensitive comparison: {0:?} and {1:?}")]
    DuplicatePath(String, String),

    #[error("archive is truncated or malformed: {0}")]
    CorruptArchive(String),

    #[error("cache I/O failed: {0}")]
    CacheIOError(#[source] std::io::Error),

    #[error("a layer step is already open for this session")]
    ConcurrentStep,

    #[error("step is not open")]
    AlreadyFinalized,

    #[error("session has been disposed")]
    SessionDisposed,

    #[error("layer step has been disposed")]
    StepDisposed,

    #[error("operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
