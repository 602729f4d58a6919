//! Error types for the ovfexport core library.

use std::path::PathBuf;

/// Failures raised by the transfer channel and the disk copy engine.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Every candidate destination name for a disk is already taken.
    #[error("no free image name for '{filename}' in '{}'", dir.display())]
    Collision { filename: String, dir: PathBuf },

    /// The transfer session could not be opened or the stream broke.
    #[error("transfer channel failure for disk {disk}: {message}")]
    ChannelFailure { disk: String, message: String },

    /// Re-reading the written image did not reproduce the source content.
    #[error("verification failed for '{filename}': {message}")]
    VerifyMismatch { filename: String, message: String },

    /// The transfer was cancelled cooperatively.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Create a channel failure for the given disk.
    pub fn channel(disk: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ChannelFailure {
            disk: disk.into(),
            message: message.into(),
        }
    }

    /// Create a verification mismatch for the given image file.
    pub fn verify(filename: impl Into<String>, message: impl Into<String>) -> Self {
        Self::VerifyMismatch {
            filename: filename.into(),
            message: message.into(),
        }
    }
}

/// The main error type for export operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A VM identifier matched neither a uuid nor a name.
    #[error("VM not found: '{identifier}'")]
    NotFound { identifier: String },

    /// The VM is not in a power state that allows export.
    #[error("VM '{vm}' must be halted or suspended to export (current state: {state})")]
    InvalidState { vm: String, state: String },

    /// A disk transfer failed.
    #[error(transparent)]
    Transfer(TransferError),

    /// The export was cancelled.
    #[error("export cancelled")]
    Cancelled,

    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Error reading or writing an image container.
    #[error("image error: {message}")]
    Image { message: String },

    /// Error building or serialising the package metadata.
    #[error("package error: {message}")]
    Package { message: String },

    /// Invalid configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Error in the compression pipeline.
    #[error("pipeline error: {message}")]
    Pipeline { message: String },

    /// The remote model could not answer a query.
    #[error("backend error: {message}")]
    Backend { message: String },
}

/// A specialized Result type for export operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`] for presentation layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidState,
    TransferFailed,
    Cancelled,
    IoFailure,
    Other,
}

impl Error {
    /// Create a not-found error for a VM identifier.
    pub fn not_found(identifier: impl Into<String>) -> Self {
        Self::NotFound {
            identifier: identifier.into(),
        }
    }

    /// Create an invalid power state error.
    pub fn invalid_state(vm: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            vm: vm.into(),
            state: state.to_string(),
        }
    }

    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an image container error.
    pub fn image(message: impl Into<String>) -> Self {
        Self::Image {
            message: message.into(),
        }
    }

    /// Create a package metadata error.
    pub fn package(message: impl Into<String>) -> Self {
        Self::Package {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a pipeline error.
    pub fn pipeline(message: impl Into<String>) -> Self {
        Self::Pipeline {
            message: message.into(),
        }
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Whether this error is the cooperative-cancellation outcome.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::InvalidState { .. } => ErrorKind::InvalidState,
            Error::Transfer(_) | Error::Image { .. } => ErrorKind::TransferFailed,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io { .. } => ErrorKind::IoFailure,
            Error::Package { .. }
            | Error::Config { .. }
            | Error::Pipeline { .. }
            | Error::Backend { .. } => ErrorKind::Other,
        }
    }
}

impl From<TransferError> for Error {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => Error::Cancelled,
            other => Error::Transfer(other),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
