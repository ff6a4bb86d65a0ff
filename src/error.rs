//! Error types for amsgq.

use std::io;

/// Active-message queue operation errors.
#[derive(Debug)]
pub enum Error {
    /// A parameter was out of range or otherwise unusable.
    InvalidArg(&'static str),
    /// Transient back-pressure: the target's active sub-queue is full or
    /// being drained. Retry the operation or drain the local queue.
    Again,
    /// Unrecoverable failure in the RMA substrate.
    Rma(io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArg(what) => write!(f, "invalid argument: {}", what),
            Error::Again => write!(f, "target queue full or busy"),
            Error::Rma(e) => write!(f, "RMA error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Rma(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Rma(e)
    }
}

/// Result type for amsgq operations.
pub type Result<T> = std::result::Result<T, Error>;
