//! Error types shared by every component.
//!
//! Every public operation returns [`Result`]. Expected failure conditions
//! (dimension mismatches, untrained codecs, duplicate ids) are always reported
//! as a [`VdbError`], never as a panic.

use crate::VectorId;
use std::io;
use thiserror::Error;

/// Central error enum for the engine.
#[derive(Error, Debug)]
pub enum VdbError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("quantizer is not trained")]
    NotTrained,

    #[error("empty input: {0}")]
    EmptyInput(String),

    #[error("id {0} already exists")]
    DuplicateId(VectorId),

    #[error("id {0} not found")]
    NotFound(VectorId),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid code length: expected {expected} bytes, got {actual}")]
    InvalidCode { expected: usize, actual: usize },

    #[error("corrupted snapshot: {0}")]
    Corrupted(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("task pool is shut down")]
    PoolShutdown,

    #[error("task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fieldless error category, for callers that branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DimensionMismatch,
    NotTrained,
    EmptyInput,
    DuplicateId,
    NotFound,
    UnsupportedOperation,
    InvalidConfig,
    InvalidCode,
    Corrupted,
    Serialization,
    PoolShutdown,
    TaskFailed,
    Io,
}

impl VdbError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            VdbError::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            VdbError::NotTrained => ErrorKind::NotTrained,
            VdbError::EmptyInput(_) => ErrorKind::EmptyInput,
            VdbError::DuplicateId(_) => ErrorKind::DuplicateId,
            VdbError::NotFound(_) => ErrorKind::NotFound,
            VdbError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            VdbError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            VdbError::InvalidCode { .. } => ErrorKind::InvalidCode,
            VdbError::Corrupted(_) => ErrorKind::Corrupted,
            VdbError::Serialization(_) => ErrorKind::Serialization,
            VdbError::PoolShutdown => ErrorKind::PoolShutdown,
            VdbError::TaskFailed(_) => ErrorKind::TaskFailed,
            VdbError::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for a [`VdbError::DimensionMismatch`] check.
    pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(VdbError::DimensionMismatch { expected, actual })
        }
    }
}

impl From<bincode::Error> for VdbError {
    fn from(e: bincode::Error) -> Self {
        VdbError::Serialization(e.to_string())
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VdbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_dimension() {
        assert!(VdbError::check_dimension(4, 4).is_ok());
        let err = VdbError::check_dimension(4, 3).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DimensionMismatch);
        assert_eq!(err.to_string(), "dimension mismatch: expected 4, got 3");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: VdbError = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
