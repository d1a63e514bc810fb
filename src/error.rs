//! Error taxonomy for endpoint reads
//!
//! Only two outcomes are reportable by the core: a run that could not be
//! allocated, and a reader that was interrupted while blocked. Everything else
//! is infallible by construction. `UnknownEndpoint` belongs to the endpoint
//! table, not to the collector or the selector.

use nix::errno::Errno;
use thiserror::Error;

/// Errors returned by endpoint reads
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JitError {
    /// A trace run could not be allocated; nothing was scheduled
    #[error("cannot allocate trace run: {0}")]
    ResourceExhausted(String),

    /// The reader was interrupted while blocked; retry the read
    #[error("interrupted by signal while waiting")]
    Interrupted,

    /// No endpoint is registered under this name
    #[error("unknown endpoint: {0}")]
    UnknownEndpoint(String),
}

impl JitError {
    /// The errno a virtual file read would report for this outcome
    ///
    /// # Example
    /// ```
    /// use jitprobe::error::JitError;
    /// use nix::errno::Errno;
    ///
    /// assert_eq!(JitError::Interrupted.errno(), Errno::EINTR);
    /// ```
    pub fn errno(&self) -> Errno {
        match self {
            JitError::ResourceExhausted(_) => Errno::ENOMEM,
            JitError::Interrupted => Errno::EINTR,
            JitError::UnknownEndpoint(_) => Errno::ENOENT,
        }
    }

    /// Whether the caller should simply issue the read again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JitError::Interrupted | JitError::ResourceExhausted(_)
        )
    }
}

impl From<std::collections::TryReserveError> for JitError {
    fn from(err: std::collections::TryReserveError) -> Self {
        JitError::ResourceExhausted(err.to_string())
    }
}

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, JitError>;
