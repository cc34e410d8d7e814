//! Error types for the compute layer

use thiserror::Error;

/// Compute layer error types
#[derive(Error, Debug, Clone)]
pub enum ComputeError {
    /// No compute device could be acquired; callers run on the CPU for the
    /// lifetime of the context
    #[error("no compute device available: {0}")]
    Unavailable(String),

    /// A single device operation failed; the backend remains usable
    #[error("device operation failed: {0}")]
    Device(String),

    /// Invalid size, argument index, or transfer request; rejected without
    /// side effects
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Kernel source failed to compile
    #[error("kernel compilation failed: {0}")]
    Compilation(String),

    /// The active backend cannot perform this operation natively; callers
    /// should use their host implementation for the whole feature
    #[error("unsupported on this backend: {0}")]
    Unsupported(String),
}

impl ComputeError {
    /// True for the expected degradation signal (a backend that simply lacks
    /// the capability) as opposed to an actual fault.
    pub fn is_degradation(&self) -> bool {
        matches!(self, ComputeError::Unsupported(_))
    }
}

/// Result type for compute operations
pub type ComputeResult<T> = Result<T, ComputeError>;
