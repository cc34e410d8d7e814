//! Error types for the spectral engine

use thiserror::Error;

/// Spectral engine error types
#[derive(Error, Debug, Clone)]
pub enum SpectralError {
    /// Invalid parameter or stream configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Block channel count differs from the prepared stream
    #[error("channel count mismatch: prepared {prepared}, got {got}")]
    ChannelMismatch {
        /// Channels the stream was prepared with
        prepared: usize,
        /// Channels in the offered block
        got: usize,
    },

    /// Operation requires a prepared stream
    #[error("processor is not prepared")]
    NotPrepared,
}

/// Result type for spectral operations
pub type SpectralResult<T> = Result<T, SpectralError>;
