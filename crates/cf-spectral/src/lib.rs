//! ClearForge Spectral Engine
//!
//! Streaming spectral-subtraction noise reduction:
//!
//! ## Noise profile capture
//! - Per-bin magnitude floor averaged over a fixed frame quota
//! - Atomic capture request, picked up on the processing thread
//! - Frozen once captured, immutable until cleared
//!
//! ## Overlap-add STFT
//! - Periodic Hann analysis and synthesis windows, 75% overlap
//! - Unity long-term reconstruction gain at one frame of latency
//! - Bit-exact passthrough while idle, bypassed, or capturing
//!
//! ## Dual execution venue
//! - Frames run on the compute device when the bound [`ComputeContext`]
//!   serves FFT plans and kernels
//! - Any per-frame device fault re-runs the identical frame on the host,
//!   so output never depends on which venue succeeded
//!
//! [`ComputeContext`]: cf_compute::ComputeContext

#![warn(missing_docs)]

pub mod processor;
pub mod profile;
pub mod window;

mod error;

pub use error::{SpectralError, SpectralResult};
pub use processor::{EngineState, SpectralProcessor};
pub use profile::NoiseProfile;

use serde::{Deserialize, Serialize};

/// One-time stream configuration from the host pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Planar channel count
    pub channels: usize,
    /// Largest block the host will offer per call
    pub max_block: usize,
}

impl Default for StreamSpec {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            max_block: 2048,
        }
    }
}

/// Noise-reduction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiseParams {
    /// Reduction amount in dB, clamped to 0..=24 (0 = bypass)
    pub reduction_db: f32,
    /// FFT length, rounded to a power of two in the supported range
    pub fft_size: usize,
    /// Magnitude floor as a fraction of the input magnitude
    pub spectral_floor: f32,
    /// Frames averaged into a noise profile capture
    pub capture_frames: usize,
}

impl Default for DenoiseParams {
    fn default() -> Self {
        Self {
            reduction_db: 12.0,
            fft_size: 2048,
            spectral_floor: 0.02,
            capture_frames: 40,
        }
    }
}
