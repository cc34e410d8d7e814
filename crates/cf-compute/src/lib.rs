//! ClearForge compute layer - hardware abstraction for spectral processing
//!
//! A [`ComputeContext`] owns one compute backend for its lifetime: the wgpu
//! GPU backend when a device can be acquired, the host CPU backend otherwise.
//! Consumers hold the context by reference and talk to the device only
//! through the backend traits ([`ComputeBackend`], [`DeviceBuffer`],
//! [`FftPlan`], [`ComputeKernel`]), so the same algorithm code runs on every
//! backend and degrades to the host path when a capability is missing.

#![warn(missing_docs)]

pub mod backend;
pub mod context;
pub mod cpu_backend;
pub mod error;
pub mod wgpu_backend;

pub use backend::{
    ComputeBackend, ComputeKernel, DeviceBuffer, DeviceInfo, FftPlan, MAX_FFT_LEN, MIN_FFT_LEN,
};
pub use context::{ComputeContext, LifecycleState};
pub use cpu_backend::CpuBackend;
pub use error::{ComputeError, ComputeResult};
pub use wgpu_backend::WgpuBackend;
