//! Backend abstraction - device, buffer, FFT plan, and kernel traits
//!
//! The spectral algorithms are written exactly once against these traits;
//! each compute runtime (wgpu, CPU) provides one implementation. Backend
//! selection happens once at context initialization and is fixed for the
//! context lifetime.

use std::any::Any;

use serde::{Deserialize, Serialize};

use crate::error::ComputeResult;

/// Supported FFT length range (power of two)
pub const MIN_FFT_LEN: usize = 1024;
/// Supported FFT length range (power of two)
pub const MAX_FFT_LEN: usize = 32768;

/// Device descriptor snapshot
///
/// Populated best-effort at initialization. Fields a runtime cannot report
/// (wgpu exposes no memory totals) hold the closest available figure and are
/// documented on the backend that fills them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device name as reported by the runtime
    pub name: String,
    /// Vendor name
    pub vendor: String,
    /// Backend identity ("wgpu/vulkan", "cpu", ...)
    pub backend: String,
    /// Total device memory in bytes (0 if unknown)
    pub total_memory: u64,
    /// Available device memory in bytes (0 if unknown)
    pub available_memory: u64,
    /// Compute unit count (0 if unknown)
    pub compute_units: u32,
    /// Maximum work items per group
    pub max_workgroup_size: u32,
}

impl DeviceInfo {
    /// One-line diagnostic string for logs and UI
    pub fn summary(&self) -> String {
        format!("{} ({})", self.name, self.backend)
    }
}

/// Exclusively owned block of device memory with blocking host transfers.
///
/// A buffer must be released exactly once; `release` is idempotent and all
/// implementations also release on drop, so no exit path leaks.
pub trait DeviceBuffer: Send {
    /// Allocate `size_bytes` of device memory, releasing any prior allocation
    /// first. On failure the buffer is left unallocated.
    fn allocate(&mut self, size_bytes: usize) -> ComputeResult<()>;

    /// Blocking host-to-device copy. Rejected without side effects when the
    /// buffer is unallocated or `data.len()` exceeds the allocated size.
    fn upload(&mut self, data: &[u8]) -> ComputeResult<()>;

    /// Blocking device-to-host copy, same size contract as [`upload`].
    ///
    /// [`upload`]: DeviceBuffer::upload
    fn download(&self, data: &mut [u8]) -> ComputeResult<()>;

    /// Currently allocated size in bytes (0 when unallocated)
    fn size_bytes(&self) -> usize;

    /// Free the device memory and reset the size to zero. Idempotent.
    fn release(&mut self);

    /// Backend-internal downcast hook
    fn as_any(&self) -> &dyn Any;
}

/// Sized forward/inverse real-transform descriptor bound to one backend.
///
/// Forward transforms `fft_len` reals into `fft_len/2 + 1` interleaved
/// complex values per batch row; the inverse is the unnormalized adjoint
/// (callers scale by `1/fft_len`), matching cuFFT and realfft conventions.
pub trait FftPlan: Send {
    /// Transform length
    fn fft_len(&self) -> usize;

    /// Number of independent rows transformed per execute
    fn batch(&self) -> usize;

    /// Run the real-to-complex transform on already-populated device buffers
    fn execute_forward(
        &mut self,
        input: &dyn DeviceBuffer,
        output: &dyn DeviceBuffer,
    ) -> ComputeResult<()>;

    /// Run the complex-to-real transform on already-populated device buffers
    fn execute_inverse(
        &mut self,
        input: &dyn DeviceBuffer,
        output: &dyn DeviceBuffer,
    ) -> ComputeResult<()>;

    /// Free the plan. Idempotent.
    fn release(&mut self);
}

impl std::fmt::Debug for dyn FftPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftPlan")
            .field("fft_len", &self.fft_len())
            .field("batch", &self.batch())
            .finish()
    }
}

/// Compiled on-device program with positional argument binding.
///
/// Arguments bind by index in declaration order; scalar binds are pure binds,
/// nothing launches until [`execute`].
///
/// [`execute`]: ComputeKernel::execute
pub trait ComputeKernel: Send {
    /// Bind a device buffer at the given argument index
    fn set_buffer_arg(&mut self, index: u32, buffer: &dyn DeviceBuffer) -> ComputeResult<()>;

    /// Bind an `f32` scalar at the given argument index
    fn set_f32_arg(&mut self, index: u32, value: f32) -> ComputeResult<()>;

    /// Bind a `u32` scalar at the given argument index
    fn set_u32_arg(&mut self, index: u32, value: u32) -> ComputeResult<()>;

    /// Dispatch the kernel over `total_work_items`, grouped by
    /// `work_items_per_group`, and wait for completion.
    fn execute(&mut self, total_work_items: u32, work_items_per_group: u32) -> ComputeResult<()>;

    /// Free the compiled program and kernel handles. Idempotent.
    fn release(&mut self);
}

impl std::fmt::Debug for dyn ComputeKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeKernel").finish_non_exhaustive()
    }
}

/// One compute runtime: device lifecycle plus factories for buffers, FFT
/// plans, and kernels.
pub trait ComputeBackend: Send {
    /// Short backend identity used in diagnostics ("wgpu", "cpu")
    fn name(&self) -> &'static str;

    /// Last-known device descriptor
    fn device_info(&self) -> DeviceInfo;

    /// Create an unallocated device buffer
    fn create_buffer(&self) -> Box<dyn DeviceBuffer>;

    /// Build a transform descriptor for `(fft_len, batch)`.
    ///
    /// Returns [`ComputeError::Unsupported`] when this backend cannot perform
    /// FFTs natively - an expected degradation signal, not a fault; the
    /// caller must use its host transform path for the whole feature.
    ///
    /// [`ComputeError::Unsupported`]: crate::ComputeError::Unsupported
    fn create_fft_plan(&self, fft_len: usize, batch: usize) -> ComputeResult<Box<dyn FftPlan>>;

    /// Compile a program and resolve its entry point
    fn create_kernel(&self, source: &str, entry_point: &str)
    -> ComputeResult<Box<dyn ComputeKernel>>;

    /// Block until all previously submitted work completes
    fn synchronize(&self) -> ComputeResult<()>;

    /// Release the device and queue. Idempotent.
    fn shutdown(&mut self);
}

/// Validate an FFT length against the supported range.
pub(crate) fn validate_fft_len(fft_len: usize, batch: usize) -> ComputeResult<()> {
    if !fft_len.is_power_of_two() || !(MIN_FFT_LEN..=MAX_FFT_LEN).contains(&fft_len) {
        return Err(crate::ComputeError::InvalidConfig(format!(
            "fft length {fft_len} must be a power of two in [{MIN_FFT_LEN}, {MAX_FFT_LEN}]"
        )));
    }
    if batch == 0 {
        return Err(crate::ComputeError::InvalidConfig(
            "batch count must be at least 1".into(),
        ));
    }
    Ok(())
}
