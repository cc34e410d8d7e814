//! CPU-only backend
//!
//! Provides host-memory buffers that honor the exact transfer contracts of
//! the GPU backends, so the rest of the stack can run against a machine with
//! no usable GPU. FFT plans and kernels are deliberately unsupported here:
//! consumers receive the degradation signal and run their own host transform
//! path for the whole feature.

use std::any::Any;

use crate::backend::{
    ComputeBackend, ComputeKernel, DeviceBuffer, DeviceInfo, FftPlan, validate_fft_len,
};
use crate::error::{ComputeError, ComputeResult};

/// Host-memory compute backend
pub struct CpuBackend {
    info: DeviceInfo,
}

impl CpuBackend {
    /// Create the CPU backend (always succeeds)
    pub fn new() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self {
            info: DeviceInfo {
                name: "Host CPU".into(),
                vendor: "Generic".into(),
                backend: "cpu".into(),
                total_memory: 0,
                available_memory: 0,
                compute_units: threads,
                max_workgroup_size: 1,
            },
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn create_buffer(&self) -> Box<dyn DeviceBuffer> {
        Box::new(CpuBuffer { data: None })
    }

    fn create_fft_plan(&self, fft_len: usize, batch: usize) -> ComputeResult<Box<dyn FftPlan>> {
        validate_fft_len(fft_len, batch)?;
        Err(ComputeError::Unsupported(
            "cpu backend has no native FFT; use the host transform path".into(),
        ))
    }

    fn create_kernel(
        &self,
        _source: &str,
        entry_point: &str,
    ) -> ComputeResult<Box<dyn ComputeKernel>> {
        Err(ComputeError::Unsupported(format!(
            "cpu backend cannot compile device kernels (requested entry point '{entry_point}')"
        )))
    }

    fn synchronize(&self) -> ComputeResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) {
        log::debug!("cpu backend: shutdown");
    }
}

/// Host-memory buffer honoring the device transfer contracts
struct CpuBuffer {
    data: Option<Vec<u8>>,
}

impl DeviceBuffer for CpuBuffer {
    fn allocate(&mut self, size_bytes: usize) -> ComputeResult<()> {
        self.release();
        self.data = Some(vec![0u8; size_bytes]);
        Ok(())
    }

    fn upload(&mut self, data: &[u8]) -> ComputeResult<()> {
        let Some(storage) = self.data.as_mut() else {
            return Err(ComputeError::InvalidConfig(
                "upload to unallocated buffer".into(),
            ));
        };
        if data.len() > storage.len() {
            return Err(ComputeError::InvalidConfig(format!(
                "upload of {} bytes exceeds allocated size {}",
                data.len(),
                storage.len()
            )));
        }
        storage[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download(&self, data: &mut [u8]) -> ComputeResult<()> {
        let Some(storage) = self.data.as_ref() else {
            return Err(ComputeError::InvalidConfig(
                "download from unallocated buffer".into(),
            ));
        };
        if data.len() > storage.len() {
            return Err(ComputeError::InvalidConfig(format!(
                "download of {} bytes exceeds allocated size {}",
                data.len(),
                storage.len()
            )));
        }
        data.copy_from_slice(&storage[..data.len()]);
        Ok(())
    }

    fn size_bytes(&self) -> usize {
        self.data.as_ref().map(Vec::len).unwrap_or(0)
    }

    fn release(&mut self) {
        self.data = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_roundtrip() {
        let backend = CpuBackend::new();
        let mut buf = backend.create_buffer();
        buf.allocate(16).unwrap();
        assert_eq!(buf.size_bytes(), 16);

        let payload: Vec<u8> = (0..16).collect();
        buf.upload(&payload).unwrap();

        let mut readback = vec![0u8; 16];
        buf.download(&mut readback).unwrap();
        assert_eq!(readback, payload);
    }

    #[test]
    fn test_oversized_transfer_leaves_buffer_usable() {
        let backend = CpuBackend::new();
        let mut buf = backend.create_buffer();
        buf.allocate(8).unwrap();

        let too_big = vec![1u8; 12];
        assert!(buf.upload(&too_big).is_err());
        assert_eq!(buf.size_bytes(), 8);

        // Still usable for a valid transfer afterwards
        buf.upload(&[7u8; 8]).unwrap();
        let mut readback = vec![0u8; 8];
        buf.download(&mut readback).unwrap();
        assert_eq!(readback, [7u8; 8]);
    }

    #[test]
    fn test_double_release_never_faults() {
        let backend = CpuBackend::new();
        let mut buf = backend.create_buffer();
        buf.allocate(32).unwrap();
        buf.release();
        buf.release();
        assert_eq!(buf.size_bytes(), 0);
        assert!(buf.upload(&[0u8; 4]).is_err());
    }

    #[test]
    fn test_fft_and_kernel_are_degradation_signals() {
        let backend = CpuBackend::new();
        assert!(backend.create_fft_plan(2048, 1).unwrap_err().is_degradation());
        assert!(
            backend
                .create_kernel("kernel source", "main")
                .unwrap_err()
                .is_degradation()
        );
        // Invalid sizes are still configuration errors, not degradation
        assert!(!backend.create_fft_plan(777, 1).unwrap_err().is_degradation());
    }
}
