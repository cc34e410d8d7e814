//! Explicitly-owned compute context
//!
//! One context is created by the owning audio engine and shared by reference
//! with every consumer. It replaces process-wide backend globals: lifecycle,
//! backend selection, and the last-error diagnostic all live here, so
//! isolated multi-instance testing needs no process state.

use parking_lot::Mutex;

use crate::backend::{ComputeBackend, ComputeKernel, DeviceBuffer, DeviceInfo, FftPlan};
use crate::cpu_backend::CpuBackend;
use crate::error::{ComputeError, ComputeResult};
use crate::wgpu_backend::WgpuBackend;

/// Context lifecycle states
///
/// `Uninitialized -> Initializing -> {Ready, Failed}` and
/// `Ready -> ShuttingDown -> Uninitialized`. Operations on a non-Ready
/// context fail without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No device acquired
    Uninitialized,
    /// Probe in progress
    Initializing,
    /// Device acquired, operations accepted
    Ready,
    /// Probe failed; callers run CPU-only until re-initialization
    Failed,
    /// Release in progress
    ShuttingDown,
}

struct ContextInner {
    state: LifecycleState,
    backend: Option<Box<dyn ComputeBackend>>,
    info: DeviceInfo,
    last_error: String,
}

/// Owned compute capability provider
///
/// Backend choice is made once in [`initialize`] (wgpu first, then CPU) and
/// is fixed for the context lifetime. Initialization failure is never fatal:
/// the context lands in [`LifecycleState::Failed`] and callers fall back to
/// their host implementation.
///
/// [`initialize`]: ComputeContext::initialize
pub struct ComputeContext {
    inner: Mutex<ContextInner>,
}

impl ComputeContext {
    /// Create an uninitialized context
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ContextInner {
                state: LifecycleState::Uninitialized,
                backend: None,
                info: DeviceInfo::default(),
                last_error: String::new(),
            }),
        }
    }

    /// Create a context that is immediately Ready on the given backend.
    ///
    /// Used for isolated testing and fault injection; production callers use
    /// [`initialize`].
    ///
    /// [`initialize`]: ComputeContext::initialize
    pub fn with_backend(backend: Box<dyn ComputeBackend>) -> Self {
        let info = backend.device_info();
        log::debug!("compute context created on injected backend: {}", info.summary());
        Self {
            inner: Mutex::new(ContextInner {
                state: LifecycleState::Ready,
                backend: Some(backend),
                info,
                last_error: String::new(),
            }),
        }
    }

    /// Acquire a compute device, probing backends in priority order.
    ///
    /// Idempotent: returns true immediately when already Ready. Never
    /// panics; a failed probe records a diagnostic and leaves the context
    /// in `Failed`.
    pub fn initialize(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == LifecycleState::Ready {
            return true;
        }

        inner.state = LifecycleState::Initializing;
        log::info!("compute context: initializing");

        // Priority order: wgpu GPU first, host CPU second.
        let backend: Box<dyn ComputeBackend> = match WgpuBackend::acquire() {
            Ok(gpu) => Box::new(gpu),
            Err(err) => {
                log::info!("compute context: no GPU backend ({err}), using CPU backend");
                inner.last_error = err.to_string();
                Box::new(CpuBackend::new())
            }
        };

        inner.info = backend.device_info();
        log::info!("compute context: ready on {}", inner.info.summary());
        inner.backend = Some(backend);
        inner.state = LifecycleState::Ready;
        true
    }

    /// Release the device and queue. Idempotent; safe on any state.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        if inner.state != LifecycleState::Ready {
            inner.state = LifecycleState::Uninitialized;
            return;
        }
        inner.state = LifecycleState::ShuttingDown;
        if let Some(mut backend) = inner.backend.take() {
            backend.shutdown();
        }
        inner.state = LifecycleState::Uninitialized;
        log::info!("compute context: shutdown");
    }

    /// Pure availability query
    pub fn is_available(&self) -> bool {
        self.inner.lock().state == LifecycleState::Ready
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }

    /// Last-known device descriptor snapshot (valid even after failure)
    pub fn device_info(&self) -> DeviceInfo {
        self.inner.lock().info.clone()
    }

    /// Short backend identity, empty before initialization
    pub fn backend_name(&self) -> String {
        let inner = self.inner.lock();
        inner
            .backend
            .as_ref()
            .map(|b| b.name().to_string())
            .unwrap_or_default()
    }

    /// Human-readable diagnostic of the most recent failure
    pub fn last_error(&self) -> String {
        self.inner.lock().last_error.clone()
    }

    /// Block until all previously submitted device work completes
    pub fn synchronize(&self) -> ComputeResult<()> {
        let mut inner = self.inner.lock();
        match ready_backend(&inner)?.synchronize() {
            Ok(()) => Ok(()),
            Err(err) => {
                inner.last_error = err.to_string();
                Err(err)
            }
        }
    }

    /// Create an unallocated device buffer
    pub fn create_buffer(&self) -> ComputeResult<Box<dyn DeviceBuffer>> {
        let inner = self.inner.lock();
        Ok(ready_backend(&inner)?.create_buffer())
    }

    /// Build an FFT plan for `(fft_len, batch)`
    pub fn create_fft_plan(&self, fft_len: usize, batch: usize) -> ComputeResult<Box<dyn FftPlan>> {
        let mut inner = self.inner.lock();
        match ready_backend(&inner)?.create_fft_plan(fft_len, batch) {
            Ok(plan) => Ok(plan),
            Err(err) => {
                if !err.is_degradation() {
                    inner.last_error = err.to_string();
                }
                Err(err)
            }
        }
    }

    /// Compile a kernel and resolve its entry point
    pub fn create_kernel(
        &self,
        source: &str,
        entry_point: &str,
    ) -> ComputeResult<Box<dyn ComputeKernel>> {
        let mut inner = self.inner.lock();
        match ready_backend(&inner)?.create_kernel(source, entry_point) {
            Ok(kernel) => Ok(kernel),
            Err(err) => {
                if !err.is_degradation() {
                    inner.last_error = err.to_string();
                }
                Err(err)
            }
        }
    }
}

impl Default for ComputeContext {
    fn default() -> Self {
        Self::new()
    }
}

fn ready_backend(inner: &ContextInner) -> ComputeResult<&dyn ComputeBackend> {
    match (&inner.state, &inner.backend) {
        (LifecycleState::Ready, Some(backend)) => Ok(backend.as_ref()),
        _ => {
            log::debug!("compute context: operation rejected, context not ready");
            Err(ComputeError::Unavailable(
                "compute context is not initialized".into(),
            ))
        }
    }
}
