//! Streaming spectral-subtraction processor
//!
//! Overlap-add STFT engine with a captured noise profile. Frames run on the
//! compute context's device when it can serve FFT plans and kernels; any
//! per-frame device fault re-runs the identical frame through the host
//! implementation, so output never depends on which venue succeeded.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use cf_compute::{
    ComputeContext, ComputeKernel, ComputeResult, DeviceBuffer, FftPlan, MAX_FFT_LEN, MIN_FFT_LEN,
};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

use crate::error::{SpectralError, SpectralResult};
use crate::profile::NoiseProfile;
use crate::window::{OVERLAP_GAIN, periodic_hann};
use crate::{DenoiseParams, StreamSpec};

const SUBTRACT_SHADER: &str = include_str!("shaders/spectral_subtract.wgsl");
const SUBTRACT_ENTRY: &str = "subtract_spectrum";
const KERNEL_GROUP_SIZE: u32 = 256;

/// Engine state, driven by profile capture and the reduction amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Prepared, no noise profile; bit-exact passthrough
    Idle,
    /// Averaging capture frames; signal passes through untouched
    CapturingProfile,
    /// Profile held but reduction is zero; bit-exact passthrough
    Bypassed,
    /// Subtracting the captured profile from every frame
    Active,
}

/// Per-channel streaming state
struct ChannelState {
    /// Input accumulation; frames fire when it reaches the FFT length
    fifo: Vec<f32>,
    /// Overlap-add accumulator, one FFT length
    ola: Vec<f32>,
    /// Reconstructed samples ready to emit
    pending: VecDeque<f32>,
}

impl ChannelState {
    fn new(fft_size: usize, hop: usize) -> Self {
        let mut state = Self {
            fifo: Vec::with_capacity(fft_size),
            ola: vec![0.0; fft_size],
            pending: VecDeque::with_capacity(fft_size),
        };
        state.reset(fft_size, hop);
        state
    }

    /// Prefill so reconstruction is at unity gain from the very first input
    /// sample, at a fixed latency of one full FFT frame.
    fn reset(&mut self, fft_size: usize, hop: usize) {
        self.fifo.clear();
        self.fifo.resize(fft_size - hop, 0.0);
        self.ola.fill(0.0);
        self.pending.clear();
        self.pending.extend(std::iter::repeat_n(0.0, hop));
    }
}

/// Device objects for one session, created at prepare time only
struct GpuSession {
    plan: Box<dyn FftPlan>,
    kernel: Box<dyn ComputeKernel>,
    time_buf: Box<dyn DeviceBuffer>,
    spec_buf: Box<dyn DeviceBuffer>,
    profile_buf: Box<dyn DeviceBuffer>,
    bins: usize,
    /// Cleared when the profile freezes; the upload retries per frame until
    /// it lands.
    profile_uploaded: bool,
}

impl GpuSession {
    fn create(ctx: &ComputeContext, fft_size: usize) -> Option<Self> {
        if !ctx.is_available() {
            return None;
        }
        let bins = fft_size / 2 + 1;
        match Self::try_create(ctx, fft_size, bins) {
            Ok(session) => {
                log::info!(
                    "spectral engine: device path ready on {} (fft {fft_size})",
                    ctx.device_info().summary()
                );
                Some(session)
            }
            Err(err) => {
                if err.is_degradation() {
                    log::info!("spectral engine: device path unavailable ({err}), running on host");
                } else {
                    log::warn!("spectral engine: device setup failed ({err}), running on host");
                }
                None
            }
        }
    }

    fn try_create(ctx: &ComputeContext, fft_size: usize, bins: usize) -> ComputeResult<Self> {
        let plan = ctx.create_fft_plan(fft_size, 1)?;
        let mut kernel = ctx.create_kernel(SUBTRACT_SHADER, SUBTRACT_ENTRY)?;

        let mut time_buf = ctx.create_buffer()?;
        time_buf.allocate(fft_size * 4)?;
        let mut spec_buf = ctx.create_buffer()?;
        spec_buf.allocate(bins * 8)?;
        let mut profile_buf = ctx.create_buffer()?;
        profile_buf.allocate(bins * 4)?;

        // Buffers and the fixed scalars bind once; only the gain rebinds
        // per frame.
        kernel.set_buffer_arg(0, spec_buf.as_ref())?;
        kernel.set_buffer_arg(1, profile_buf.as_ref())?;
        kernel.set_u32_arg(4, bins as u32)?;

        Ok(Self {
            plan,
            kernel,
            time_buf,
            spec_buf,
            profile_buf,
            bins,
            profile_uploaded: false,
        })
    }

    /// Run one frame on the device: upload, forward, subtract, inverse,
    /// download. Any failure leaves `synth` untouched so the caller can
    /// re-run the frame on the host.
    fn run_frame(
        &mut self,
        windowed: &[f32],
        profile: &[f32],
        gain: f32,
        floor: f32,
        synth: &mut [f32],
    ) -> ComputeResult<()> {
        if !self.profile_uploaded {
            self.profile_buf.upload(bytemuck::cast_slice(profile))?;
            self.profile_uploaded = true;
        }
        self.time_buf.upload(bytemuck::cast_slice(windowed))?;
        self.plan
            .execute_forward(self.time_buf.as_ref(), self.spec_buf.as_ref())?;
        self.kernel.set_f32_arg(2, gain)?;
        self.kernel.set_f32_arg(3, floor)?;
        self.kernel.execute(self.bins as u32, KERNEL_GROUP_SIZE)?;
        self.plan
            .execute_inverse(self.spec_buf.as_ref(), self.time_buf.as_ref())?;
        self.time_buf.download(bytemuck::cast_slice_mut(synth))?;
        Ok(())
    }
}

/// Streaming noise-reduction processor
///
/// One instance per stream. Heavy setup (FFT plans, device objects, window)
/// happens in [`prepare`] and [`set_fft_size`]; the per-block path allocates
/// nothing.
///
/// [`prepare`]: SpectralProcessor::prepare
/// [`set_fft_size`]: SpectralProcessor::set_fft_size
pub struct SpectralProcessor {
    ctx: Arc<ComputeContext>,
    params: DenoiseParams,
    spec: Option<StreamSpec>,
    state: EngineState,

    fft_size: usize,
    hop: usize,
    window: Vec<f32>,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,

    // Frame scratch, shared across channels (frames are fully synchronous)
    windowed: Vec<f32>,
    fft_scratch: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    magnitudes: Vec<f32>,
    synth: Vec<f32>,

    channels: Vec<ChannelState>,
    profile: NoiseProfile,
    gpu: Option<GpuSession>,
    reduction_gain: f32,
    fallback_logged: bool,

    // Cross-thread capture hand-off
    capture_request: AtomicBool,
    profile_frozen: AtomicBool,
    capture_progress: AtomicU32,
}

impl SpectralProcessor {
    /// Create a processor bound to a compute context
    pub fn new(ctx: Arc<ComputeContext>, params: DenoiseParams) -> Self {
        let mut params = params;
        params.reduction_db = params.reduction_db.clamp(0.0, 24.0);
        params.fft_size = clamp_fft_size(params.fft_size);
        params.capture_frames = params.capture_frames.max(1);
        // A floor above 1 would turn the clamp into amplification
        params.spectral_floor = params.spectral_floor.clamp(0.0, 1.0);

        let fft_size = params.fft_size;
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_size);
        let inverse = planner.plan_fft_inverse(fft_size);
        let bins = fft_size / 2 + 1;
        let reduction_gain = db_to_gain(params.reduction_db);

        Self {
            ctx,
            spec: None,
            state: EngineState::Idle,
            fft_size,
            hop: fft_size / 4,
            window: periodic_hann(fft_size),
            forward,
            inverse,
            windowed: vec![0.0; fft_size],
            fft_scratch: vec![0.0; fft_size],
            spectrum: vec![Complex::new(0.0, 0.0); bins],
            magnitudes: vec![0.0; bins],
            synth: vec![0.0; fft_size],
            channels: Vec::new(),
            profile: NoiseProfile::new(bins, params.capture_frames),
            gpu: None,
            reduction_gain,
            fallback_logged: false,
            capture_request: AtomicBool::new(false),
            profile_frozen: AtomicBool::new(false),
            capture_progress: AtomicU32::new(0),
            params,
        }
    }

    /// Bind the processor to a stream configuration.
    ///
    /// Allocates all per-channel state and device objects; clears any held
    /// profile. Must be called before [`process`].
    ///
    /// [`process`]: SpectralProcessor::process
    pub fn prepare(&mut self, spec: &StreamSpec) -> SpectralResult<()> {
        if spec.channels == 0 {
            return Err(SpectralError::InvalidConfig(
                "stream must have at least one channel".into(),
            ));
        }
        if spec.sample_rate == 0 || spec.max_block == 0 {
            return Err(SpectralError::InvalidConfig(
                "sample rate and block size must be non-zero".into(),
            ));
        }
        self.spec = Some(spec.clone());
        self.rebuild();
        log::info!(
            "spectral engine: prepared {} ch at {} Hz, fft {}, venue {}",
            spec.channels,
            spec.sample_rate,
            self.fft_size,
            if self.gpu.is_some() { "device" } else { "host" }
        );
        Ok(())
    }

    /// Clear stream state for deterministic reprocessing.
    ///
    /// FIFOs, overlap tails, and pending output are dropped; the captured
    /// profile and all parameters survive.
    pub fn reset(&mut self) {
        for ch in &mut self.channels {
            ch.reset(self.fft_size, self.hop);
        }
        if self.state == EngineState::CapturingProfile {
            if let Some(ch) = self.channels.first_mut() {
                ch.fifo.clear();
            }
        }
        self.fallback_logged = false;
    }

    /// Process one planar block in place
    pub fn process(&mut self, block: &mut [&mut [f32]]) -> SpectralResult<()> {
        let spec = self.spec.as_ref().ok_or(SpectralError::NotPrepared)?;
        if block.len() != spec.channels {
            return Err(SpectralError::ChannelMismatch {
                prepared: spec.channels,
                got: block.len(),
            });
        }
        let len = block.first().map(|c| c.len()).unwrap_or(0);
        if block.iter().any(|c| c.len() != len) {
            return Err(SpectralError::InvalidConfig(
                "channel slices must have equal length".into(),
            ));
        }
        if len > spec.max_block {
            return Err(SpectralError::InvalidConfig(format!(
                "block of {len} samples exceeds configured maximum {}",
                spec.max_block
            )));
        }

        if self.capture_request.swap(false, Ordering::AcqRel) {
            self.begin_capture();
        }

        match self.state {
            EngineState::Idle | EngineState::Bypassed => {}
            EngineState::CapturingProfile => {
                self.capture_block(&*block[0]);
                if self.profile.is_frozen() {
                    self.finish_capture();
                }
            }
            EngineState::Active => {
                for ci in 0..block.len() {
                    self.stream_channel(ci, &mut *block[ci]);
                }
            }
        }
        Ok(())
    }

    /// Request a fresh profile capture.
    ///
    /// Atomic hand-off: callable from any thread, picked up by the
    /// processing thread on its next [`process`] call.
    ///
    /// [`process`]: SpectralProcessor::process
    pub fn capture_profile(&self) {
        self.capture_request.store(true, Ordering::Release);
    }

    /// True once a capture has completed and the profile is frozen
    pub fn profile_captured(&self) -> bool {
        self.profile_frozen.load(Ordering::Acquire)
    }

    /// Capture progress in 0..=1 (1.0 once frozen)
    pub fn capture_progress(&self) -> f32 {
        f32::from_bits(self.capture_progress.load(Ordering::Acquire))
    }

    /// Drop the captured profile and return to passthrough
    pub fn clear_profile(&mut self) {
        self.profile = NoiseProfile::new(self.fft_size / 2 + 1, self.params.capture_frames);
        self.profile_frozen.store(false, Ordering::Release);
        self.capture_progress.store(0f32.to_bits(), Ordering::Release);
        if let Some(gpu) = &mut self.gpu {
            gpu.profile_uploaded = false;
        }
        self.state = EngineState::Idle;
    }

    /// Set the reduction amount in dB, clamped to 0..=24.
    ///
    /// Zero selects bit-exact bypass; larger amounts never raise output
    /// level.
    pub fn set_reduction_db(&mut self, db: f32) {
        self.params.reduction_db = db.clamp(0.0, 24.0);
        self.reduction_gain = db_to_gain(self.params.reduction_db);
        if self.profile.is_frozen() && self.state != EngineState::CapturingProfile {
            self.state = self.active_or_bypassed();
        }
    }

    /// Change the FFT length, forcing full reinitialization.
    ///
    /// Values are rounded up to a power of two and clamped to the supported
    /// range. The profile is cleared (its bin count no longer matches).
    pub fn set_fft_size(&mut self, fft_size: usize) {
        let fft_size = clamp_fft_size(fft_size);
        if fft_size == self.fft_size {
            return;
        }
        self.params.fft_size = fft_size;
        if self.spec.is_some() {
            self.rebuild();
        } else {
            self.apply_fft_size();
        }
        log::debug!("spectral engine: fft size set to {fft_size}");
    }

    /// Current engine state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Reduction amount in dB
    pub fn reduction_db(&self) -> f32 {
        self.params.reduction_db
    }

    /// Magnitude floor ratio in effect, clamped to [0, 1]
    pub fn spectral_floor(&self) -> f32 {
        self.params.spectral_floor
    }

    /// Current FFT length
    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Analysis hop in samples (fft / 4, 75% overlap)
    pub fn hop_size(&self) -> usize {
        self.hop
    }

    /// Spectrum bins held by the noise profile (fft / 2 + 1)
    pub fn profile_bins(&self) -> usize {
        self.profile.bins()
    }

    /// Stream latency in samples (zero while passing through).
    ///
    /// Sample-synchronous overlap-add cannot deliver a frame's output before
    /// the frame completes, so the latency is one full FFT length.
    pub fn latency_samples(&self) -> usize {
        match self.state {
            EngineState::Active => self.fft_size,
            _ => 0,
        }
    }

    /// Read-only venue diagnostic for UI and logs
    pub fn gpu_info(&self) -> String {
        match &self.gpu {
            Some(_) => self.ctx.device_info().summary(),
            None => "CPU (GPU unavailable)".into(),
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn active_or_bypassed(&self) -> EngineState {
        if self.params.reduction_db > 0.0 {
            EngineState::Active
        } else {
            EngineState::Bypassed
        }
    }

    /// Rebuild window, host plans, scratch, channel state, and device
    /// objects for the current parameters. Clears the profile.
    fn rebuild(&mut self) {
        self.apply_fft_size();
        let channels = self.spec.as_ref().map(|s| s.channels).unwrap_or(0);
        self.channels = (0..channels)
            .map(|_| ChannelState::new(self.fft_size, self.hop))
            .collect();
        self.gpu = GpuSession::create(&self.ctx, self.fft_size);
        self.profile = NoiseProfile::new(self.fft_size / 2 + 1, self.params.capture_frames);
        self.profile_frozen.store(false, Ordering::Release);
        self.capture_progress.store(0f32.to_bits(), Ordering::Release);
        self.fallback_logged = false;
        self.state = EngineState::Idle;
    }

    fn apply_fft_size(&mut self) {
        let fft_size = self.params.fft_size;
        self.fft_size = fft_size;
        self.hop = fft_size / 4;
        self.window = periodic_hann(fft_size);
        let mut planner = RealFftPlanner::<f32>::new();
        self.forward = planner.plan_fft_forward(fft_size);
        self.inverse = planner.plan_fft_inverse(fft_size);
        let bins = fft_size / 2 + 1;
        self.windowed = vec![0.0; fft_size];
        self.fft_scratch = vec![0.0; fft_size];
        self.spectrum = vec![Complex::new(0.0, 0.0); bins];
        self.magnitudes = vec![0.0; bins];
        self.synth = vec![0.0; fft_size];
    }

    fn begin_capture(&mut self) {
        self.profile = NoiseProfile::new(self.fft_size / 2 + 1, self.params.capture_frames);
        self.profile_frozen.store(false, Ordering::Release);
        self.capture_progress.store(0f32.to_bits(), Ordering::Release);
        if let Some(ch) = self.channels.first_mut() {
            // Capture frames must hold real samples only, so the analysis
            // FIFO starts empty rather than zero-prefilled.
            ch.fifo.clear();
        }
        self.state = EngineState::CapturingProfile;
        log::info!(
            "spectral engine: capturing noise profile ({} frames)",
            self.params.capture_frames
        );
    }

    /// Accumulate capture frames from the first channel; the signal itself
    /// is untouched.
    fn capture_block(&mut self, data: &[f32]) {
        for &sample in data {
            if self.profile.is_frozen() {
                break;
            }
            self.channels[0].fifo.push(sample);
            if self.channels[0].fifo.len() == self.fft_size {
                self.analyze_capture_frame();
                self.channels[0].fifo.drain(..self.hop);
            }
        }
    }

    fn analyze_capture_frame(&mut self) {
        for (w, (&x, &win)) in self
            .fft_scratch
            .iter_mut()
            .zip(self.channels[0].fifo.iter().zip(&self.window))
        {
            *w = x * win;
        }
        let fwd = self
            .forward
            .process(&mut self.fft_scratch, &mut self.spectrum);
        debug_assert!(fwd.is_ok(), "transform buffers are sized at rebuild");
        for (mag, bin) in self.magnitudes.iter_mut().zip(&self.spectrum) {
            *mag = bin.norm();
        }
        self.profile.add_frame(&self.magnitudes);
        self.capture_progress
            .store(self.profile.progress().to_bits(), Ordering::Release);
    }

    /// Quota met: freeze, push the profile to the device, restart the
    /// stream, and leave capture. Applied at the end of the completing
    /// block.
    fn finish_capture(&mut self) {
        self.profile_frozen.store(true, Ordering::Release);
        if let Some(gpu) = &mut self.gpu {
            gpu.profile_uploaded = false;
            match gpu.profile_buf.upload(bytemuck::cast_slice(self.profile.magnitudes())) {
                Ok(()) => gpu.profile_uploaded = true,
                // Retried on the next device frame
                Err(err) => log::warn!("spectral engine: profile upload deferred ({err})"),
            }
        }
        for ch in &mut self.channels {
            ch.reset(self.fft_size, self.hop);
        }
        self.state = self.active_or_bypassed();
        log::info!(
            "spectral engine: noise profile captured ({} frames), now {:?}",
            self.profile.frames(),
            self.state
        );
    }

    /// Stream one channel's samples through the overlap-add engine
    fn stream_channel(&mut self, ci: usize, data: &mut [f32]) {
        for i in 0..data.len() {
            self.channels[ci].fifo.push(data[i]);
            if self.channels[ci].fifo.len() == self.fft_size {
                self.process_stream_frame(ci);
            }
            // The prefill guarantees a sample is always queued here
            data[i] = self.channels[ci].pending.pop_front().unwrap_or(0.0);
        }
    }

    /// Window, transform, subtract, resynthesize, and overlap-add one frame
    fn process_stream_frame(&mut self, ci: usize) {
        for (w, (&x, &win)) in self
            .windowed
            .iter_mut()
            .zip(self.channels[ci].fifo.iter().zip(&self.window))
        {
            *w = x * win;
        }

        if !self.try_device_frame() {
            self.host_frame();
        }

        // Inverse transforms are unnormalized on both venues; fold the 1/N
        // and overlap-add normalization into the synthesis window pass.
        let norm = 1.0 / (self.fft_size as f32 * OVERLAP_GAIN);
        for (s, &win) in self.synth.iter_mut().zip(&self.window) {
            *s *= norm * win;
        }

        let hop = self.hop;
        let ch = &mut self.channels[ci];
        for (acc, &s) in ch.ola.iter_mut().zip(&self.synth) {
            *acc += s;
        }
        ch.pending.extend(ch.ola[..hop].iter().copied());
        ch.ola.copy_within(hop.., 0);
        let tail = ch.ola.len() - hop;
        ch.ola[tail..].fill(0.0);
        ch.fifo.drain(..hop);
    }

    /// Attempt the frame on the device. Returns false (with the windowed
    /// frame intact) when there is no session or any step faults, so the
    /// caller re-runs the identical frame on the host.
    fn try_device_frame(&mut self) -> bool {
        let Some(gpu) = self.gpu.as_mut() else {
            return false;
        };
        match gpu.run_frame(
            &self.windowed,
            self.profile.magnitudes(),
            self.reduction_gain,
            self.params.spectral_floor,
            &mut self.synth,
        ) {
            Ok(()) => true,
            Err(err) => {
                if !self.fallback_logged {
                    log::warn!("spectral engine: device frame failed ({err}), re-running on host");
                    self.fallback_logged = true;
                }
                false
            }
        }
    }

    /// Host venue: identical formula to the device kernel
    fn host_frame(&mut self) {
        self.fft_scratch.copy_from_slice(&self.windowed);
        let fwd = self
            .forward
            .process(&mut self.fft_scratch, &mut self.spectrum);
        debug_assert!(fwd.is_ok(), "transform buffers are sized at rebuild");

        let gain = self.reduction_gain;
        let floor = self.params.spectral_floor;
        for (bin, &noise) in self.spectrum.iter_mut().zip(self.profile.magnitudes()) {
            let mag = bin.norm();
            let clean = (mag - noise * gain).max(mag * floor);
            let scale = if mag > 1e-12 { clean / mag } else { 0.0 };
            *bin *= scale;
        }

        // Real-only bin scaling keeps the DC/Nyquist imaginary parts at
        // exactly zero, so the inverse transform's input check cannot trip.
        let inv = self.inverse.process(&mut self.spectrum, &mut self.synth);
        debug_assert!(inv.is_ok(), "transform buffers are sized at rebuild");
    }
}

fn clamp_fft_size(fft_size: usize) -> usize {
    fft_size
        .next_power_of_two()
        .clamp(MIN_FFT_LEN, MAX_FFT_LEN)
}

fn db_to_gain(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}
