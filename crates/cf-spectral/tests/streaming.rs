//! Spectral Engine Integration Tests
//!
//! Tests the full streaming path through a CPU-backed compute context.
//! Verifies:
//! - Passthrough exactness in the non-active states
//! - Hop and profile-bin invariants across every supported FFT size
//! - Unity reconstruction gain at one frame of latency
//! - Noise reduction strength and monotonicity in the reduction amount
//! - Device-fault fallback producing host-identical output
//! - Mid-session FFT size changes

use std::any::Any;
use std::sync::Arc;

use cf_compute::{
    ComputeBackend, ComputeContext, ComputeError, ComputeKernel, ComputeResult, CpuBackend,
    DeviceBuffer, DeviceInfo, FftPlan,
};
use cf_spectral::processor::EngineState;
use cf_spectral::{DenoiseParams, SpectralProcessor, StreamSpec};

const CHUNK: usize = 512;

/// Generate test sine wave
fn generate_sine(samples: usize, freq: f32, sample_rate: f32) -> Vec<f32> {
    (0..samples)
        .map(|i| {
            let t = i as f32 / sample_rate;
            (2.0 * std::f32::consts::PI * freq * t).sin() * 0.5
        })
        .collect()
}

/// Generate deterministic white noise
fn generate_noise(samples: usize, seed: u64) -> Vec<f32> {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    (0..samples)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            (seed, i).hash(&mut hasher);
            let h = hasher.finish();
            ((h as f64 / u64::MAX as f64) as f32 * 2.0 - 1.0) * 0.5
        })
        .collect()
}

/// Check signal has no NaN or Infinity
fn is_valid_signal(signal: &[f32]) -> bool {
    signal.iter().all(|&x| x.is_finite())
}

/// Calculate RMS of signal
fn rms(signal: &[f32]) -> f32 {
    let sum: f32 = signal.iter().map(|x| x * x).sum();
    (sum / signal.len() as f32).sqrt()
}

fn cpu_processor(params: DenoiseParams) -> SpectralProcessor {
    let ctx = Arc::new(ComputeContext::with_backend(Box::new(CpuBackend::new())));
    SpectralProcessor::new(ctx, params)
}

/// Stream planar channels through the processor in CHUNK-sized blocks
fn process_all(proc: &mut SpectralProcessor, channels: &mut [Vec<f32>]) {
    let len = channels[0].len();
    let mut offset = 0;
    while offset < len {
        let end = (offset + CHUNK).min(len);
        let mut block: Vec<&mut [f32]> = channels
            .iter_mut()
            .map(|c| &mut c[offset..end])
            .collect();
        proc.process(&mut block).unwrap();
        offset = end;
    }
}

/// Capture a noise profile from the given signal, consuming it
fn capture_from(proc: &mut SpectralProcessor, signal: &[f32], channels: usize) {
    proc.capture_profile();
    let mut data: Vec<Vec<f32>> = (0..channels).map(|_| signal.to_vec()).collect();
    process_all(proc, &mut data);
    assert!(proc.profile_captured(), "capture quota not met");
}

// ═══════════════════════════════════════════════════════════════════════════════
// PASSTHROUGH AND STATE MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_idle_is_bit_exact_passthrough() {
    let mut proc = cpu_processor(DenoiseParams::default());
    proc.prepare(&StreamSpec {
        sample_rate: 48000,
        channels: 2,
        max_block: CHUNK,
    })
    .unwrap();
    assert_eq!(proc.state(), EngineState::Idle);

    let original = generate_sine(4096, 440.0, 48000.0);
    let mut data = vec![original.clone(), original.clone()];
    process_all(&mut proc, &mut data);

    assert_eq!(data[0], original);
    assert_eq!(data[1], original);
    assert_eq!(proc.latency_samples(), 0);
}

#[test]
fn test_zero_reduction_with_profile_is_bypassed() {
    let mut proc = cpu_processor(DenoiseParams {
        reduction_db: 0.0,
        capture_frames: 8,
        ..Default::default()
    });
    proc.prepare(&StreamSpec {
        sample_rate: 48000,
        channels: 1,
        max_block: CHUNK,
    })
    .unwrap();

    let noise = generate_noise(16384, 1);
    capture_from(&mut proc, &noise, 1);
    assert_eq!(proc.state(), EngineState::Bypassed);

    // Block well past 3x hop: still bit-exact
    let original = generate_sine(8192, 440.0, 48000.0);
    let mut data = vec![original.clone()];
    process_all(&mut proc, &mut data);
    assert_eq!(data[0], original);
}

#[test]
fn test_state_machine_transitions() {
    let mut proc = cpu_processor(DenoiseParams {
        capture_frames: 8,
        ..Default::default()
    });
    proc.prepare(&StreamSpec {
        sample_rate: 48000,
        channels: 1,
        max_block: CHUNK,
    })
    .unwrap();
    assert_eq!(proc.state(), EngineState::Idle);
    assert!(!proc.profile_captured());

    // Request is picked up on the next process call
    proc.capture_profile();
    assert_eq!(proc.state(), EngineState::Idle);

    let noise = generate_noise(16384, 2);
    let mut data = vec![noise.clone()];
    {
        let mut block: Vec<&mut [f32]> = vec![&mut data[0][..CHUNK]];
        proc.process(&mut block).unwrap();
    }
    assert_eq!(proc.state(), EngineState::CapturingProfile);
    assert_eq!(proc.capture_progress(), 0.0);

    // First frame fires once a full FFT length has been seen
    let fft = proc.fft_size();
    for start in (CHUNK..CHUNK + fft).step_by(CHUNK) {
        let mut block: Vec<&mut [f32]> = vec![&mut data[0][start..start + CHUNK]];
        proc.process(&mut block).unwrap();
    }
    assert!(proc.capture_progress() > 0.0);
    assert!(!proc.profile_captured());

    process_all(&mut proc, &mut data);
    assert!(proc.profile_captured());
    assert_eq!(proc.capture_progress(), 1.0);
    assert_eq!(proc.state(), EngineState::Active);
    assert_eq!(proc.latency_samples(), proc.fft_size());

    proc.set_reduction_db(0.0);
    assert_eq!(proc.state(), EngineState::Bypassed);
    proc.set_reduction_db(12.0);
    assert_eq!(proc.state(), EngineState::Active);

    proc.clear_profile();
    assert_eq!(proc.state(), EngineState::Idle);
    assert!(!proc.profile_captured());
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONSTRUCTION AND INVARIANTS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_hop_and_bins_across_supported_sizes() {
    for fft_size in [1024usize, 2048, 4096, 8192, 16384, 32768] {
        let mut proc = cpu_processor(DenoiseParams {
            fft_size,
            ..Default::default()
        });
        proc.prepare(&StreamSpec {
            sample_rate: 48000,
            channels: 1,
            max_block: CHUNK,
        })
        .unwrap();
        assert_eq!(proc.fft_size(), fft_size);
        assert_eq!(proc.hop_size(), fft_size / 4);
        assert_eq!(proc.profile_bins(), fft_size / 2 + 1);
    }
}

#[test]
fn test_unity_reconstruction_through_active_path() {
    // A silence-captured profile is all zeros, so the active path reduces to
    // pure analysis/resynthesis. Output must be the input delayed by one
    // frame at unity gain, which pins the 1.5 overlap normalization.
    let mut proc = cpu_processor(DenoiseParams {
        capture_frames: 10,
        fft_size: 2048,
        ..Default::default()
    });
    proc.prepare(&StreamSpec {
        sample_rate: 48000,
        channels: 1,
        max_block: CHUNK,
    })
    .unwrap();

    let silence = vec![0.0f32; 8192];
    capture_from(&mut proc, &silence, 1);
    assert_eq!(proc.state(), EngineState::Active);

    let input = generate_sine(16384, 440.0, 48000.0);
    let mut data = vec![input.clone()];
    process_all(&mut proc, &mut data);
    let output = &data[0];

    assert!(is_valid_signal(output));
    let latency = proc.latency_samples();
    assert_eq!(latency, 2048);
    for i in latency..input.len() {
        let expected = input[i - latency];
        assert!(
            (output[i] - expected).abs() < 2e-3,
            "sample {i}: expected {expected}, got {}",
            output[i]
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NOISE REDUCTION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_noise_reduction_strength_and_monotonicity() {
    let mut proc = cpu_processor(DenoiseParams {
        capture_frames: 20,
        fft_size: 2048,
        ..Default::default()
    });
    proc.prepare(&StreamSpec {
        sample_rate: 48000,
        channels: 1,
        max_block: CHUNK,
    })
    .unwrap();

    let noise = generate_noise(32768, 7);
    capture_from(&mut proc, &noise, 1);

    let input_rms = rms(&noise);
    let mut last = f32::MAX;
    for db in [6.0f32, 12.0, 18.0, 24.0] {
        proc.set_reduction_db(db);
        proc.reset();

        let mut data = vec![noise.clone()];
        process_all(&mut proc, &mut data);
        assert!(is_valid_signal(&data[0]));

        // Skip the startup latency region
        let out_rms = rms(&data[0][proc.latency_samples() * 2..]);
        assert!(
            out_rms <= last * 1.05,
            "{db} dB raised RMS: {out_rms} > {last}"
        );
        last = out_rms;
    }

    // 24 dB over its own profile must gut the noise
    assert!(
        last < input_rms * 0.3,
        "24 dB reduction too weak: {last} vs input {input_rms}"
    );
}

#[test]
fn test_end_to_end_tone_survives_denoising() {
    // 44.1 kHz stereo session: capture the noise floor, then denoise a tone
    // buried in that noise at the default 12 dB.
    let sample_rate = 44100.0;
    let mut proc = cpu_processor(DenoiseParams::default());
    proc.prepare(&StreamSpec {
        sample_rate: 44100,
        channels: 2,
        max_block: CHUNK,
    })
    .unwrap();

    let noise = generate_noise(44100, 11);
    capture_from(&mut proc, &noise, 2);
    assert_eq!(proc.state(), EngineState::Active);

    let tone = generate_sine(44100, 440.0, sample_rate);
    let noisy: Vec<f32> = tone.iter().zip(&noise).map(|(t, n)| t + n).collect();
    let mut data = vec![noisy.clone(), noisy.clone()];
    process_all(&mut proc, &mut data);

    for ch in &data {
        assert!(is_valid_signal(ch));
        let out_rms = rms(&ch[proc.latency_samples() * 2..]);
        let noisy_rms = rms(&noisy);
        let tone_rms = rms(&tone);
        assert!(out_rms < noisy_rms, "no reduction: {out_rms} vs {noisy_rms}");
        assert!(
            out_rms > tone_rms * 0.5,
            "tone destroyed: {out_rms} vs {tone_rms}"
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RECONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_set_fft_size_mid_session() {
    let mut proc = cpu_processor(DenoiseParams {
        capture_frames: 8,
        fft_size: 2048,
        ..Default::default()
    });
    proc.prepare(&StreamSpec {
        sample_rate: 48000,
        channels: 1,
        max_block: CHUNK,
    })
    .unwrap();

    let noise = generate_noise(16384, 3);
    capture_from(&mut proc, &noise, 1);
    assert_eq!(proc.state(), EngineState::Active);

    let mut data = vec![noise.clone()];
    process_all(&mut proc, &mut data);

    // Profile bins no longer match, so the profile is dropped and the
    // stream returns to passthrough
    proc.set_fft_size(4096);
    assert_eq!(proc.fft_size(), 4096);
    assert_eq!(proc.hop_size(), 1024);
    assert_eq!(proc.profile_bins(), 2049);
    assert_eq!(proc.state(), EngineState::Idle);
    assert!(!proc.profile_captured());

    let original = generate_sine(8192, 330.0, 48000.0);
    let mut data = vec![original.clone()];
    process_all(&mut proc, &mut data);
    assert_eq!(data[0], original);
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEVICE-FAULT FALLBACK
// ═══════════════════════════════════════════════════════════════════════════════

/// Backend whose setup succeeds but whose every frame execution faults,
/// forcing the per-frame host fallback.
struct FaultyBackend;

struct FaultyBuffer {
    data: Option<Vec<u8>>,
}

impl DeviceBuffer for FaultyBuffer {
    fn allocate(&mut self, size_bytes: usize) -> ComputeResult<()> {
        self.data = Some(vec![0u8; size_bytes]);
        Ok(())
    }

    fn upload(&mut self, data: &[u8]) -> ComputeResult<()> {
        let Some(storage) = self.data.as_mut() else {
            return Err(ComputeError::InvalidConfig("unallocated".into()));
        };
        if data.len() > storage.len() {
            return Err(ComputeError::InvalidConfig("oversized".into()));
        }
        storage[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download(&self, data: &mut [u8]) -> ComputeResult<()> {
        let Some(storage) = self.data.as_ref() else {
            return Err(ComputeError::InvalidConfig("unallocated".into()));
        };
        if data.len() > storage.len() {
            return Err(ComputeError::InvalidConfig("oversized".into()));
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

struct FaultyPlan {
    fft_len: usize,
}

impl FftPlan for FaultyPlan {
    fn fft_len(&self) -> usize {
        self.fft_len
    }

    fn batch(&self) -> usize {
        1
    }

    fn execute_forward(
        &mut self,
        _input: &dyn DeviceBuffer,
        _output: &dyn DeviceBuffer,
    ) -> ComputeResult<()> {
        Err(ComputeError::Device("injected transform fault".into()))
    }

    fn execute_inverse(
        &mut self,
        _input: &dyn DeviceBuffer,
        _output: &dyn DeviceBuffer,
    ) -> ComputeResult<()> {
        Err(ComputeError::Device("injected transform fault".into()))
    }

    fn release(&mut self) {}
}

struct FaultyKernel;

impl ComputeKernel for FaultyKernel {
    fn set_buffer_arg(&mut self, _index: u32, _buffer: &dyn DeviceBuffer) -> ComputeResult<()> {
        Ok(())
    }

    fn set_f32_arg(&mut self, _index: u32, _value: f32) -> ComputeResult<()> {
        Ok(())
    }

    fn set_u32_arg(&mut self, _index: u32, _value: u32) -> ComputeResult<()> {
        Ok(())
    }

    fn execute(&mut self, _total: u32, _per_group: u32) -> ComputeResult<()> {
        Err(ComputeError::Device("injected kernel fault".into()))
    }

    fn release(&mut self) {}
}

impl ComputeBackend for FaultyBackend {
    fn name(&self) -> &'static str {
        "faulty"
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: "Fault Injector".into(),
            backend: "faulty".into(),
            ..Default::default()
        }
    }

    fn create_buffer(&self) -> Box<dyn DeviceBuffer> {
        Box::new(FaultyBuffer { data: None })
    }

    fn create_fft_plan(&self, fft_len: usize, _batch: usize) -> ComputeResult<Box<dyn FftPlan>> {
        Ok(Box::new(FaultyPlan { fft_len }))
    }

    fn create_kernel(
        &self,
        _source: &str,
        _entry_point: &str,
    ) -> ComputeResult<Box<dyn ComputeKernel>> {
        Ok(Box::new(FaultyKernel))
    }

    fn synchronize(&self) -> ComputeResult<()> {
        Ok(())
    }

    fn shutdown(&mut self) {}
}

#[test]
fn test_device_fault_fallback_matches_host_output() {
    let params = DenoiseParams {
        capture_frames: 10,
        fft_size: 2048,
        ..Default::default()
    };
    let spec = StreamSpec {
        sample_rate: 48000,
        channels: 1,
        max_block: CHUNK,
    };

    let faulty_ctx = Arc::new(ComputeContext::with_backend(Box::new(FaultyBackend)));
    let mut faulty = SpectralProcessor::new(faulty_ctx, params.clone());
    faulty.prepare(&spec).unwrap();
    // Setup succeeded, so the venue diagnostic names the device
    assert_eq!(faulty.gpu_info(), "Fault Injector (faulty)");

    let mut host = cpu_processor(params);
    host.prepare(&spec).unwrap();
    assert_eq!(host.gpu_info(), "CPU (GPU unavailable)");

    let noise = generate_noise(16384, 5);
    capture_from(&mut faulty, &noise, 1);
    capture_from(&mut host, &noise, 1);

    let tone = generate_sine(16384, 440.0, 48000.0);
    let noisy: Vec<f32> = tone.iter().zip(&noise).map(|(t, n)| t + n).collect();

    let mut a = vec![noisy.clone()];
    let mut b = vec![noisy.clone()];
    process_all(&mut faulty, &mut a);
    process_all(&mut host, &mut b);

    for (x, y) in a[0].iter().zip(&b[0]) {
        assert!(
            (x - y).abs() < 1e-5,
            "fallback output diverged: {x} vs {y}"
        );
    }
}
