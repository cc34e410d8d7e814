//! STFT analysis/synthesis window

/// Overlap-add normalization for the periodic Hann window at 75% overlap.
///
/// With the window applied on both analysis and synthesis, the overlapped
/// frames sum to `sum_k w^2(n + k*N/4) = 1.5` at every sample position, so
/// dividing each synthesized frame by this constant gives unity
/// reconstruction.
pub const OVERLAP_GAIN: f32 = 1.5;

/// Periodic Hann window of length `len`
pub fn periodic_hann(len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / len as f32;
            0.5 * (1.0 - phase.cos())
        })
        .collect()
}
