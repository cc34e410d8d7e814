//! Noise profile capture
//!
//! A profile is the per-bin magnitude floor of the noise to subtract,
//! averaged over a fixed quota of capture frames. Once the quota is met the
//! profile freezes and is immutable until cleared.

/// Per-bin noise magnitude floor, frozen after capture
#[derive(Debug, Clone)]
pub struct NoiseProfile {
    magnitude: Vec<f32>,
    quota: usize,
    frames: usize,
}

impl NoiseProfile {
    /// Empty profile for `bins` spectrum bins, capturing `quota` frames
    pub fn new(bins: usize, quota: usize) -> Self {
        Self {
            magnitude: vec![0.0; bins],
            quota: quota.max(1),
            frames: 0,
        }
    }

    /// Fold one magnitude frame into the running average.
    ///
    /// Ignored once frozen. Returns true when this frame completed the quota.
    pub fn add_frame(&mut self, magnitudes: &[f32]) -> bool {
        if self.is_frozen() {
            return false;
        }
        self.frames += 1;
        let n = self.frames as f32;
        for (avg, &mag) in self.magnitude.iter_mut().zip(magnitudes) {
            *avg += (mag - *avg) / n;
        }
        self.is_frozen()
    }

    /// True once the capture quota has been met
    pub fn is_frozen(&self) -> bool {
        self.frames >= self.quota
    }

    /// Capture progress in 0..=1
    pub fn progress(&self) -> f32 {
        (self.frames as f32 / self.quota as f32).min(1.0)
    }

    /// Frames folded in so far
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Averaged magnitude floor per bin
    pub fn magnitudes(&self) -> &[f32] {
        &self.magnitude
    }

    /// Number of spectrum bins
    pub fn bins(&self) -> usize {
        self.magnitude.len()
    }
}
