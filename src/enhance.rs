//! Voice clean-up for the assembled audiobook.
//!
//! ```text
//! noise gate (10th percentile × 0.7) ──► RMS to -18 dBFS ──► compressor -20 dB 3:1
//! ```
//!
//! Each step works in place on mono samples; [`enhance`] runs the chain.

/// Level of full-scale digital silence, returned for empty or silent input.
pub const SILENCE_DBFS: f32 = f32::NEG_INFINITY;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnhanceSettings {
    /// 0–1; how far below the 10th percentile the gate closes.
    pub gate_strength: f32,
    pub target_dbfs: f32,
    pub compressor: Compressor,
}

impl Default for EnhanceSettings {
    fn default() -> Self {
        Self { gate_strength: 0.3, target_dbfs: -18.0, compressor: Compressor::default() }
    }
}

/// Feed-forward peak compressor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compressor {
    pub threshold_db: f32,
    pub ratio: f32,
    pub attack_ms: f32,
    pub release_ms: f32,
}

impl Default for Compressor {
    fn default() -> Self {
        Self { threshold_db: -20.0, ratio: 3.0, attack_ms: 5.0, release_ms: 50.0 }
    }
}

fn db_to_amp(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

fn amp_to_db(amp: f32) -> f32 {
    if amp <= 0.0 {
        SILENCE_DBFS
    } else {
        20.0 * amp.log10()
    }
}

/// Root-mean-square level in dBFS.
pub fn rms_dbfs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return SILENCE_DBFS;
    }
    let power = samples.iter().map(|&s| (s as f64) * (s as f64)).sum::<f64>() / samples.len() as f64;
    amp_to_db(power.sqrt() as f32)
}

/// `p`-th percentile (0–100) of `|x|`, linearly interpolated.
pub fn abs_percentile(samples: &[f32], p: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut mags: Vec<f32> = samples.iter().map(|s| s.abs()).collect();
    mags.sort_by(f32::total_cmp);
    let pos = (p.clamp(0.0, 100.0) / 100.0) * (mags.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    mags[lo] + (mags[hi] - mags[lo]) * (pos - lo as f32)
}

/// Attenuate everything quieter than the gate threshold to a tenth.
pub fn noise_gate(samples: &mut [f32], strength: f32) {
    let threshold = abs_percentile(samples, 10.0) * (1.0 - strength.clamp(0.0, 1.0));
    for s in samples.iter_mut() {
        if s.abs() < threshold {
            *s *= 0.1;
        }
    }
}

/// Scale so the RMS level sits at `target_dbfs`.  Silence is left alone;
/// the result is clamped to full scale.
pub fn normalize_dbfs(samples: &mut [f32], target_dbfs: f32) {
    let current = rms_dbfs(samples);
    if !current.is_finite() {
        return;
    }
    let gain = db_to_amp(target_dbfs - current);
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

impl Compressor {
    /// Compress `samples` recorded at `sample_rate` in place.
    pub fn apply(&self, samples: &mut [f32], sample_rate: u32) {
        if sample_rate == 0 || self.ratio <= 1.0 {
            return;
        }
        let coeff = |ms: f32| (-1.0 / (ms.max(0.01) / 1000.0 * sample_rate as f32)).exp();
        let attack = coeff(self.attack_ms);
        let release = coeff(self.release_ms);
        let slope = 1.0 - 1.0 / self.ratio;

        let mut envelope = 0.0f32;
        for s in samples.iter_mut() {
            let level = s.abs();
            let k = if level > envelope { attack } else { release };
            envelope = k * envelope + (1.0 - k) * level;

            let over = amp_to_db(envelope) - self.threshold_db;
            if over > 0.0 {
                *s *= db_to_amp(-over * slope);
            }
        }
    }
}

/// Gate, level and compress `samples` in place.
pub fn enhance(samples: &mut [f32], sample_rate: u32, settings: &EnhanceSettings) {
    noise_gate(samples, settings.gate_strength);
    normalize_dbfs(samples, settings.target_dbfs);
    settings.compressor.apply(samples, sample_rate);
    log::debug!("enhanced {} samples, now {:.1} dBFS RMS", samples.len(), rms_dbfs(samples));
}
