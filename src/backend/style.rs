//! Style post-processing: speed, pitch and emotion on top of any backend.
//!
//! Speed and pitch use the tape-speed trick: the samples are reinterpreted
//! at `rate × factor` and then resampled back to `rate`, which shortens (or
//! stretches) the audio by `factor` and shifts its pitch with it.
//!
//! ```text
//! factor = speed × 2^(pitch × 0.1)
//! ```
//!
//! Emotion is a flat gain offset (see [`super::Emotion::gain_db`]).

use std::sync::Arc;

use anyhow::{Context, Result};

use super::{StyleOptions, SynthesisBackend};
use crate::audio::{apply_gain_db, resample, Fragment};
use crate::segment::SpeakableUnit;

/// Wraps a plain backend and applies [`StyleOptions`] to what it returns.
pub struct StyleBackend {
    inner: Arc<dyn SynthesisBackend>,
}

impl StyleBackend {
    pub fn new(inner: Arc<dyn SynthesisBackend>) -> Self {
        Self { inner }
    }
}

/// Playback-rate factor for `style`.
pub fn rate_factor(style: &StyleOptions) -> f64 {
    style.speed as f64 * 2f64.powf(style.pitch as f64 * 0.1)
}

/// Apply `style` to a synthesised fragment.
pub fn apply_style(fragment: Fragment, style: &StyleOptions) -> Result<Fragment> {
    let Fragment { mut samples, sample_rate } = fragment;

    let factor = rate_factor(style);
    if (factor - 1.0).abs() > 1e-6 && !samples.is_empty() {
        // Rounded to 10 Hz so the resampler keeps a small FFT.
        let shifted = ((sample_rate as f64 * factor / 10.0).round() * 10.0).max(10.0) as u32;
        samples = resample(&samples, shifted, sample_rate)
            .with_context(|| format!("speed/pitch change (factor {factor:.3})"))?;
    }

    apply_gain_db(&mut samples, style.emotion.gain_db());
    Ok(Fragment::new(samples, sample_rate))
}

impl SynthesisBackend for StyleBackend {
    fn name(&self) -> String {
        format!("style({})", self.inner.name())
    }

    fn prepare(&self) -> Result<()> {
        self.inner.prepare()
    }

    fn synthesize(&self, unit: &SpeakableUnit, style: &StyleOptions) -> Result<Fragment> {
        let raw = self.inner.synthesize(unit, &StyleOptions::default())?;
        apply_style(raw, style)
    }

    fn batch_size(&self) -> usize {
        self.inner.batch_size()
    }

    fn synthesize_batch(
        &self,
        units: &[&SpeakableUnit],
        style: &StyleOptions,
    ) -> Vec<Result<Fragment>> {
        self.inner
            .synthesize_batch(units, &StyleOptions::default())
            .into_iter()
            .map(|r| r.and_then(|f| apply_style(f, style)))
            .collect()
    }

    fn seconds_per_unit(&self) -> f64 {
        self.inner.seconds_per_unit()
    }
}
