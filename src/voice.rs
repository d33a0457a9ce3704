//! Reference voice tools: trim a recording into a cloning reference and
//! blend two voices into a new one.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::assemble::write_atomic;
use crate::audio::{
    encode_wav_i16, normalize_peak, read_audio, samples_for, Fragment, DEFAULT_SAMPLE_RATE,
    PEAK_TARGET,
};

/// Length kept from a recording when preparing a reference.
pub const REFERENCE_SECS: f64 = 45.0;

/// Mono, at most `max_secs` long, at the model's rate, peak at
/// [`PEAK_TARGET`].
pub fn prepare_reference(recording: Fragment, max_secs: f64) -> Result<Fragment> {
    if recording.is_empty() {
        bail!("recording is empty");
    }
    if max_secs <= 0.0 {
        bail!("reference length must be positive, got {max_secs} s");
    }
    let keep = samples_for(Duration::from_secs_f64(max_secs), recording.sample_rate);
    let Fragment { mut samples, sample_rate } = recording;
    samples.truncate(keep);

    let mut reference = Fragment::new(samples, sample_rate).resampled(DEFAULT_SAMPLE_RATE)?;
    normalize_peak(&mut reference.samples, PEAK_TARGET);
    Ok(reference)
}

/// Mix two voices: `a × (1 − ratio) + b × ratio`.
///
/// Both are brought to the lower of the two rates and cut to the shorter
/// length; the mix is peak-normalised.
pub fn blend(a: Fragment, b: Fragment, ratio: f32) -> Result<Fragment> {
    if !(0.0..=1.0).contains(&ratio) {
        bail!("blend ratio {ratio} outside 0–1");
    }
    let rate = a.sample_rate.min(b.sample_rate);
    let a = a.resampled(rate).context("first voice")?;
    let b = b.resampled(rate).context("second voice")?;

    let mut mixed: Vec<f32> = a
        .samples
        .iter()
        .zip(&b.samples)
        .map(|(x, y)| x * (1.0 - ratio) + y * ratio)
        .collect();
    if mixed.is_empty() {
        bail!("nothing to blend: one of the voices is empty");
    }
    normalize_peak(&mut mixed, PEAK_TARGET);
    Ok(Fragment::new(mixed, rate))
}

fn write_reference(fragment: &Fragment, output: &Path) -> Result<()> {
    let bytes = encode_wav_i16(fragment)?;
    write_atomic(output, &bytes).with_context(|| format!("cannot write {}", output.display()))?;
    log::info!(
        "wrote {} ({:.1} s at {} Hz)",
        output.display(),
        fragment.duration().as_secs_f64(),
        fragment.sample_rate
    );
    Ok(())
}

/// Read `input`, prepare it as a reference and write a 16-bit WAV.
pub fn prepare_reference_file(input: &Path, output: &Path, max_secs: f64) -> Result<Fragment> {
    let recording = read_audio(input)?;
    let original = recording.duration().as_secs_f64();
    if original > max_secs {
        log::info!("{}: keeping the first {max_secs:.0} s of {original:.1} s", input.display());
    }
    let reference = prepare_reference(recording, max_secs)?;
    write_reference(&reference, output)?;
    Ok(reference)
}

/// Blend the recordings at `a` and `b` into a 16-bit WAV at `output`.
pub fn blend_files(a: &Path, b: &Path, output: &Path, ratio: f32) -> Result<Fragment> {
    let mixed = blend(read_audio(a)?, read_audio(b)?, ratio)?;
    write_reference(&mixed, output)?;
    Ok(mixed)
}
