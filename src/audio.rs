//! PCM fragments and the signal operations the pipeline needs.
//!
//! All audio inside the crate is **mono `f32` in [-1.0, 1.0]** at an explicit
//! sample rate.  Multi-channel input is down-mixed on decode.

use std::io::Cursor;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Sample rate of the local cloning model, used as the default session rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Peak level after normalisation (fraction of full scale).
pub const PEAK_TARGET: f32 = 0.95;

/// Input block size for the FFT resampler.
const RESAMPLE_CHUNK: usize = 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Fragment
// ─────────────────────────────────────────────────────────────────────────────

/// Decoded mono audio for one unit (or any piece of the final buffer).
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Fragment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// `duration` of digital silence.
    pub fn silence(duration: Duration, sample_rate: u32) -> Self {
        Self::new(vec![0.0; samples_for(duration, sample_rate)], sample_rate)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn peak(&self) -> f32 {
        peak(&self.samples)
    }

    /// Return this fragment at `rate`, resampling when needed.
    pub fn resampled(self, rate: u32) -> Result<Self> {
        if self.sample_rate == rate {
            return Ok(self);
        }
        let samples = resample(&self.samples, self.sample_rate, rate)?;
        Ok(Self::new(samples, rate))
    }
}

/// Number of samples covering `duration` at `sample_rate` (rounded).
pub fn samples_for(duration: Duration, sample_rate: u32) -> usize {
    (duration.as_secs_f64() * sample_rate as f64).round() as usize
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal operations
// ─────────────────────────────────────────────────────────────────────────────

pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |m, s| m.max(s.abs()))
}

/// Scale `samples` so the loudest one sits at `target` of full scale.
/// Digital silence is left untouched.
pub fn normalize_peak(samples: &mut [f32], target: f32) {
    let p = peak(samples);
    if p <= f32::EPSILON {
        return;
    }
    let gain = target / p;
    for s in samples.iter_mut() {
        *s *= gain;
    }
}

/// Apply a gain in decibels, clamping to full scale.
pub fn apply_gain_db(samples: &mut [f32], db: f32) {
    if db == 0.0 {
        return;
    }
    let gain = 10f32.powf(db / 20.0);
    for s in samples.iter_mut() {
        *s = (*s * gain).clamp(-1.0, 1.0);
    }
}

/// Resample mono PCM from `from` Hz to `to` Hz.
///
/// The result always holds `round(len * to / from)` samples: the resampler's
/// start-up delay is dropped and the flushed tail is trimmed, so durations
/// survive the conversion exactly.
pub fn resample(samples: &[f32], from: u32, to: u32) -> Result<Vec<f32>> {
    if from == 0 || to == 0 {
        bail!("invalid sample rate conversion {from} Hz → {to} Hz");
    }
    if from == to || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let expected =
        ((samples.len() as u64 * to as u64 + from as u64 / 2) / from as u64) as usize;

    let mut resampler = FftFixedIn::<f32>::new(from as usize, to as usize, RESAMPLE_CHUNK, 2, 1)
        .with_context(|| format!("Cannot build resampler {from} Hz → {to} Hz"))?;
    let delay = resampler.output_delay();
    let mut out = Vec::with_capacity(expected + delay + RESAMPLE_CHUNK);

    let mut pos = 0;
    while pos + resampler.input_frames_next() <= samples.len() {
        let n = resampler.input_frames_next();
        let block = vec![&samples[pos..pos + n]];
        let frames = resampler.process(&block[..], None).context("Resampling failed")?;
        out.extend_from_slice(&frames[0]);
        pos += n;
    }
    if pos < samples.len() {
        let block = vec![&samples[pos..]];
        let frames = resampler
            .process_partial(Some(&block[..]), None)
            .context("Resampling failed")?;
        out.extend_from_slice(&frames[0]);
    }
    while out.len() < expected + delay {
        let frames = resampler
            .process_partial(None::<&[Vec<f32>]>, None)
            .context("Resampler flush failed")?;
        if frames[0].is_empty() {
            break;
        }
        out.extend_from_slice(&frames[0]);
    }

    let mut out = out.split_off(delay.min(out.len()));
    out.resize(expected, 0.0);
    Ok(out)
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Decode an encoded audio payload (MP3, WAV, …) into a mono fragment.
///
/// `extension` is an optional format hint such as `"mp3"`.
pub fn decode_bytes(bytes: Vec<u8>, extension: Option<&str>) -> Result<Fragment> {
    if bytes.is_empty() {
        bail!("empty audio payload");
    }
    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = extension {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .context("Unrecognised audio format")?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("No supported audio track in payload"))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow!("Unsupported codec: {e}"))?;

    let mut pcm = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(e).context("Cannot read audio packet"),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            // Corrupt frames are skipped, as players do.
            Err(SymphoniaError::DecodeError(msg)) => {
                log::debug!("skipping undecodable packet: {msg}");
                continue;
            }
            Err(e) => return Err(e).context("Audio decode failed"),
        };
        let spec = *decoded.spec();
        if sample_rate == 0 {
            sample_rate = spec.rate;
        }
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        pcm.extend(downmix(buf.samples(), spec.channels.count()));
    }

    if sample_rate == 0 {
        bail!("audio payload has no sample rate");
    }
    Ok(Fragment::new(pcm, sample_rate))
}

/// Read a WAV file (any PCM/float layout) into a mono fragment.
pub fn read_wav(path: &Path) -> Result<Fragment> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Cannot open WAV: {}", path.display()))?;
    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .context("WAV read error")?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .context("WAV read error")?
        }
    };
    Ok(Fragment::new(
        downmix(&interleaved, spec.channels as usize),
        spec.sample_rate,
    ))
}

/// Read any supported recording (WAV, MP3) into a mono fragment.
pub fn read_audio(path: &Path) -> Result<Fragment> {
    let ext = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    if ext.as_deref() == Some("wav") {
        return read_wav(path);
    }
    let bytes = std::fs::read(path).with_context(|| format!("Cannot read {}", path.display()))?;
    decode_bytes(bytes, ext.as_deref()).with_context(|| format!("Cannot decode {}", path.display()))
}

/// Duration of a WAV file, from its header.
pub fn wav_duration(path: &Path) -> Result<Duration> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("Cannot open WAV: {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate == 0 {
        bail!("WAV has no sample rate: {}", path.display());
    }
    Ok(Duration::from_secs_f64(
        reader.duration() as f64 / spec.sample_rate as f64,
    ))
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Write a fragment as 32-bit float WAV.  Lossless; used for per-unit files
/// in the job's working directory.
pub fn write_wav_f32(fragment: &Fragment, path: &Path) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: fragment.sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Cannot create WAV: {}", path.display()))?;
    for &s in &fragment.samples {
        writer.write_sample(s).context("WAV write error")?;
    }
    writer.finalize().context("WAV finalise error")?;
    Ok(())
}

/// Encode a fragment as a 16-bit PCM WAV file in memory.
///
/// 16-bit PCM rather than float: some players accept a float header and then
/// play silence.
pub fn encode_wav_i16(fragment: &Fragment) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: fragment.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + fragment.samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).context("WAV header error")?;
        for &s in &fragment.samples {
            writer.write_sample(to_i16(s)).context("WAV write error")?;
        }
        writer.finalize().context("WAV finalise error")?;
    }
    Ok(cursor.into_inner())
}

fn to_i16(s: f32) -> i16 {
    (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Encode a fragment as constant-bitrate MP3.
#[cfg(feature = "mp3")]
pub fn encode_mp3(fragment: &Fragment, bitrate_kbps: u32) -> Result<Vec<u8>> {
    use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

    let bitrate = match bitrate_kbps {
        0..=96 => Bitrate::Kbps96,
        97..=128 => Bitrate::Kbps128,
        129..=160 => Bitrate::Kbps160,
        161..=192 => Bitrate::Kbps192,
        193..=256 => Bitrate::Kbps256,
        _ => Bitrate::Kbps320,
    };

    let mut builder = Builder::new().ok_or_else(|| anyhow!("Cannot create LAME encoder"))?;
    builder
        .set_num_channels(1)
        .map_err(|e| anyhow!("LAME channels: {e:?}"))?;
    builder
        .set_sample_rate(fragment.sample_rate)
        .map_err(|e| anyhow!("LAME sample rate {}: {e:?}", fragment.sample_rate))?;
    builder
        .set_brate(bitrate)
        .map_err(|e| anyhow!("LAME bitrate: {e:?}"))?;
    builder
        .set_quality(Quality::NearBest)
        .map_err(|e| anyhow!("LAME quality: {e:?}"))?;
    let mut encoder = builder.build().map_err(|e| anyhow!("LAME init: {e:?}"))?;

    let pcm: Vec<i16> = fragment.samples.iter().map(|&s| to_i16(s)).collect();
    let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(pcm.len()));
    encoder
        .encode_to_vec(MonoPcm(&pcm), &mut out)
        .map_err(|e| anyhow!("MP3 encode: {e:?}"))?;
    encoder
        .flush_to_vec::<FlushNoGap>(&mut out)
        .map_err(|e| anyhow!("MP3 flush: {e:?}"))?;
    Ok(out)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, rate: u32) -> Fragment {
        let samples = (0..len)
            .map(|i| 0.5 * (i as f32 * 440.0 * std::f32::consts::TAU / rate as f32).sin())
            .collect();
        Fragment::new(samples, rate)
    }

    #[test]
    fn test_silence_length() {
        let s = Fragment::silence(Duration::from_millis(600), 24_000);
        assert_eq!(s.len(), 14_400);
        assert!(s.samples.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_normalize_peak() {
        let mut s = vec![0.1, -0.2, 0.05];
        normalize_peak(&mut s, 0.95);
        assert!((peak(&s) - 0.95).abs() < 1e-6);
        assert!((s[0] - 0.475).abs() < 1e-6);

        let mut quiet = vec![0.0; 10];
        normalize_peak(&mut quiet, 0.95);
        assert!(quiet.iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_gain_db() {
        let mut s = vec![0.5];
        apply_gain_db(&mut s, 6.0);
        assert!((s[0] - 0.5 * 10f32.powf(0.3)).abs() < 1e-5);
        let mut loud = vec![0.9];
        apply_gain_db(&mut loud, 12.0);
        assert_eq!(loud[0], 1.0);
    }

    #[test]
    fn test_resample_preserves_duration() {
        let f = tone(44_100, 44_100);
        let r = f.resampled(24_000).unwrap();
        assert_eq!(r.sample_rate, 24_000);
        assert_eq!(r.len(), 24_000);

        let short = tone(1_000, 16_000).resampled(24_000).unwrap();
        assert_eq!(short.len(), 1_500);
    }

    #[test]
    fn test_resample_identity() {
        let f = tone(500, 24_000);
        assert_eq!(f.clone().resampled(24_000).unwrap(), f);
    }

    #[test]
    fn test_wav_roundtrip_and_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        let f = tone(2_400, 24_000);
        write_wav_f32(&f, &path).unwrap();
        assert_eq!(read_wav(&path).unwrap(), f);
        let d = wav_duration(&path).unwrap();
        assert!((d.as_secs_f64() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_decode_wav_bytes() {
        let bytes = encode_wav_i16(&tone(4_800, 24_000)).unwrap();
        let decoded = decode_bytes(bytes, Some("wav")).unwrap();
        assert_eq!(decoded.sample_rate, 24_000);
        assert_eq!(decoded.len(), 4_800);
    }

    #[test]
    fn test_read_audio_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let wav = dir.path().join("ses.WAV");
        write_wav_f32(&tone(1_200, 24_000), &wav).unwrap();
        assert_eq!(read_audio(&wav).unwrap().len(), 1_200);

        let other = dir.path().join("ses.kayit");
        std::fs::write(&other, encode_wav_i16(&tone(2_400, 16_000)).unwrap()).unwrap();
        let f = read_audio(&other).unwrap();
        assert_eq!((f.sample_rate, f.len()), (16_000, 2_400));

        assert!(read_audio(&dir.path().join("yok.mp3")).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_bytes(Vec::new(), None).is_err());
        assert!(decode_bytes(b"definitely not audio".to_vec(), None).is_err());
    }
}
