//! Audio assembler: one playable file from a job's results.
//!
//! ```text
//! for i in 0..N (strict index order)
//!     ok      → fragment (at canonical rate) + silence(pause_after)
//!     failed  → nothing                    (GapPolicy::Omit)
//!             → silence(pause_after)       (GapPolicy::Silence)
//! optional enhancement (noise gate, loudness, compression)
//! peak-normalise the whole buffer once
//! encode by output extension, write via temp file + rename
//! ```
//!
//! The result depends only on the job's units and results map, never on
//! the order results arrived in.

use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::audio::{encode_wav_i16, normalize_peak, Fragment, DEFAULT_SAMPLE_RATE, PEAK_TARGET};
use crate::enhance::{enhance, EnhanceSettings};
use crate::error::{Error, Result};
use crate::job::{AudiobookJob, Outcome, REPORT_FAILED_LIMIT};

/// What a failed unit leaves in the final audio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GapPolicy {
    /// Skip it entirely; total duration shrinks.
    #[default]
    Omit,
    /// Insert silence for its pause so later units keep their timing.
    Silence,
}

impl FromStr for GapPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "omit" => Ok(GapPolicy::Omit),
            "silence" => Ok(GapPolicy::Silence),
            other => Err(format!("unknown gap policy '{other}' (omit, silence)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Wav,
    Mp3,
}

impl OutputFormat {
    /// Pick the format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("wav") => Ok(OutputFormat::Wav),
            Some("mp3") => Ok(OutputFormat::Mp3),
            _ => Err(Error::Assembly(format!(
                "unsupported output format for {} (use .mp3 or .wav)",
                path.display()
            ))),
        }
    }
}

pub struct Assembler {
    sample_rate: u32,
    gap_policy: GapPolicy,
    mp3_bitrate: u32,
    enhancement: Option<EnhanceSettings>,
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE)
    }
}

impl Assembler {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate, gap_policy: GapPolicy::Omit, mp3_bitrate: 192, enhancement: None }
    }

    pub fn with_gap_policy(mut self, policy: GapPolicy) -> Self {
        self.gap_policy = policy;
        self
    }

    pub fn with_mp3_bitrate(mut self, kbps: u32) -> Self {
        self.mp3_bitrate = kbps;
        self
    }

    /// Run the default enhancement chain before the final normalisation.
    pub fn with_enhancement(mut self, enabled: bool) -> Self {
        self.enhancement = enabled.then(EnhanceSettings::default);
        self
    }

    /// Concatenate and normalise.  No I/O.
    pub fn render(&self, job: &AudiobookJob) -> Result<Fragment> {
        if !job.is_complete() {
            return Err(Error::Assembly(format!(
                "job incomplete: {}/{} units processed",
                job.cursor(),
                job.total()
            )));
        }
        if job.successes() == 0 {
            let failed = job.failed_indices();
            return Err(Error::NoAudioProduced {
                total: job.total(),
                sample: failed.into_iter().take(REPORT_FAILED_LIMIT).collect(),
            });
        }

        let mut buffer: Vec<f32> = Vec::new();
        for (i, unit) in job.units().iter().enumerate() {
            let pause = Fragment::silence(unit.pause(), self.sample_rate);
            match job.result(i).map(|r| &r.outcome) {
                Some(Outcome::Ok(fragment)) => {
                    let fragment = fragment
                        .clone()
                        .resampled(self.sample_rate)
                        .with_context(|| format!("unit {i}"))
                        .map_err(Error::assembly)?;
                    buffer.extend_from_slice(&fragment.samples);
                    buffer.extend_from_slice(&pause.samples);
                }
                _ if self.gap_policy == GapPolicy::Silence => {
                    buffer.extend_from_slice(&pause.samples);
                }
                _ => {}
            }
        }

        if let Some(settings) = &self.enhancement {
            enhance(&mut buffer, self.sample_rate, settings);
        }
        normalize_peak(&mut buffer, PEAK_TARGET);
        Ok(Fragment::new(buffer, self.sample_rate))
    }

    /// Render the job and write it to its output path.  Returns the audio
    /// written.  On failure nothing is left at the output path.
    pub fn export(&self, job: &AudiobookJob) -> Result<Fragment> {
        let output = job.output_path();
        let format = OutputFormat::from_path(output)?;
        let audio = self.render(job)?;
        let bytes = self.encode(&audio, format)?;
        write_atomic(output, &bytes)
            .with_context(|| format!("cannot write {}", output.display()))
            .map_err(Error::assembly)?;
        log::info!(
            "wrote {} ({:.1} s, {} bytes)",
            output.display(),
            audio.duration().as_secs_f64(),
            bytes.len()
        );
        Ok(audio)
    }

    fn encode(&self, audio: &Fragment, format: OutputFormat) -> Result<Vec<u8>> {
        match format {
            OutputFormat::Wav => encode_wav_i16(audio).map_err(Error::assembly),
            #[cfg(feature = "mp3")]
            OutputFormat::Mp3 => {
                crate::audio::encode_mp3(audio, self.mp3_bitrate).map_err(Error::assembly)
            }
            #[cfg(not(feature = "mp3"))]
            OutputFormat::Mp3 => Err(Error::assembly(anyhow!(
                "MP3 export at {} kbps needs the `mp3` feature; use a .wav output",
                self.mp3_bitrate
            ))),
        }
    }
}

/// Write `bytes` to a temp file next to `path`, then rename it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| anyhow!(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_for;
    use crate::error::UnitSynthesisError;
    use crate::job::SynthesisResult;
    use crate::testing::units;
    use std::path::PathBuf;

    fn finished_job(texts: &[&str], ok: &[(usize, Fragment)], out: PathBuf) -> AudiobookJob {
        let mut job = AudiobookJob::new(units(texts), out);
        for (i, f) in ok.iter().rev() {
            job.record(SynthesisResult::ok(*i, f.clone())).unwrap();
        }
        for i in 0..texts.len() {
            if job.result(i).is_none() {
                job.record(SynthesisResult::failed(i, UnitSynthesisError::Timeout(60))).unwrap();
            }
        }
        job.advance_to(texts.len()).unwrap();
        job
    }

    const FIVE: [&str; 5] = ["Bir.", "İki!", "Üç?", "Dört,", "Beş"];

    #[test]
    fn test_single_success_duration_is_fragment_plus_pause() {
        let dir = tempfile::tempdir().unwrap();
        let fragment = Fragment::new(vec![0.3; 4_800], 24_000);
        let job = finished_job(&FIVE, &[(1, fragment)], dir.path().join("out.wav"));

        let audio = Assembler::new(24_000).export(&job).unwrap();
        let pause = samples_for(job.units()[1].pause(), 24_000);
        assert_eq!(pause, 14_400);
        assert_eq!(audio.len(), 4_800 + pause);
        assert!((audio.peak() - PEAK_TARGET).abs() < 1e-6);
        assert!(job.output_path().exists());
    }

    #[test]
    fn test_silence_policy_keeps_failed_pauses() {
        let fragment = Fragment::new(vec![0.3; 100], 24_000);
        let job = finished_job(&FIVE, &[(0, fragment)], PathBuf::from("x.wav"));
        let audio = Assembler::new(24_000)
            .with_gap_policy(GapPolicy::Silence)
            .render(&job)
            .unwrap();
        let pauses: usize = job.units().iter().map(|u| samples_for(u.pause(), 24_000)).sum();
        assert_eq!(audio.len(), 100 + pauses);
    }

    #[test]
    fn test_order_follows_index_not_insertion() {
        let a = Fragment::new(vec![0.1; 10], 24_000);
        let b = Fragment::new(vec![-0.2; 10], 24_000);
        let job = finished_job(&["Bir.", "İki."], &[(0, a), (1, b)], PathBuf::from("x.wav"));
        let audio = Assembler::new(24_000).render(&job).unwrap();
        assert!(audio.samples[0] > 0.0);
        let second = 10 + samples_for(job.units()[0].pause(), 24_000);
        assert!(audio.samples[second] < 0.0);
    }

    #[test]
    fn test_export_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("kitap.wav");
        let job = finished_job(
            &FIVE,
            &[(0, Fragment::new(vec![0.2; 300], 24_000)), (3, Fragment::new(vec![0.4; 500], 24_000))],
            out.clone(),
        );
        let asm = Assembler::new(24_000);
        asm.export(&job).unwrap();
        let first = std::fs::read(&out).unwrap();
        asm.export(&job).unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), first);
    }

    #[test]
    fn test_mixed_rates_resampled_before_concat() {
        let job = finished_job(
            &["Bir.", "İki."],
            &[(0, Fragment::new(vec![0.2; 1_600], 16_000)), (1, Fragment::new(vec![0.2; 2_400], 24_000))],
            PathBuf::from("x.wav"),
        );
        let audio = Assembler::new(24_000).render(&job).unwrap();
        assert_eq!(audio.sample_rate, 24_000);
        assert_eq!(audio.len(), 2_400 + 2_400 + 2 * samples_for(job.units()[0].pause(), 24_000));
    }

    #[test]
    fn test_all_failed_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.wav");
        let job = finished_job(&FIVE, &[], out.clone());
        let err = Assembler::new(24_000).export(&job).unwrap_err();
        assert!(matches!(err, Error::NoAudioProduced { total: 5, .. }));
        assert!(!out.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_write_failure_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();
        let out = blocker.join("out.wav");
        let job = finished_job(&["Bir."], &[(0, Fragment::new(vec![0.2; 10], 24_000))], out.clone());
        assert!(matches!(Assembler::new(24_000).export(&job), Err(Error::Assembly(_))));
        assert!(!out.exists());
    }

    #[cfg(feature = "mp3")]
    #[test]
    fn test_mp3_export_decodes_back() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("kitap.mp3");
        let tone: Vec<f32> = (0..24_000).map(|i| 0.3 * (i as f32 * 0.1).sin()).collect();
        let job = finished_job(&["Bir."], &[(0, Fragment::new(tone, 24_000))], out.clone());
        let audio = Assembler::new(24_000).export(&job).unwrap();

        let decoded = crate::audio::decode_bytes(std::fs::read(&out).unwrap(), Some("mp3")).unwrap();
        let secs = decoded.duration().as_secs_f64();
        assert!((secs - audio.duration().as_secs_f64()).abs() < 0.2, "{secs}");
    }

    #[test]
    fn test_enhancement_narrows_dynamics() {
        let loud = Fragment::new(vec![0.8; 24_000], 24_000);
        let quiet = Fragment::new(vec![0.05; 24_000], 24_000);
        let job = finished_job(&["Bir.", "İki."], &[(0, loud), (1, quiet)], PathBuf::from("x.wav"));

        let plain = Assembler::new(24_000).render(&job).unwrap();
        let enhanced = Assembler::new(24_000).with_enhancement(true).render(&job).unwrap();
        assert_eq!(enhanced.len(), plain.len());
        assert!((enhanced.peak() - PEAK_TARGET).abs() < 1e-6);

        let gap = |f: &Fragment| f.samples[20_000] / f.samples[24_000 + 12_000 + 20_000];
        assert!((gap(&plain) - 16.0).abs() < 1e-3);
        assert!(gap(&enhanced) < gap(&plain));
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(OutputFormat::from_path(Path::new("a.WAV")).unwrap(), OutputFormat::Wav);
        assert_eq!(OutputFormat::from_path(Path::new("a.mp3")).unwrap(), OutputFormat::Mp3);
        assert!(OutputFormat::from_path(Path::new("a.ogg")).is_err());
        assert_eq!("Silence".parse::<GapPolicy>().unwrap(), GapPolicy::Silence);
    }

    #[test]
    fn test_incomplete_job_rejected() {
        let job = AudiobookJob::new(units(&["Bir."]), "x.wav");
        assert!(matches!(Assembler::new(24_000).render(&job), Err(Error::Assembly(_))));
    }
}
