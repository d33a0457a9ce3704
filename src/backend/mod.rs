//! Synthesis backends — one capability, several providers.
//!
//! | Backend                          | Voice given as                | Output      |
//! |----------------------------------|-------------------------------|-------------|
//! | [`local::LocalCloneBackend`]     | reference WAV (10–60 s)       | model rate  |
//! | [`cloud::ElevenLabsBackend`]     | catalogue voice or profile    | MP3 → PCM   |
//! | [`cloud::OpenAiBackend`]         | preset voice name             | MP3 → PCM   |
//! | [`style::StyleBackend`]          | wraps any of the above        | inner rate  |
//!
//! The dispatcher only sees [`SynthesisBackend`].  Which concrete backend
//! serves a job is decided once, up front, by [`select_backend`].

pub mod cloud;
pub mod local;
pub mod style;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::audio::Fragment;
use crate::config::Settings;
use crate::error::Error;
use crate::runtime::{ModelKey, ModelRuntime};
use crate::segment::SpeakableUnit;

pub use style::StyleBackend;

// ─────────────────────────────────────────────────────────────────────────────
// Style options
// ─────────────────────────────────────────────────────────────────────────────

pub const SPEED_RANGE: (f32, f32) = (0.5, 2.0);
pub const PITCH_RANGE: (i32, i32) = (-5, 5);

/// Coarse emotional colouring, applied as a gain offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Sad,
    Excited,
}

impl Emotion {
    pub fn gain_db(&self) -> f32 {
        match self {
            Emotion::Neutral => 0.0,
            Emotion::Happy => 1.0,
            Emotion::Sad => -2.0,
            Emotion::Excited => 2.0,
        }
    }
}

impl FromStr for Emotion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "neutral" => Ok(Emotion::Neutral),
            "happy" => Ok(Emotion::Happy),
            "sad" => Ok(Emotion::Sad),
            "excited" => Ok(Emotion::Excited),
            other => Err(format!("unknown emotion '{other}' (neutral, happy, sad, excited)")),
        }
    }
}

/// Global style for a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StyleOptions {
    /// Speaking-rate multiplier, 0.5–2.0.
    pub speed: f32,
    /// Pitch shift in steps of 0.1 octave, -5–5.
    pub pitch: i32,
    pub emotion: Emotion,
}

impl Default for StyleOptions {
    fn default() -> Self {
        Self { speed: 1.0, pitch: 0, emotion: Emotion::Neutral }
    }
}

impl StyleOptions {
    pub fn validate(&self) -> crate::Result<()> {
        if !(SPEED_RANGE.0..=SPEED_RANGE.1).contains(&self.speed) {
            return Err(Error::Validation(format!(
                "speed {} outside {}–{}",
                self.speed, SPEED_RANGE.0, SPEED_RANGE.1
            )));
        }
        if !(PITCH_RANGE.0..=PITCH_RANGE.1).contains(&self.pitch) {
            return Err(Error::Validation(format!(
                "pitch {} outside {}–{}",
                self.pitch, PITCH_RANGE.0, PITCH_RANGE.1
            )));
        }
        Ok(())
    }

    /// True when audio has to go through the style post-processing path.
    pub fn needs_processing(&self) -> bool {
        self.speed != 1.0 || self.pitch != 0 || self.emotion != Emotion::Neutral
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend capability
// ─────────────────────────────────────────────────────────────────────────────

/// Anything that can turn one unit of text into audio.
pub trait SynthesisBackend: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> String;

    /// Check credentials, model and voice before any unit is processed.
    fn prepare(&self) -> Result<()>;

    fn synthesize(&self, unit: &SpeakableUnit, style: &StyleOptions) -> Result<Fragment>;

    /// Units per call when the backend can batch.
    fn batch_size(&self) -> usize {
        1
    }

    /// Synthesise several units in one call.  Must return exactly one
    /// result per input, in input order.
    fn synthesize_batch(
        &self,
        units: &[&SpeakableUnit],
        style: &StyleOptions,
    ) -> Vec<Result<Fragment>> {
        units.iter().map(|u| self.synthesize(u, style)).collect()
    }

    /// Rough cost per unit, for the pre-run estimate.
    fn seconds_per_unit(&self) -> f64 {
        1.0
    }
}

/// Route a job: wrap `base` in the style path when `style` asks for any
/// speed, pitch or emotion change, otherwise use it as is.
pub fn select_backend(
    base: Arc<dyn SynthesisBackend>,
    style: &StyleOptions,
) -> Arc<dyn SynthesisBackend> {
    if style.needs_processing() {
        log::info!(
            "style path: speed {}x, pitch {:+}, emotion {:?}",
            style.speed,
            style.pitch,
            style.emotion
        );
        Arc::new(StyleBackend::new(base))
    } else {
        base
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Voice selection
// ─────────────────────────────────────────────────────────────────────────────

/// Which voice narrates a job, and therefore which backend serves it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum VoiceRef {
    /// Clone the timbre of a reference recording with the local model.
    Reference(PathBuf),
    /// ElevenLabs catalogue voice (`ada`, `emre`, …).
    ElevenLabs(String),
    /// ElevenLabs named profile (`story_teller_male`, …).
    Profile(String),
    /// OpenAI preset voice (`alloy`, `nova`, …).
    OpenAi(String),
}

impl fmt::Display for VoiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceRef::Reference(p) => write!(f, "reference {}", p.display()),
            VoiceRef::ElevenLabs(v) => write!(f, "elevenlabs {v}"),
            VoiceRef::Profile(p) => write!(f, "elevenlabs profile {p}"),
            VoiceRef::OpenAi(v) => write!(f, "openai {v}"),
        }
    }
}

/// Build the plain backend for `voice`.
///
/// The local model is taken from `runtime` (loaded on first use, reused
/// afterwards).  Load failures and missing credentials surface as
/// [`Error::BackendUnavailable`].
pub fn build_backend(
    voice: &VoiceRef,
    settings: &Settings,
    runtime: &ModelRuntime,
) -> crate::Result<Arc<dyn SynthesisBackend>> {
    let backend: Arc<dyn SynthesisBackend> = match voice {
        VoiceRef::Reference(path) => {
            let key = ModelKey::new(&settings.local_model.model_id, settings.local_model.device);
            let model = runtime.acquire(&key).map_err(Error::backend)?;
            Arc::new(local::LocalCloneBackend::new(model, path.clone(), &settings.language))
        }
        VoiceRef::ElevenLabs(name) => Arc::new(
            cloud::ElevenLabsBackend::new(settings.elevenlabs_key(None), settings.cloud_timeout())
                .map_err(Error::backend)?
                .with_voice(name),
        ),
        VoiceRef::Profile(profile) => Arc::new(
            cloud::ElevenLabsBackend::new(settings.elevenlabs_key(None), settings.cloud_timeout())
                .map_err(Error::backend)?
                .with_profile(profile)
                .map_err(Error::backend)?,
        ),
        VoiceRef::OpenAi(name) => Arc::new(
            cloud::OpenAiBackend::new(settings.openai_key(None), settings.cloud_timeout())
                .map_err(Error::backend)?
                .with_voice(name),
        ),
    };
    Ok(backend)
}
