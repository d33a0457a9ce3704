//! Runtime settings — `config.json` schema and credential lookup.
//!
//! Every field has a default, so a missing file or a partial file is fine.
//! API keys resolve in this order: explicit value → environment variable →
//! config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::assemble::GapPolicy;
use crate::audio::DEFAULT_SAMPLE_RATE;
use crate::dispatch::ProgressCadence;
use crate::error::{Error, Result};
use crate::runtime::Device;
use crate::segment::DEFAULT_MAX_UNITS;

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "config.json";

pub const ELEVENLABS_KEY_ENV: &str = "ELEVENLABS_API_KEY";
pub const OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

/// Deserialised `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Language code passed to every backend.
    pub language: String,

    /// Canonical session rate; every fragment is resampled to it.
    pub sample_rate: u32,

    /// Refuse texts that segment into more units than this.
    pub max_units: usize,

    /// What a failed unit leaves behind in the final audio.
    pub gap_policy: GapPolicy,

    /// MP3 export bitrate (kbps).
    pub mp3_bitrate: u32,

    /// Run the noise gate / loudness / compression pass on the final audio.
    pub enhance: bool,

    /// How often progress is reported during synthesis.
    pub progress: ProgressCadence,

    /// Per-call deadline for cloud requests (seconds).
    pub cloud_timeout_secs: u64,

    /// Per-call deadline for the local synthesiser (seconds).
    pub local_timeout_secs: u64,

    pub local_model: LocalModelSettings,

    /// Root for resumable working directories.  `None` → system temp dir.
    pub work_root: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevenlabs_api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub openai_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            language: "tr".to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_units: DEFAULT_MAX_UNITS,
            gap_policy: GapPolicy::default(),
            mp3_bitrate: 192,
            enhance: false,
            progress: ProgressCadence::default(),
            cloud_timeout_secs: 60,
            local_timeout_secs: 300,
            local_model: LocalModelSettings::default(),
            work_root: None,
            elevenlabs_api_key: None,
            openai_api_key: None,
        }
    }
}

/// How to launch the local voice-cloning worker.
///
/// The worker is started once per loaded model and serves every unit of
/// every job until the model is released.  `args` may contain the
/// placeholders `{model}` and `{device}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalModelSettings {
    pub model_id: String,
    pub program: String,
    pub args: Vec<String>,
    pub device: Device,
}

impl Default for LocalModelSettings {
    fn default() -> Self {
        let args = ["scripts/xtts_worker.py", "--model", "{model}", "--device", "{device}"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            model_id: "tts_models/multilingual/multi-dataset/xtts_v2".to_string(),
            program: "python3".to_string(),
            args,
            device: Device::Cpu,
        }
    }
}

impl Settings {
    /// Load settings from `path`.  A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let bytes = std::fs::read(path)?;
        let settings: Settings = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::Config("sample_rate must be positive".into()));
        }
        if self.max_units == 0 {
            return Err(Error::Config("max_units must be positive".into()));
        }
        if self.local_model.program.trim().is_empty() {
            return Err(Error::Config("local_model.program is empty".into()));
        }
        Ok(())
    }

    pub fn cloud_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud_timeout_secs)
    }

    pub fn local_timeout(&self) -> Duration {
        Duration::from_secs(self.local_timeout_secs)
    }

    /// ElevenLabs key: explicit → `$ELEVENLABS_API_KEY` → config file.
    pub fn elevenlabs_key(&self, explicit: Option<&str>) -> Option<String> {
        resolve_key(explicit, ELEVENLABS_KEY_ENV, self.elevenlabs_api_key.as_deref())
    }

    /// OpenAI key: explicit → `$OPENAI_API_KEY` → config file.
    pub fn openai_key(&self, explicit: Option<&str>) -> Option<String> {
        resolve_key(explicit, OPENAI_KEY_ENV, self.openai_api_key.as_deref())
    }
}

fn resolve_key(explicit: Option<&str>, env: &str, stored: Option<&str>) -> Option<String> {
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };
    explicit
        .and_then(non_empty)
        .or_else(|| std::env::var(env).ok().as_deref().and_then(non_empty))
        .or_else(|| stored.and_then(non_empty))
}

/// Store the ElevenLabs key in the config file at `path`, keeping every
/// other key in it untouched.
pub fn save_elevenlabs_key(path: &Path, api_key: &str) -> Result<()> {
    let mut doc = if path.exists() {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice::<serde_json::Value>(&bytes)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?
    } else {
        serde_json::json!({})
    };
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| Error::Config(format!("{} is not a JSON object", path.display())))?;
    obj.insert("elevenlabs_api_key".into(), serde_json::Value::String(api_key.to_string()));

    let text = serde_json::to_string_pretty(&doc)
        .map_err(|e| Error::Config(format!("cannot serialise config: {e}")))?;
    std::fs::write(path, text)?;
    log::info!("saved ElevenLabs API key to {}", path.display());
    Ok(())
}
