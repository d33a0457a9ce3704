//! Job state: units, per-index results, cursor, and the on-disk working
//! directory that makes a job resumable.
//!
//! Working directory layout:
//!
//! ```text
//! sesli-job-20261017-101500-123456-4242-0/
//! ├── checkpoint.json      units, style, cursor, outcome per processed index
//! ├── chunk_0000.wav       fragment of unit 0 (32-bit float, canonical rate)
//! ├── chunk_0002.wav
//! └── …
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::audio::{read_wav, write_wav_f32, Fragment};
use crate::backend::StyleOptions;
use crate::error::{Error, Result, UnitSynthesisError};
use crate::segment::SpeakableUnit;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";
const CHECKPOINT_VERSION: u32 = 1;

static WORKDIR_SEQ: AtomicUsize = AtomicUsize::new(0);

/// How many failed indices a report lists before truncating.
pub const REPORT_FAILED_LIMIT: usize = 10;

// ─────────────────────────────────────────────────────────────────────────────
// Results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Ok(Fragment),
    Failed(UnitSynthesisError),
}

/// Outcome of one unit's synthesis attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    pub unit_index: usize,
    pub outcome: Outcome,
}

impl SynthesisResult {
    pub fn ok(unit_index: usize, fragment: Fragment) -> Self {
        Self { unit_index, outcome: Outcome::Ok(fragment) }
    }

    pub fn failed(unit_index: usize, error: UnitSynthesisError) -> Self {
        Self { unit_index, outcome: Outcome::Failed(error) }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok(_))
    }

    pub fn fragment(&self) -> Option<&Fragment> {
        match &self.outcome {
            Outcome::Ok(f) => Some(f),
            Outcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&UnitSynthesisError> {
        match &self.outcome {
            Outcome::Ok(_) => None,
            Outcome::Failed(e) => Some(e),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Job
// ─────────────────────────────────────────────────────────────────────────────

/// One audiobook: ordered units in, one file out.
#[derive(Debug, Clone)]
pub struct AudiobookJob {
    units: Vec<SpeakableUnit>,
    results: BTreeMap<usize, SynthesisResult>,
    cursor: usize,
    output_path: PathBuf,
    style: StyleOptions,
}

impl AudiobookJob {
    pub fn new(units: Vec<SpeakableUnit>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            units,
            results: BTreeMap::new(),
            cursor: 0,
            output_path: output_path.into(),
            style: StyleOptions::default(),
        }
    }

    /// Style every unit of this job is rendered with, kept across resumes.
    pub fn with_style(mut self, style: StyleOptions) -> Self {
        self.style = style;
        self
    }

    pub fn style(&self) -> &StyleOptions {
        &self.style
    }

    pub fn units(&self) -> &[SpeakableUnit] {
        &self.units
    }

    pub fn total(&self) -> usize {
        self.units.len()
    }

    /// Index of the first unit not yet processed.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn set_output_path(&mut self, path: impl Into<PathBuf>) {
        self.output_path = path.into();
    }

    pub fn is_complete(&self) -> bool {
        self.cursor >= self.units.len()
    }

    /// Results keyed by unit index; iteration is always in index order.
    pub fn results(&self) -> &BTreeMap<usize, SynthesisResult> {
        &self.results
    }

    pub fn result(&self, index: usize) -> Option<&SynthesisResult> {
        self.results.get(&index)
    }

    /// Store the result for a unit that has not been processed yet.
    pub fn record(&mut self, result: SynthesisResult) -> Result<()> {
        let i = result.unit_index;
        if i >= self.units.len() {
            return Err(Error::Validation(format!(
                "result for unit {i} but job has {} units",
                self.units.len()
            )));
        }
        if i < self.cursor || self.results.contains_key(&i) {
            return Err(Error::Validation(format!("unit {i} already has a result")));
        }
        self.results.insert(i, result);
        Ok(())
    }

    /// Move the cursor forward.  Every index before `cursor` must have a
    /// result.
    pub(crate) fn advance_to(&mut self, cursor: usize) -> Result<()> {
        let cursor = cursor.min(self.units.len());
        if let Some(missing) = (self.cursor..cursor).find(|i| !self.results.contains_key(i)) {
            return Err(Error::Validation(format!("cannot advance past unit {missing} without a result")));
        }
        self.cursor = cursor.max(self.cursor);
        Ok(())
    }

    pub fn successes(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.results.values().filter(|r| !r.is_ok()).map(|r| r.unit_index).collect()
    }

    pub fn report(&self) -> JobReport {
        JobReport {
            total: self.units.len(),
            succeeded: self.successes(),
            failed: self.failed_indices(),
            output: None,
            duration: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Report
// ─────────────────────────────────────────────────────────────────────────────

/// What the caller is told when a job ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub total: usize,
    pub succeeded: usize,
    /// Indices of failed units (full list; `Display` truncates).
    pub failed: Vec<usize>,
    pub output: Option<PathBuf>,
    pub duration: Option<Duration>,
}

impl JobReport {
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} units synthesised", self.succeeded, self.total)?;
        if let Some(d) = self.duration {
            write!(f, ", {:.1} s of audio", d.as_secs_f64())?;
        }
        if let Some(p) = &self.output {
            write!(f, " → {}", p.display())?;
        }
        if !self.failed.is_empty() {
            let shown: Vec<String> =
                self.failed.iter().take(REPORT_FAILED_LIMIT).map(|i| i.to_string()).collect();
            write!(f, "; {} failed: {}", self.failed.len(), shown.join(", "))?;
            if self.failed.len() > REPORT_FAILED_LIMIT {
                write!(f, " (+{} more)", self.failed.len() - REPORT_FAILED_LIMIT)?;
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Working directory & checkpoint
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SavedOutcome {
    Ok,
    Failed { error: UnitSynthesisError },
}

#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    version: u32,
    output_path: PathBuf,
    #[serde(default)]
    style: StyleOptions,
    cursor: usize,
    units: Vec<SpeakableUnit>,
    outcomes: BTreeMap<usize, SavedOutcome>,
}

/// Scoped per-job directory.  Removed on drop unless [`WorkDir::keep`] was
/// called.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    keep: bool,
}

impl WorkDir {
    /// Create a fresh, uniquely named directory under `root` (system temp
    /// dir when `None`).
    pub fn create(root: Option<&Path>) -> Result<Self> {
        let root = root.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&root)?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S-%6f");
        let seq = WORKDIR_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = root.join(format!("sesli-job-{stamp}-{}-{seq}", std::process::id()));
        std::fs::create_dir(&path)?;
        log::debug!("working directory {}", path.display());
        Ok(Self { path, keep: false })
    }

    /// Adopt an existing directory holding a checkpoint.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.join(CHECKPOINT_FILE).is_file() {
            return Err(Error::Validation(format!(
                "{} has no {CHECKPOINT_FILE}",
                path.display()
            )));
        }
        Ok(Self { path: path.to_path_buf(), keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leave the directory on disk when this value is dropped.
    pub fn keep(&mut self) {
        self.keep = true;
    }

    pub fn chunk_path(&self, index: usize) -> PathBuf {
        self.path.join(format!("chunk_{index:04}.wav"))
    }

    pub fn store_fragment(&self, index: usize, fragment: &Fragment) -> Result<()> {
        write_wav_f32(fragment, &self.chunk_path(index))
            .map_err(|e| Error::Io(std::io::Error::other(format!("{e:#}"))))
    }

    pub fn load_fragment(&self, index: usize) -> anyhow::Result<Fragment> {
        let path = self.chunk_path(index);
        read_wav(&path).with_context(|| format!("fragment {} unreadable", path.display()))
    }

    /// Write `checkpoint.json` for `job`, replacing the previous one
    /// atomically.
    pub fn save_checkpoint(&self, job: &AudiobookJob) -> Result<()> {
        let outcomes = job
            .results()
            .iter()
            .map(|(&i, r)| {
                let saved = match &r.outcome {
                    Outcome::Ok(_) => SavedOutcome::Ok,
                    Outcome::Failed(e) => SavedOutcome::Failed { error: e.clone() },
                };
                (i, saved)
            })
            .collect();
        let checkpoint = Checkpoint {
            version: CHECKPOINT_VERSION,
            output_path: job.output_path().to_path_buf(),
            style: *job.style(),
            cursor: job.cursor(),
            units: job.units().to_vec(),
            outcomes,
        };
        let json = serde_json::to_vec_pretty(&checkpoint)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.path)?;
        tmp.write_all(&json)?;
        tmp.persist(self.path.join(CHECKPOINT_FILE)).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Rebuild the job from `checkpoint.json` and the stored fragments.
    /// A fragment that can no longer be read becomes a failed unit.
    pub fn load_checkpoint(&self) -> Result<AudiobookJob> {
        let path = self.path.join(CHECKPOINT_FILE);
        let bytes = std::fs::read(&path)?;
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| Error::Validation(format!("{}: {e}", path.display())))?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(Error::Validation(format!(
                "unsupported checkpoint version {}",
                checkpoint.version
            )));
        }

        let mut job =
            AudiobookJob::new(checkpoint.units, checkpoint.output_path).with_style(checkpoint.style);
        for (i, saved) in checkpoint.outcomes {
            let result = match saved {
                SavedOutcome::Ok => match self.load_fragment(i) {
                    Ok(fragment) => SynthesisResult::ok(i, fragment),
                    Err(e) => {
                        log::warn!("unit {i}: {e:#}");
                        SynthesisResult::failed(i, UnitSynthesisError::Backend(format!("{e:#}")))
                    }
                },
                SavedOutcome::Failed { error } => SynthesisResult::failed(i, error),
            };
            job.record(result)?;
        }
        job.advance_to(checkpoint.cursor)?;
        log::info!(
            "checkpoint loaded: {}/{} units processed, {} ok",
            job.cursor(),
            job.total(),
            job.successes()
        );
        Ok(job)
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("failed to remove {}: {e}", self.path.display());
            }
        }
    }
}
