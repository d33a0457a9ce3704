//! Error types.
//!
//! Two layers:
//!
//! | Type                   | Scope      | Propagated?                          |
//! |------------------------|------------|--------------------------------------|
//! | [`UnitSynthesisError`] | one unit   | never — stored in the job's results  |
//! | [`Error`]              | whole job  | always — returned to the caller      |
//!
//! Internal helpers (decoding, encoding, HTTP, subprocesses) return
//! `anyhow::Result` and are converted at the job boundary.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Job-level failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Input rejected before any synthesis work started.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Every unit failed; nothing was written.
    #[error("no audio produced: all {total} units failed (first failures: {sample:?})")]
    NoAudioProduced { total: usize, sample: Vec<usize> },

    /// Concatenation or export failed; any partial output has been removed.
    #[error("assembly failed: {0}")]
    Assembly(String),

    /// The backend cannot be reached or initialised.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The job was cancelled between batches.  Its working directory and
    /// checkpoint were kept so it can be resumed.
    #[error("interrupted at unit {cursor}/{total}; resume from {}", .workdir.display())]
    Interrupted {
        cursor: usize,
        total: usize,
        workdir: PathBuf,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn assembly(err: anyhow::Error) -> Self {
        Error::Assembly(format!("{err:#}"))
    }

    pub(crate) fn backend(err: anyhow::Error) -> Self {
        Error::BackendUnavailable(format!("{err:#}"))
    }
}

/// Why a single unit has no audio.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnitSynthesisError {
    #[error("timed out after {0} s")]
    Timeout(u64),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("backend returned no audio")]
    EmptyOutput,

    #[error("batch response malformed: {0}")]
    MalformedBatch(String),
}

impl UnitSynthesisError {
    /// Classify a backend error.  Timeouts are recognised by the marker
    /// [`TimedOut`] anywhere in the chain; everything else is a backend error.
    pub fn from_backend(err: &anyhow::Error) -> Self {
        if let Some(t) = err.chain().find_map(|e| e.downcast_ref::<TimedOut>()) {
            return UnitSynthesisError::Timeout(t.0);
        }
        UnitSynthesisError::Backend(format!("{err:#}"))
    }
}

/// Marker error raised by backends when a call exceeds its deadline
/// (seconds).
#[derive(Debug, Error)]
#[error("deadline of {0} s exceeded")]
pub struct TimedOut(pub u64);

/// Result type for job-level operations.
pub type Result<T> = std::result::Result<T, Error>;
