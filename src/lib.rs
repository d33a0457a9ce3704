//! # sesli
//!
//! Turn long texts and PDFs into narrated audiobooks, one sentence at a
//! time, with a local voice-cloning model or a cloud TTS provider.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use sesli::{Pipeline, Settings, VoiceRef, ModelRuntime, build_backend};
//! use sesli::backend::local::command_loader;
//!
//! let settings = Settings::load(Path::new("config.json")).unwrap();
//! let runtime = ModelRuntime::new(command_loader(
//!     settings.local_model.clone(),
//!     settings.local_timeout(),
//! ));
//!
//! let voice = VoiceRef::Reference("anlatici.wav".into());
//! let backend = build_backend(&voice, &settings, &runtime).unwrap();
//!
//! let report = Pipeline::new(settings)
//!     .run("Bir varmış, bir yokmuş. Evvel zaman içinde…", backend, Path::new("kitap.wav"))
//!     .unwrap();
//! println!("{report}");
//! ```
//!
//! ## Pipeline
//! 1. **Sources** — `.txt` / `.md` read directly, PDFs through `pdftotext`.
//! 2. **Cleaning** — accents folded (Turkish letters kept), stray symbols
//!    dropped, whitespace and punctuation spacing fixed.
//! 3. **Segmentation** — sentence-like units with a kind and a trailing
//!    pause; abbreviations and numbers like `125.000` never split a
//!    sentence.
//! 4. **Dispatch** — units go to the backend in batches; a failed unit is
//!    recorded and skipped, progress is checkpointed after every batch.
//! 5. **Assembly** — fragments resampled to the session rate, joined in
//!    index order with their pauses, peak-normalised, written atomically
//!    as MP3 (default `mp3` feature) or WAV, optionally after a noise
//!    gate / loudness / compression pass.
//!
//! ## Backends
//! | Voice                    | Backend                                   |
//! |--------------------------|-------------------------------------------|
//! | reference recording      | local cloning model (external command)    |
//! | ElevenLabs voice/profile | `text-to-speech` REST endpoint            |
//! | OpenAI voice             | `audio/speech` REST endpoint              |
//!
//! Any of them can be wrapped by the style path (speed, pitch, emotion).

pub mod assemble;
pub mod audio;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod enhance;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod preprocess;
pub mod queue;
pub mod runtime;
pub mod segment;
pub mod source;
pub mod voice;

#[cfg(test)]
mod testing;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use assemble::{Assembler, GapPolicy};
pub use audio::{Fragment, DEFAULT_SAMPLE_RATE};
pub use backend::{build_backend, select_backend, StyleOptions, SynthesisBackend, VoiceRef};
pub use config::Settings;
pub use dispatch::{CancelToken, Dispatcher, ProgressSink};
pub use error::{Error, Result, UnitSynthesisError};
pub use job::{AudiobookJob, JobReport, SynthesisResult};
pub use pipeline::Pipeline;
pub use preprocess::TextCleaner;
pub use queue::BatchQueue;
pub use runtime::ModelRuntime;
pub use segment::{Segmenter, SpeakableUnit};
