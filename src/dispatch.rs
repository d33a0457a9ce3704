//! Synthesis dispatcher: drives a backend over a job's units.
//!
//! Units are sent in backend-sized batches starting at the job's cursor.
//! Each batch's results are recorded by unit index, written to the working
//! directory, and checkpointed before the next batch starts, so the cursor
//! on disk always matches completed work.  A failing unit is recorded and
//! skipped; only a job with zero successes fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::audio::{Fragment, DEFAULT_SAMPLE_RATE};
use crate::backend::{StyleOptions, SynthesisBackend};
use crate::error::{Error, Result, UnitSynthesisError};
use crate::job::{AudiobookJob, SynthesisResult, WorkDir};
use crate::segment::SpeakableUnit;

// ─────────────────────────────────────────────────────────────────────────────
// Progress
// ─────────────────────────────────────────────────────────────────────────────

/// When progress is reported.  The final unit is always reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressCadence {
    /// Every `n` processed units (every batch when `0`).
    EveryUnits(usize),
    /// Every `n` percent.
    Percent(u8),
}

impl Default for ProgressCadence {
    fn default() -> Self {
        ProgressCadence::EveryUnits(5)
    }
}

impl ProgressCadence {
    /// True when going from `before` to `after` processed units crosses a
    /// reporting threshold.
    pub fn crosses(&self, before: usize, after: usize, total: usize) -> bool {
        if after >= total {
            return true;
        }
        match *self {
            ProgressCadence::EveryUnits(0) => true,
            ProgressCadence::EveryUnits(n) => after / n > before / n,
            ProgressCadence::Percent(p) => {
                let step = p.max(1) as usize;
                let bucket = |x: usize| x * 100 / total.max(1) / step;
                bucket(after) > bucket(before)
            }
        }
    }
}

/// Receives `(fraction_complete, message)` at the configured cadence.
pub trait ProgressSink {
    fn progress(&self, fraction: f32, message: &str);
}

impl<F: Fn(f32, &str)> ProgressSink for F {
    fn progress(&self, fraction: f32, message: &str) {
        self(fraction, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressUpdate {
    pub processed: usize,
    pub total: usize,
    pub eta: Option<Duration>,
}

impl ProgressUpdate {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            1.0
        } else {
            self.processed as f32 / self.total as f32
        }
    }

    pub fn message(&self) -> String {
        let mut msg = format!("synthesised {}/{} units", self.processed, self.total);
        if let Some(eta) = self.eta.filter(|_| self.processed < self.total) {
            msg.push_str(&format!(", about {} remaining", format_eta(eta)));
        }
        msg
    }
}

/// `average time per unit so far × remaining units`.  `None` until at least
/// one unit has been timed.
pub fn estimate_remaining(elapsed: Duration, timed_units: usize, remaining: usize) -> Option<Duration> {
    if timed_units == 0 {
        return None;
    }
    Some(elapsed.mul_f64(remaining as f64 / timed_units as f64))
}

pub fn format_eta(d: Duration) -> String {
    let secs = d.as_secs();
    match (secs / 3600, secs % 3600 / 60, secs % 60) {
        (0, 0, s) => format!("{s}s"),
        (0, m, s) => format!("{m}m {s:02}s"),
        (h, m, _) => format!("{h}h {m:02}m"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cancellation
// ─────────────────────────────────────────────────────────────────────────────

/// Cooperative stop signal, checked between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

pub struct Dispatcher<'a> {
    backend: &'a dyn SynthesisBackend,
    style: StyleOptions,
    sample_rate: u32,
    cadence: ProgressCadence,
    progress: Option<&'a dyn ProgressSink>,
    cancel: Option<CancelToken>,
    workdir: Option<&'a WorkDir>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(backend: &'a dyn SynthesisBackend, style: StyleOptions) -> Self {
        Self {
            backend,
            style,
            sample_rate: DEFAULT_SAMPLE_RATE,
            cadence: ProgressCadence::default(),
            progress: None,
            cancel: None,
            workdir: None,
        }
    }

    /// Canonical rate every fragment is converted to before it is stored.
    pub fn with_sample_rate(mut self, rate: u32) -> Self {
        self.sample_rate = rate;
        self
    }

    pub fn with_cadence(mut self, cadence: ProgressCadence) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Persist fragments and a checkpoint here after every batch.
    pub fn with_workdir(mut self, workdir: &'a WorkDir) -> Self {
        self.workdir = Some(workdir);
        self
    }

    /// Process every unit from the job's cursor to the end.
    ///
    /// Fails with [`Error::Interrupted`] when cancelled (the checkpoint is
    /// current) and with [`Error::NoAudioProduced`] when no unit succeeded.
    pub fn run(&self, job: &mut AudiobookJob) -> Result<()> {
        let total = job.total();
        let batch_size = self.backend.batch_size().max(1);
        let resumed_at = job.cursor();
        let started = Instant::now();

        if resumed_at > 0 {
            log::info!("resuming at unit {resumed_at}/{total}");
        }

        while job.cursor() < total {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                log::warn!("cancelled at unit {}/{total}", job.cursor());
                return Err(Error::Interrupted {
                    cursor: job.cursor(),
                    total,
                    workdir: self.workdir.map(|w| w.path().to_path_buf()).unwrap_or_default(),
                });
            }

            let start = job.cursor();
            let end = (start + batch_size).min(total);
            let responses = {
                let batch: Vec<&SpeakableUnit> = job.units()[start..end].iter().collect();
                self.backend.synthesize_batch(&batch, &self.style)
            };

            let results: Vec<SynthesisResult> = if responses.len() != end - start {
                let why = format!("expected {} results, got {}", end - start, responses.len());
                log::warn!("units {start}..{end}: {why}");
                (start..end)
                    .map(|i| SynthesisResult::failed(i, UnitSynthesisError::MalformedBatch(why.clone())))
                    .collect()
            } else {
                (start..end).zip(responses).map(|(i, r)| self.settle(i, r)).collect()
            };

            for result in results {
                if let (Some(wd), Some(fragment)) = (self.workdir, result.fragment()) {
                    wd.store_fragment(result.unit_index, fragment)?;
                }
                job.record(result)?;
            }
            job.advance_to(end)?;
            if let Some(wd) = self.workdir {
                wd.save_checkpoint(job)?;
            }

            if self.cadence.crosses(start, end, total) {
                let update = ProgressUpdate {
                    processed: end,
                    total,
                    eta: estimate_remaining(started.elapsed(), end - resumed_at, total - end),
                };
                let message = update.message();
                log::info!("{message}");
                if let Some(sink) = self.progress {
                    sink.progress(update.fraction(), &message);
                }
            }
        }

        let succeeded = job.successes();
        if succeeded == 0 {
            let failed = job.failed_indices();
            return Err(Error::NoAudioProduced {
                total,
                sample: failed.into_iter().take(crate::job::REPORT_FAILED_LIMIT).collect(),
            });
        }
        log::info!("{succeeded}/{total} units synthesised in {:.1?}", started.elapsed());
        Ok(())
    }

    /// Turn one backend response into a recorded result.
    fn settle(&self, index: usize, response: anyhow::Result<Fragment>) -> SynthesisResult {
        let outcome = match response {
            Ok(f) if f.is_empty() => Err(UnitSynthesisError::EmptyOutput),
            Ok(f) => f
                .resampled(self.sample_rate)
                .map_err(|e| UnitSynthesisError::Backend(format!("resampling failed: {e:#}"))),
            Err(e) => Err(UnitSynthesisError::from_backend(&e)),
        };
        match outcome {
            Ok(fragment) => SynthesisResult::ok(index, fragment),
            Err(err) => {
                log::warn!("unit {index} failed: {err}");
                SynthesisResult::failed(index, err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{units, ScriptedBackend};
    use std::cell::RefCell;

    #[test]
    fn test_failed_unit_does_not_stop_job() {
        let backend = ScriptedBackend::new().failing(&["İki."]);
        let mut job = AudiobookJob::new(units(&["Bir.", "İki.", "Üç."]), "out.wav");
        Dispatcher::new(&backend, StyleOptions::default()).run(&mut job).unwrap();

        assert_eq!(job.cursor(), 3);
        assert_eq!(job.successes(), 2);
        assert_eq!(job.failed_indices(), vec![1]);
        assert!(matches!(job.result(1).unwrap().error(), Some(UnitSynthesisError::Backend(_))));
    }

    #[test]
    fn test_all_failed_is_no_audio() {
        let backend = ScriptedBackend::new().failing(&["Bir.", "İki."]);
        let mut job = AudiobookJob::new(units(&["Bir.", "İki."]), "out.wav");
        let err = Dispatcher::new(&backend, StyleOptions::default()).run(&mut job).unwrap_err();
        assert!(matches!(err, Error::NoAudioProduced { total: 2, .. }));
    }

    #[test]
    fn test_batching_keeps_index_mapping() {
        let backend = ScriptedBackend::new().with_batch_size(3).failing(&["Dört."]);
        let texts = ["Bir.", "İki.", "Üç.", "Dört.", "Beş."];
        let mut job = AudiobookJob::new(units(&texts), "out.wav");
        Dispatcher::new(&backend, StyleOptions::default()).run(&mut job).unwrap();

        assert_eq!(backend.calls(), 2);
        assert_eq!(job.failed_indices(), vec![3]);
        // each fragment's length encodes the unit's text length
        for (i, t) in texts.iter().enumerate().filter(|(i, _)| *i != 3) {
            assert_eq!(job.result(i).unwrap().fragment().unwrap().len(), backend.samples_for(t));
        }
    }

    #[test]
    fn test_short_batch_marks_units_malformed() {
        let backend = ScriptedBackend::new().with_batch_size(2).short_batches();
        let mut job = AudiobookJob::new(units(&["Bir.", "İki."]), "out.wav");
        let err = Dispatcher::new(&backend, StyleOptions::default()).run(&mut job).unwrap_err();
        assert!(matches!(err, Error::NoAudioProduced { .. }));
        assert!(matches!(
            job.result(0).unwrap().error(),
            Some(UnitSynthesisError::MalformedBatch(_))
        ));
    }

    #[test]
    fn test_empty_fragment_is_failure() {
        let backend = ScriptedBackend::new().silent_on(&["İki."]);
        let mut job = AudiobookJob::new(units(&["Bir.", "İki."]), "out.wav");
        Dispatcher::new(&backend, StyleOptions::default()).run(&mut job).unwrap();
        assert_eq!(job.result(1).unwrap().error(), Some(&UnitSynthesisError::EmptyOutput));
    }

    #[test]
    fn test_fragments_resampled_to_session_rate() {
        let backend = ScriptedBackend::new().with_rate(16_000);
        let mut job = AudiobookJob::new(units(&["Merhaba!"]), "out.wav");
        Dispatcher::new(&backend, StyleOptions::default())
            .with_sample_rate(24_000)
            .run(&mut job)
            .unwrap();
        let f = job.result(0).unwrap().fragment().unwrap();
        assert_eq!(f.sample_rate, 24_000);
        assert_eq!(f.len(), backend.samples_for("Merhaba!") * 3 / 2);
    }

    #[test]
    fn test_cancel_checkpoints_and_resumes() {
        let root = tempfile::tempdir().unwrap();
        let wd = WorkDir::create(Some(root.path())).unwrap();
        let token = CancelToken::new();
        let backend = ScriptedBackend::new().cancel_after(2, token.clone());
        let texts = ["Bir.", "İki.", "Üç.", "Dört."];
        let mut job = AudiobookJob::new(units(&texts), "out.wav");

        let err = Dispatcher::new(&backend, StyleOptions::default())
            .with_workdir(&wd)
            .with_cancel(token)
            .run(&mut job)
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted { cursor: 2, total: 4, .. }));

        let mut restored = wd.load_checkpoint().unwrap();
        assert_eq!(restored.cursor(), 2);
        assert!(wd.chunk_path(1).exists());

        let fresh = ScriptedBackend::new();
        Dispatcher::new(&fresh, StyleOptions::default())
            .with_workdir(&wd)
            .run(&mut restored)
            .unwrap();
        assert_eq!(fresh.units_seen(), vec!["Üç.".to_string(), "Dört.".to_string()]);
        assert_eq!(restored.successes(), 4);
    }

    #[test]
    fn test_progress_cadence() {
        let seen = RefCell::new(Vec::new());
        let sink = |fraction: f32, _msg: &str| seen.borrow_mut().push(fraction);
        let backend = ScriptedBackend::new();
        let texts: Vec<String> = (0..10).map(|i| format!("Cümle {i}.")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        let mut job = AudiobookJob::new(units(&refs), "out.wav");
        Dispatcher::new(&backend, StyleOptions::default())
            .with_cadence(ProgressCadence::EveryUnits(5))
            .with_progress(&sink)
            .run(&mut job)
            .unwrap();
        assert_eq!(*seen.borrow(), vec![0.5, 1.0]);
    }

    #[test]
    fn test_cadence_thresholds() {
        let c = ProgressCadence::Percent(25);
        assert!(!c.crosses(0, 2, 10));
        assert!(c.crosses(2, 3, 10));
        assert!(c.crosses(8, 10, 10));
        assert!(ProgressCadence::EveryUnits(0).crosses(0, 1, 10));
    }

    #[test]
    fn test_eta() {
        assert_eq!(estimate_remaining(Duration::from_secs(10), 0, 5), None);
        assert_eq!(
            estimate_remaining(Duration::from_secs(10), 5, 20),
            Some(Duration::from_secs(40))
        );
        assert_eq!(format_eta(Duration::from_secs(45)), "45s");
        assert_eq!(format_eta(Duration::from_secs(200)), "3m 20s");
        assert_eq!(format_eta(Duration::from_secs(3720)), "1h 02m");
    }
}
