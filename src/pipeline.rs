//! End-to-end job: text → units → fragments → one audio file.
//!
//! ```text
//! segment ──► validate ceiling ──► prepare backend ──► dispatch ──► assemble
//!    │               │                    │                │            │
//!    │        Validation (no calls)  BackendUnavailable    │     NoAudioProduced
//!    │                                                     │        Assembly
//!    └──────────────── checkpoint after every batch ◄──────┘
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::assemble::Assembler;
use crate::backend::{select_backend, StyleOptions, SynthesisBackend};
use crate::config::Settings;
use crate::dispatch::{format_eta, CancelToken, Dispatcher, ProgressSink};
use crate::error::{Error, Result};
use crate::job::{AudiobookJob, JobReport, WorkDir};
use crate::segment::{Segmenter, SpeakableUnit};

pub struct Pipeline<'a> {
    settings: Settings,
    segmenter: Segmenter,
    style: StyleOptions,
    progress: Option<&'a dyn ProgressSink>,
    cancel: Option<CancelToken>,
}

impl<'a> Pipeline<'a> {
    pub fn new(settings: Settings) -> Self {
        let segmenter = Segmenter::new().with_max_units(settings.max_units);
        Self { settings, segmenter, style: StyleOptions::default(), progress: None, cancel: None }
    }

    pub fn with_style(mut self, style: StyleOptions) -> Self {
        self.style = style;
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

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Split `text` into units, enforcing the unit ceiling.
    pub fn segment(&self, text: &str) -> Result<Vec<SpeakableUnit>> {
        let units = self.segmenter.split(text)?;
        if units.is_empty() {
            return Err(Error::Validation("no speakable text".into()));
        }
        Ok(units)
    }

    /// Narrate `text` with `backend` into `output`.
    pub fn run(
        &self,
        text: &str,
        backend: Arc<dyn SynthesisBackend>,
        output: &Path,
    ) -> Result<JobReport> {
        self.style.validate()?;
        let units = self.segment(text)?;
        let backend = self.ready_backend(backend, &self.style)?;
        log_estimate(&units, backend.as_ref());

        let workdir = WorkDir::create(self.settings.work_root.as_deref())?;
        let job = AudiobookJob::new(units, output).with_style(self.style);
        workdir.save_checkpoint(&job)?;
        self.execute(job, backend.as_ref(), workdir)
    }

    /// Continue an interrupted job from its working directory.  The job
    /// keeps the style it was started with; the pipeline's own style is
    /// ignored.
    pub fn resume(&self, workdir: &Path, backend: Arc<dyn SynthesisBackend>) -> Result<JobReport> {
        let workdir = WorkDir::open(workdir)?;
        let job = workdir.load_checkpoint()?;
        let style = *job.style();
        style.validate()?;
        if style != self.style {
            log::debug!("using the job's saved style {style:?}");
        }
        let backend = self.ready_backend(backend, &style)?;
        log::info!(
            "resuming {} at unit {}/{}",
            job.output_path().display(),
            job.cursor(),
            job.total()
        );
        self.execute(job, backend.as_ref(), workdir)
    }

    fn ready_backend(
        &self,
        backend: Arc<dyn SynthesisBackend>,
        style: &StyleOptions,
    ) -> Result<Arc<dyn SynthesisBackend>> {
        let backend = select_backend(backend, style);
        backend.prepare().map_err(Error::backend)?;
        log::info!("backend {} ready (batch size {})", backend.name(), backend.batch_size());
        Ok(backend)
    }

    fn execute(
        &self,
        mut job: AudiobookJob,
        backend: &dyn SynthesisBackend,
        mut workdir: WorkDir,
    ) -> Result<JobReport> {
        let dispatched = {
            let mut dispatcher = Dispatcher::new(backend, *job.style())
                .with_sample_rate(self.settings.sample_rate)
                .with_cadence(self.settings.progress)
                .with_workdir(&workdir);
            if let Some(sink) = self.progress {
                dispatcher = dispatcher.with_progress(sink);
            }
            if let Some(token) = &self.cancel {
                dispatcher = dispatcher.with_cancel(token.clone());
            }
            dispatcher.run(&mut job)
        };

        if let Err(err) = dispatched {
            if matches!(err, Error::Interrupted { .. }) {
                workdir.keep();
            }
            return Err(err);
        }

        let audio = Assembler::new(self.settings.sample_rate)
            .with_gap_policy(self.settings.gap_policy)
            .with_mp3_bitrate(self.settings.mp3_bitrate)
            .with_enhancement(self.settings.enhance)
            .export(&job)?;

        let mut report = job.report();
        report.output = Some(job.output_path().to_path_buf());
        report.duration = Some(audio.duration());
        if report.is_degraded() {
            log::warn!("{report}");
        } else {
            log::info!("{report}");
        }
        Ok(report)
    }
}

fn log_estimate(units: &[SpeakableUnit], backend: &dyn SynthesisBackend) {
    let words: usize = units.iter().map(|u| u.word_count).sum();
    let estimate = Duration::from_secs_f64(backend.seconds_per_unit() * units.len() as f64);
    log::info!(
        "{} units ({words} words), estimated synthesis time {}",
        units.len(),
        format_eta(estimate)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    fn settings(root: &Path) -> Settings {
        Settings { work_root: Some(root.join("work")), ..Settings::default() }
    }

    fn leftover_workdirs(root: &Path) -> usize {
        std::fs::read_dir(root.join("work")).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn test_too_many_units_makes_no_backend_calls() {
        let dir = tempfile::tempdir().unwrap();
        let text: String = (0..501).map(|i| format!("Cümle numarası {i} burada. ")).collect();
        let backend = Arc::new(ScriptedBackend::new());
        let err = Pipeline::new(settings(dir.path()))
            .run(&text, backend.clone(), &dir.path().join("out.wav"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(backend.calls(), 0);
        assert!(backend.units_seen().is_empty());
    }

    #[test]
    fn test_unavailable_backend_fails_before_units() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new().unavailable());
        let err = Pipeline::new(settings(dir.path()))
            .run("Merhaba!", backend.clone(), &dir.path().join("out.wav"))
            .unwrap_err();
        assert!(matches!(err, Error::BackendUnavailable(_)));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_invalid_style_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new());
        let err = Pipeline::new(settings(dir.path()))
            .with_style(StyleOptions { speed: 3.0, ..Default::default() })
            .run("Merhaba!", backend.clone(), &dir.path().join("out.wav"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(backend.calls(), 0);
    }

    #[test]
    fn test_degraded_job_completes() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new().failing(&["Birinci.", "Üçüncü.", "Dördüncü.", "Beşinci."]));
        let out = dir.path().join("kitap.wav");
        let report = Pipeline::new(settings(dir.path()))
            .run("Birinci. İkinci! Üçüncü. Dördüncü. Beşinci.", backend.clone(), &out)
            .unwrap();

        assert_eq!(report.total, 5);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, vec![0, 2, 3, 4]);
        let expected = Duration::from_secs_f64(
            backend.samples_for("İkinci!") as f64 / 24_000.0 + 0.6,
        );
        let got = report.duration.unwrap();
        assert!((got.as_secs_f64() - expected.as_secs_f64()).abs() < 1e-3, "{got:?}");
        assert!(out.exists());
        assert_eq!(leftover_workdirs(dir.path()), 0);
    }

    #[test]
    fn test_total_failure_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new().failing(&["Bir.", "İki."]));
        let out = dir.path().join("kitap.wav");
        let err = Pipeline::new(settings(dir.path()))
            .run("Bir. İki.", backend, &out)
            .unwrap_err();
        assert!(matches!(err, Error::NoAudioProduced { total: 2, .. }));
        assert!(!out.exists());
        assert_eq!(leftover_workdirs(dir.path()), 0);
    }

    #[test]
    fn test_interrupt_then_resume() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("kitap.wav");
        let token = CancelToken::new();
        let first = Arc::new(ScriptedBackend::new().cancel_after(1, token.clone()));

        let err = Pipeline::new(settings(dir.path()))
            .with_cancel(token)
            .run("Bir. İki. Üçüncü.", first, &out)
            .unwrap_err();
        let workdir = match err {
            Error::Interrupted { cursor: 1, total: 3, workdir } => workdir,
            other => panic!("unexpected {other:?}"),
        };
        assert!(workdir.exists());
        assert!(!out.exists());

        let second = Arc::new(ScriptedBackend::new());
        let report = Pipeline::new(settings(dir.path())).resume(&workdir, second.clone()).unwrap();
        assert_eq!(second.units_seen(), vec!["İki.".to_string(), "Üçüncü.".to_string()]);
        assert_eq!(report.succeeded, 3);
        assert!(out.exists());
        assert!(!workdir.exists());
    }

    #[test]
    fn test_resume_keeps_saved_style() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("kitap.wav");
        let token = CancelToken::new();
        let first = Arc::new(ScriptedBackend::new().cancel_after(1, token.clone()));
        let fast = StyleOptions { speed: 2.0, ..Default::default() };

        let err = Pipeline::new(settings(dir.path()))
            .with_style(fast)
            .with_cancel(token)
            .run("Bir. İki. Üçüncü.", first.clone(), &out)
            .unwrap_err();
        let workdir = match err {
            Error::Interrupted { workdir, .. } => workdir,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(WorkDir::open(&workdir).unwrap().load_checkpoint().unwrap().style(), &fast);

        let second = Arc::new(ScriptedBackend::new());
        let report = Pipeline::new(settings(dir.path())).resume(&workdir, second.clone()).unwrap();

        // every unit at half length, plus three 0.5 s pauses
        let speech: usize = ["Bir.", "İki.", "Üçüncü."].iter().map(|t| second.samples_for(t)).sum();
        let expected = speech as f64 / 2.0 / 24_000.0 + 1.5;
        let got = report.duration.unwrap().as_secs_f64();
        assert!((got - expected).abs() < 1e-3, "{got} vs {expected}");
    }

    #[test]
    fn test_empty_text_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = Pipeline::new(settings(dir.path()))
            .run("   \n\n ", Arc::new(ScriptedBackend::new()), &dir.path().join("o.wav"))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
