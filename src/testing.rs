//! Scripted in-memory backend shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::audio::Fragment;
use crate::backend::{StyleOptions, SynthesisBackend};
use crate::dispatch::CancelToken;
use crate::segment::SpeakableUnit;

pub(crate) fn units(texts: &[&str]) -> Vec<SpeakableUnit> {
    texts.iter().filter_map(|t| SpeakableUnit::new(t)).collect()
}

/// Returns a constant-level fragment whose length is proportional to the
/// unit's character count, and fails the units it is told to fail.
pub(crate) struct ScriptedBackend {
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    fail: Vec<String>,
    silent: Vec<String>,
    batch: usize,
    rate: u32,
    short_batches: bool,
    unavailable: bool,
    cancel_after: Option<(usize, CancelToken)>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            fail: Vec::new(),
            silent: Vec::new(),
            batch: 1,
            rate: 24_000,
            short_batches: false,
            unavailable: false,
            cancel_after: None,
        }
    }

    pub fn failing(mut self, texts: &[&str]) -> Self {
        self.fail.extend(texts.iter().map(|t| t.to_string()));
        self
    }

    pub fn silent_on(mut self, texts: &[&str]) -> Self {
        self.silent.extend(texts.iter().map(|t| t.to_string()));
        self
    }

    pub fn with_batch_size(mut self, n: usize) -> Self {
        self.batch = n;
        self
    }

    pub fn with_rate(mut self, rate: u32) -> Self {
        self.rate = rate;
        self
    }

    /// Every batch answers with one result too few.
    pub fn short_batches(mut self) -> Self {
        self.short_batches = true;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Trip `token` once `calls` batch calls have completed.
    pub fn cancel_after(mut self, calls: usize, token: CancelToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    /// Batch calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn units_seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Fragment length produced for `text`, at this backend's rate.
    pub fn samples_for(&self, text: &str) -> usize {
        text.chars().count() * (self.rate as usize / 100)
    }

    fn render(&self, unit: &SpeakableUnit) -> Result<Fragment> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(unit.text.clone());
        }
        if self.fail.contains(&unit.text) {
            return Err(anyhow!("scripted failure for '{}'", unit.text));
        }
        if self.silent.contains(&unit.text) {
            return Ok(Fragment::new(Vec::new(), self.rate));
        }
        Ok(Fragment::new(vec![0.5; self.samples_for(&unit.text)], self.rate))
    }
}

impl SynthesisBackend for ScriptedBackend {
    fn name(&self) -> String {
        "scripted".into()
    }

    fn prepare(&self) -> Result<()> {
        if self.unavailable {
            return Err(anyhow!("scripted backend offline"));
        }
        Ok(())
    }

    fn synthesize(&self, unit: &SpeakableUnit, _style: &StyleOptions) -> Result<Fragment> {
        self.render(unit)
    }

    fn batch_size(&self) -> usize {
        self.batch
    }

    fn synthesize_batch(&self, units: &[&SpeakableUnit], _style: &StyleOptions) -> Vec<Result<Fragment>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut out: Vec<Result<Fragment>> = units.iter().map(|u| self.render(u)).collect();
        if self.short_batches {
            out.pop();
        }
        if let Some((after, token)) = &self.cancel_after {
            if n >= *after {
                token.cancel();
            }
        }
        out
    }
}
