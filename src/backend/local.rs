//! Local voice cloning through a long-lived synthesiser worker.
//!
//! The model is a black box: a program that loads its weights once and
//! then serves requests over its standard streams.  How it is launched
//! comes from [`LocalModelSettings`]; arguments may contain the
//! placeholders `{model}` and `{device}`.
//!
//! Protocol, one line per message:
//!
//! ```text
//! stdin   <output.wav>\t<reference.wav>\t<language>\t<text>
//! stdout  sesli:ok
//!         sesli:error <message>
//! ```
//!
//! Replies come in request order.  Any other stdout line is treated as
//! chatter and logged.  The worker lives as long as the model handle; a
//! worker that dies or stalls is killed and restarted on the next call.

use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use tempfile::TempDir;

use super::{StyleOptions, SynthesisBackend};
use crate::audio::{read_wav, wav_duration, Fragment};
use crate::config::LocalModelSettings;
use crate::error::TimedOut;
use crate::runtime::{CloneModel, ModelHandle, ModelKey};
use crate::segment::SpeakableUnit;

/// Recommended reference length, seconds.
pub const REFERENCE_MIN_SECS: f64 = 10.0;
pub const REFERENCE_MAX_SECS: f64 = 60.0;
const REFERENCE_VERY_SHORT_SECS: f64 = 3.0;

const REPLY_OK: &str = "sesli:ok";
const REPLY_ERROR: &str = "sesli:error";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const EXIT_GRACE: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// Worker process
// ─────────────────────────────────────────────────────────────────────────────

enum Reply {
    Ok,
    Failed(String),
    Stalled,
    Closed,
}

struct Worker {
    child: Child,
    stdin: Option<ChildStdin>,
    replies: Receiver<String>,
    stderr_log: PathBuf,
}

impl Worker {
    fn spawn(program: &Path, args: &[String], stderr_log: PathBuf) -> Result<Self> {
        let stderr = File::create(&stderr_log).context("failed to create worker log")?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .spawn()
            .with_context(|| format!("failed to start {}", program.display()))?;

        let stdin = child.stdin.take().context("worker stdin not captured")?;
        let stdout = child.stdout.take().context("worker stdout not captured")?;
        let (tx, replies) = mpsc::channel();
        std::thread::Builder::new()
            .name("sesli-worker".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            })
            .context("failed to start worker reader")?;

        log::info!("synthesiser worker started (pid {})", child.id());
        Ok(Self { child, stdin: Some(stdin), replies, stderr_log })
    }

    fn send(&mut self, output: &Path, reference: &Path, language: &str, text: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().context("worker stdin closed")?;
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            one_field(&output.to_string_lossy()),
            one_field(&reference.to_string_lossy()),
            one_field(language),
            one_field(text)
        );
        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    fn reply(&self, timeout: Duration) -> Reply {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.replies.recv_timeout(left) {
                Ok(line) => {
                    let line = line.trim_end();
                    if line == REPLY_OK {
                        return Reply::Ok;
                    }
                    if let Some(msg) = line.strip_prefix(REPLY_ERROR) {
                        return Reply::Failed(msg.trim().to_string());
                    }
                    log::debug!("worker: {line}");
                }
                Err(RecvTimeoutError::Timeout) => return Reply::Stalled,
                Err(RecvTimeoutError::Disconnected) => return Reply::Closed,
            }
        }
    }

    /// Describe why the worker stopped answering, with the tail of its
    /// stderr.
    fn exit_reason(&mut self) -> String {
        self.stdin.take();
        let deadline = Instant::now() + EXIT_GRACE;
        let mut status: Option<ExitStatus> = None;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(s)) => {
                    status = Some(s);
                    break;
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(_) => break,
            }
        }
        let log = std::fs::read_to_string(&self.stderr_log).unwrap_or_default();
        let tail: Vec<&str> = log.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        match status {
            Some(status) => format!("synthesiser exited with {status}: {}", tail.join(" | ")),
            None => format!("synthesiser stopped answering: {}", tail.join(" | ")),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Tabs and line breaks would split the request line.
fn one_field(s: &str) -> String {
    s.replace(['\t', '\n', '\r'], " ")
}

/// Substitute `{model}` and `{device}` in the launch arguments.
fn render_args(args: &[String], key: &ModelKey) -> Vec<String> {
    args.iter()
        .map(|a| a.replace("{model}", &key.model_id).replace("{device}", key.device.as_str()))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// External command model
// ─────────────────────────────────────────────────────────────────────────────

/// A [`CloneModel`] served by one resident worker process.
pub struct CommandCloneModel {
    key: ModelKey,
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    scratch: TempDir,
    worker: Mutex<Option<Worker>>,
    starts: AtomicUsize,
    seq: AtomicUsize,
}

impl CommandCloneModel {
    /// Resolve the synthesiser program and start its worker for `key`.
    pub fn load(settings: &LocalModelSettings, key: &ModelKey, timeout: Duration) -> Result<Self> {
        let program = which::which(&settings.program).with_context(|| {
            format!("synthesiser '{}' not found on PATH", settings.program)
        })?;
        log::debug!("local synthesiser resolved to {}", program.display());
        let scratch = tempfile::Builder::new()
            .prefix("sesli-model-")
            .tempdir()
            .context("failed to create scratch directory")?;

        let model = Self {
            key: key.clone(),
            program,
            args: render_args(&settings.args, key),
            timeout,
            scratch,
            worker: Mutex::new(None),
            starts: AtomicUsize::new(0),
            seq: AtomicUsize::new(0),
        };
        let worker = model.start_worker()?;
        if let Ok(mut slot) = model.worker.lock() {
            *slot = Some(worker);
        }
        Ok(model)
    }

    /// How many times a worker process has been started.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn start_worker(&self) -> Result<Worker> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);
        let log = self.scratch.path().join(format!("worker_{n}.log"));
        Worker::spawn(&self.program, &self.args, log)
    }

    fn next_output(&self) -> PathBuf {
        let n = self.seq.fetch_add(1, Ordering::SeqCst);
        self.scratch.path().join(format!("unit_{n:06}.wav"))
    }

    fn timed_out(&self) -> anyhow::Error {
        anyhow::Error::new(TimedOut(self.timeout.as_secs()))
            .context(format!("{} killed", self.program.display()))
    }
}

fn fail_all(n: usize, msg: &str) -> Vec<Result<Fragment>> {
    (0..n).map(|_| Err(anyhow!("{msg}"))).collect()
}

impl CloneModel for CommandCloneModel {
    fn key(&self) -> &ModelKey {
        &self.key
    }

    fn synthesize(&self, text: &str, reference: &Path, language: &str) -> Result<Fragment> {
        self.synthesize_batch(&[text], reference, language)
            .pop()
            .unwrap_or_else(|| Err(anyhow!("synthesiser returned nothing")))
    }

    /// Queue every text on the worker, then collect the replies.  A stall
    /// kills the worker and times out the rest of the batch.
    fn synthesize_batch(&self, texts: &[&str], reference: &Path, language: &str) -> Vec<Result<Fragment>> {
        let mut slot = match self.worker.lock() {
            Ok(slot) => slot,
            Err(_) => return fail_all(texts.len(), "synthesiser mutex poisoned"),
        };
        if slot.is_none() {
            log::warn!("restarting synthesiser worker for {} on {}", self.key.model_id, self.key.device);
            match self.start_worker() {
                Ok(worker) => *slot = Some(worker),
                Err(e) => return fail_all(texts.len(), &format!("{e:#}")),
            }
        }
        let Some(worker) = slot.as_mut() else {
            return fail_all(texts.len(), "synthesiser worker unavailable");
        };

        let outputs: Vec<PathBuf> = texts.iter().map(|_| self.next_output()).collect();
        for (text, output) in texts.iter().zip(&outputs) {
            if let Err(e) = worker.send(output, reference, language, text) {
                log::debug!("worker write failed: {e}");
                let reason = worker.exit_reason();
                *slot = None;
                return fail_all(texts.len(), &reason);
            }
        }

        let mut results = Vec::with_capacity(texts.len());
        for output in &outputs {
            match worker.reply(self.timeout) {
                Reply::Ok => {
                    let fragment = read_wav(output).context("synthesiser output unreadable");
                    let _ = std::fs::remove_file(output);
                    results.push(fragment);
                }
                Reply::Failed(msg) => results.push(Err(anyhow!("synthesiser failed: {msg}"))),
                Reply::Stalled => {
                    log::warn!("synthesiser gave no answer in {} s, killing it", self.timeout.as_secs());
                    *slot = None;
                    while results.len() < texts.len() {
                        results.push(Err(self.timed_out()));
                    }
                    return results;
                }
                Reply::Closed => {
                    let reason = worker.exit_reason();
                    log::warn!("{reason}");
                    *slot = None;
                    while results.len() < texts.len() {
                        results.push(Err(anyhow!("{reason}")));
                    }
                    return results;
                }
            }
        }
        results
    }
}

/// Loader for [`crate::runtime::ModelRuntime`] that starts `settings.program`.
pub fn command_loader(
    settings: LocalModelSettings,
    timeout: Duration,
) -> impl Fn(&ModelKey) -> Result<ModelHandle> + Send + Sync + 'static {
    move |key: &ModelKey| {
        let model = CommandCloneModel::load(&settings, key, timeout)?;
        Ok(std::sync::Arc::new(model) as ModelHandle)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

/// Plain cloning backend: resident model + one reference recording.
pub struct LocalCloneBackend {
    model: ModelHandle,
    reference: PathBuf,
    language: String,
}

impl LocalCloneBackend {
    pub fn new(model: ModelHandle, reference: PathBuf, language: &str) -> Self {
        Self { model, reference, language: language.to_string() }
    }

    pub fn reference(&self) -> &Path {
        &self.reference
    }
}

/// Open `path`, log its length and warn when it is outside the range the
/// model clones well from.
pub fn inspect_reference(path: &Path) -> Result<Duration> {
    if !path.is_file() {
        bail!("reference voice {} not found", path.display());
    }
    let duration = wav_duration(path)
        .with_context(|| format!("reference voice {} unreadable", path.display()))?;
    let secs = duration.as_secs_f64();
    log::info!("reference voice {}: {secs:.1} s", path.display());

    if secs < REFERENCE_VERY_SHORT_SECS {
        log::warn!("reference voice is very short ({secs:.1} s); cloning quality will suffer");
    } else if secs < REFERENCE_MIN_SECS {
        log::warn!("reference voice is shorter than {REFERENCE_MIN_SECS} s ({secs:.1} s)");
    } else if secs > REFERENCE_MAX_SECS {
        log::warn!("reference voice is longer than {REFERENCE_MAX_SECS} s ({secs:.1} s)");
    }
    Ok(duration)
}

impl SynthesisBackend for LocalCloneBackend {
    fn name(&self) -> String {
        format!("local({} on {})", self.model.key().model_id, self.model.key().device)
    }

    fn prepare(&self) -> Result<()> {
        inspect_reference(&self.reference)?;
        Ok(())
    }

    fn synthesize(&self, unit: &SpeakableUnit, _style: &StyleOptions) -> Result<Fragment> {
        self.model.synthesize(&unit.text, &self.reference, &self.language)
    }

    fn batch_size(&self) -> usize {
        self.model.key().device.batch_size()
    }

    fn synthesize_batch(&self, units: &[&SpeakableUnit], _style: &StyleOptions) -> Vec<Result<Fragment>> {
        let texts: Vec<&str> = units.iter().map(|u| u.text.as_str()).collect();
        self.model.synthesize_batch(&texts, &self.reference, &self.language)
    }

    fn seconds_per_unit(&self) -> f64 {
        self.model.key().device.seconds_per_unit()
    }
}
