//! Process-wide owner of the local voice-cloning model.
//!
//! Loading the model is expensive, so at most one instance is resident.
//! [`ModelRuntime::acquire`] is idempotent: it returns the resident handle
//! when the requested [`ModelKey`] matches and only reloads when the model
//! or device changes.  The handle is an `Arc`, passed explicitly to the
//! local backend when a job is built.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::audio::Fragment;

/// Where inference runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
    Mps,
}

impl Device {
    pub fn is_gpu(&self) -> bool {
        !matches!(self, Device::Cpu)
    }

    /// Units per backend call.  GPUs amortise per-call overhead over a
    /// small batch; the CPU path gains nothing from it.
    pub fn batch_size(&self) -> usize {
        if self.is_gpu() {
            3
        } else {
            1
        }
    }

    /// Rough synthesis cost per unit, for the pre-run estimate.
    pub fn seconds_per_unit(&self) -> f64 {
        if self.is_gpu() {
            1.5
        } else {
            15.0
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
            Device::Mps => "mps",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a loaded model: same key → same instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey {
    pub model_id: String,
    pub device: Device,
}

impl ModelKey {
    pub fn new(model_id: impl Into<String>, device: Device) -> Self {
        Self { model_id: model_id.into(), device }
    }
}

/// The black-box voice-cloning model: text + reference recording → audio.
pub trait CloneModel: Send + Sync {
    fn key(&self) -> &ModelKey;

    /// Synthesise one utterance in the timbre of `reference`.
    fn synthesize(&self, text: &str, reference: &Path, language: &str) -> Result<Fragment>;

    /// Synthesise several utterances; one result per text, in order.
    fn synthesize_batch(&self, texts: &[&str], reference: &Path, language: &str) -> Vec<Result<Fragment>> {
        texts.iter().map(|t| self.synthesize(t, reference, language)).collect()
    }
}

/// Shared handle to the resident model.
pub type ModelHandle = Arc<dyn CloneModel>;

type Loader = dyn Fn(&ModelKey) -> Result<ModelHandle> + Send + Sync;

/// Lazily-initialised, reference-counted model cache.
pub struct ModelRuntime {
    loader: Box<Loader>,
    resident: Mutex<Option<ModelHandle>>,
}

impl ModelRuntime {
    /// Build a runtime around `loader`, which is called only on a cache miss.
    pub fn new<F>(loader: F) -> Self
    where
        F: Fn(&ModelKey) -> Result<ModelHandle> + Send + Sync + 'static,
    {
        Self { loader: Box::new(loader), resident: Mutex::new(None) }
    }

    /// Return the model for `key`, loading it if nothing (or a different
    /// model/device) is resident.  The runtime's reference to a replaced
    /// model is dropped before the new one loads, so two models are never
    /// held by the runtime at once.
    pub fn acquire(&self, key: &ModelKey) -> Result<ModelHandle> {
        let mut resident = self
            .resident
            .lock()
            .map_err(|_| anyhow::anyhow!("model runtime mutex poisoned"))?;

        if let Some(model) = resident.as_ref() {
            if model.key() == key {
                log::info!("reusing resident model {} on {}", key.model_id, key.device);
                return Ok(Arc::clone(model));
            }
            log::info!(
                "resident model {} on {} does not match, unloading",
                model.key().model_id,
                model.key().device
            );
        }
        drop(resident.take());

        log::info!("loading model {} on {}", key.model_id, key.device);
        let model = (self.loader)(key)?;
        *resident = Some(Arc::clone(&model));
        Ok(model)
    }

    /// The resident model, if any, without loading.
    pub fn resident(&self) -> Option<ModelHandle> {
        self.resident.lock().ok().and_then(|r| r.clone())
    }

    /// Drop the runtime's reference to the resident model.
    pub fn release(&self) {
        if let Ok(mut r) = self.resident.lock() {
            r.take();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
