//! Batch queue: many independent jobs, one after another.
//!
//! A job that fails is recorded with its cause and the queue moves on.
//! After the run a summary is written next to the outputs:
//!
//! ```json
//! { "total": 3, "completed": 2, "failed": 1,
//!   "per_job": [ { "id": 1, "status": "completed", "output_file": "…" }, … ] }
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::backend::{build_backend, StyleOptions, VoiceRef};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::job::JobReport;
use crate::pipeline::Pipeline;
use crate::preprocess::TextCleaner;
use crate::runtime::ModelRuntime;

/// Extension of queue outputs.
pub const OUTPUT_EXTENSION: &str = if cfg!(feature = "mp3") { "mp3" } else { "wav" };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// One entry of a `tasks.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub text: String,
    pub voice: VoiceRef,
    #[serde(default)]
    pub style: StyleOptions,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueTask {
    pub id: usize,
    pub text: String,
    pub voice: VoiceRef,
    pub style: StyleOptions,
    pub status: TaskStatus,
    pub created_at: DateTime<Local>,
    pub completed_at: Option<DateTime<Local>>,
    pub output_file: Option<PathBuf>,
    pub error: Option<String>,
    pub report: Option<JobReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntry {
    pub id: usize,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub per_job: Vec<JobEntry>,
}

pub struct BatchQueue {
    output_dir: PathBuf,
    tasks: Vec<QueueTask>,
}

impl BatchQueue {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir, tasks: Vec::new() })
    }

    /// Load task specs from a JSON array.
    pub fn load_tasks(path: &Path) -> Result<Vec<TaskSpec>> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Validation(format!("{}: {e}", path.display())))
    }

    /// Queue a job; returns its id (1-based).
    pub fn add(&mut self, text: impl Into<String>, voice: VoiceRef, style: StyleOptions) -> usize {
        let id = self.tasks.len() + 1;
        self.tasks.push(QueueTask {
            id,
            text: text.into(),
            voice,
            style,
            status: TaskStatus::Pending,
            created_at: Local::now(),
            completed_at: None,
            output_file: None,
            error: None,
            report: None,
        });
        log::info!("queued task #{id}");
        id
    }

    pub fn tasks(&self) -> &[QueueTask] {
        &self.tasks
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Run every pending task with `run`, one at a time, then write the
    /// summary.  Returns the summary and the path it was written to.
    pub fn process<F>(&mut self, mut run: F) -> Result<(BatchSummary, PathBuf)>
    where
        F: FnMut(&QueueTask, &Path) -> Result<JobReport>,
    {
        let pending = self.tasks.iter().filter(|t| t.status == TaskStatus::Pending).count();
        log::info!("processing {pending} queued tasks");

        for n in 0..self.tasks.len() {
            if self.tasks[n].status != TaskStatus::Pending {
                continue;
            }
            let output = self.output_dir.join(format!(
                "batch_{}_{}.{OUTPUT_EXTENSION}",
                self.tasks[n].id,
                Local::now().timestamp()
            ));
            self.tasks[n].status = TaskStatus::Processing;
            log::info!("task #{}: {}", self.tasks[n].id, self.tasks[n].voice);

            let outcome = run(&self.tasks[n], &output);
            let task = &mut self.tasks[n];
            match outcome {
                Ok(report) => {
                    log::info!("task #{} completed: {report}", task.id);
                    task.status = TaskStatus::Completed;
                    task.output_file = Some(output);
                    task.completed_at = Some(Local::now());
                    task.report = Some(report);
                }
                Err(e) => {
                    log::error!("task #{} failed: {e}", task.id);
                    task.status = TaskStatus::Failed;
                    task.error = Some(e.to_string());
                }
            }
        }

        let summary = self.summary();
        let path = self.save_summary(&summary)?;
        log::info!(
            "batch finished: {} completed, {} failed",
            summary.completed,
            summary.failed
        );
        Ok((summary, path))
    }

    pub fn summary(&self) -> BatchSummary {
        let count = |s: TaskStatus| self.tasks.iter().filter(|t| t.status == s).count();
        BatchSummary {
            total: self.tasks.len(),
            completed: count(TaskStatus::Completed),
            failed: count(TaskStatus::Failed),
            per_job: self
                .tasks
                .iter()
                .map(|t| JobEntry {
                    id: t.id,
                    status: t.status,
                    output_file: t.output_file.clone(),
                    error: t.error.clone(),
                })
                .collect(),
        }
    }

    fn save_summary(&self, summary: &BatchSummary) -> Result<PathBuf> {
        let path = self
            .output_dir
            .join(format!("batch_results_{}.json", Local::now().timestamp()));
        let json = serde_json::to_string_pretty(summary)
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        std::fs::write(&path, json)?;
        log::info!("summary written to {}", path.display());
        Ok(path)
    }
}

/// The standard runner: clean the text, build the task's backend (sharing
/// the resident local model) and run a full pipeline.
pub fn pipeline_runner<'r>(
    settings: &'r Settings,
    runtime: &'r ModelRuntime,
) -> impl FnMut(&QueueTask, &Path) -> Result<JobReport> + 'r {
    let cleaner = TextCleaner::default();
    move |task: &QueueTask, output: &Path| {
        let text = cleaner.clean(&task.text);
        let backend = build_backend(&task.voice, settings, runtime)?;
        Pipeline::new(settings.clone()).with_style(task.style).run(&text, backend, output)
    }
}
