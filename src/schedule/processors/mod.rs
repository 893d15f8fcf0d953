pub mod transcribe;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;

use crate::asr::BackendStatus;
use crate::audio::AudioFormat;
use crate::device::{DeviceInfo, ResourceSample};
use crate::error::Result;
use crate::schedule::scheduler::JobRegistry;
use crate::schedule::types::{Progress, TranscriptionResult};

pub use transcribe::{CleanupPolicy, TranscribeProcessor};

/// What a processor needs to know about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub id: String,
    pub file_path: PathBuf,
    pub format: AudioFormat,
}

/// Writes pipeline progress back into the job registry. Writes for a job
/// that has been deleted are dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    jobs: JobRegistry,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(jobs: JobRegistry, job_id: impl Into<String>) -> Self {
        Self {
            jobs,
            job_id: job_id.into(),
        }
    }

    pub fn report(&self, stage: &str, percent: u8) -> bool {
        self.jobs
            .update(&self.job_id, |job| job.progress = Some(Progress::new(stage, percent)))
    }

    pub fn assign_device(&self, device: Option<u32>) -> bool {
        self.jobs.update(&self.job_id, |job| job.assigned_device = device)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessorHealth {
    pub devices: Vec<DeviceInfo>,
    pub resources: ResourceSample,
    pub backends: Vec<BackendStatus>,
    pub worker_pool_size: usize,
    pub workers_busy: usize,
}

#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, ctx: &JobContext, progress: &ProgressReporter) -> Result<TranscriptionResult>;

    /// Runs once after every terminal transition, success or failure.
    async fn cleanup(&self, ctx: &JobContext);

    async fn health(&self) -> ProcessorHealth;
}
