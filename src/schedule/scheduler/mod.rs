mod job_registry;
mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub use job_registry::JobRegistry;
pub use worker::WorkerPool;

use crate::audio::AudioFormat;
use crate::error::{Result, SchedulerError};
use crate::schedule::processors::{JobContext, JobProcessor, ProcessorHealth, ProgressReporter};
use crate::schedule::types::{Job, JobCounts, JobOutcome, JobSnapshot};

pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

type TaskMap = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(flatten)]
    pub processor: ProcessorHealth,
    pub jobs: JobCounts,
    pub active_tasks: usize,
}

/// Owns the job table and one background task per started job.
pub struct JobScheduler {
    jobs: JobRegistry,
    processor: Arc<dyn JobProcessor>,
    tasks: TaskMap,
}

impl JobScheduler {
    pub fn new(processor: Arc<dyn JobProcessor>) -> Self {
        Self {
            jobs: JobRegistry::new(),
            processor,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn submit(&self, file_path: PathBuf, declared_format: &str, size: u64) -> Result<String> {
        self.register(file_path, None, declared_format, size)
    }

    /// Same as `submit`, for a file stored under a generated name; `filename`
    /// is what the client called it.
    pub fn submit_upload(
        &self,
        file_path: PathBuf,
        filename: String,
        declared_format: &str,
        size: u64,
    ) -> Result<String> {
        self.register(file_path, Some(filename), declared_format, size)
    }

    fn register(
        &self,
        file_path: PathBuf,
        filename: Option<String>,
        declared_format: &str,
        size: u64,
    ) -> Result<String> {
        let format = AudioFormat::parse(declared_format)?;
        if size == 0 {
            return Err(SchedulerError::InvalidInput("audio file is empty".to_string()));
        }

        let job_id = uuid::Uuid::new_v4().to_string();
        let mut job = Job::new(job_id.clone(), file_path, format, size);
        if let Some(filename) = filename {
            job.filename = filename;
        }
        self.jobs.insert(job);
        info!("Job {} submitted ({}, {} bytes)", job_id, format.description(), size);
        Ok(job_id)
    }

    /// Moves the job to Processing and spawns its pipeline. Must be called
    /// from inside a tokio runtime.
    pub fn start(&self, job_id: &str) -> Result<()> {
        let ctx = self.jobs.begin(job_id)?;
        info!("Job {} started", job_id);

        // 持锁插入，任务结束时才能移除自己
        let mut tasks = self.tasks.lock();
        let handle = tokio::spawn(run_job(
            self.jobs.clone(),
            self.processor.clone(),
            self.tasks.clone(),
            ctx,
        ));
        tasks.insert(job_id.to_string(), handle);
        Ok(())
    }

    pub fn get_status(&self, job_id: &str) -> Result<JobSnapshot> {
        self.jobs.snapshot(job_id)
    }

    pub fn get_result(&self, job_id: &str) -> Result<JobOutcome> {
        self.jobs.outcome(job_id)
    }

    /// Removes the job and best-effort deletes its source file. An in-flight
    /// task keeps running; its final write is discarded.
    pub async fn delete(&self, job_id: &str) -> Result<()> {
        let job = self.jobs.remove(job_id)?;
        match tokio::fs::remove_file(&job.file_path).await {
            Ok(()) => info!("Job {} deleted, removed {}", job_id, job.file_path.display()),
            Err(e) => warn!(
                "Job {} deleted, could not remove {}: {}",
                job_id,
                job.file_path.display(),
                e
            ),
        }
        Ok(())
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport {
            status: "healthy",
            version: VERSION,
            processor: self.processor.health().await,
            jobs: self.jobs.counts(),
            active_tasks: self.active_tasks(),
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Abort every in-flight pipeline task. Returns how many were aborted.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        for (job_id, handle) in &drained {
            info!("Aborting job {}", job_id);
            handle.abort();
        }
        drained.len()
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_job(jobs: JobRegistry, processor: Arc<dyn JobProcessor>, tasks: TaskMap, ctx: JobContext) {
    let job_id = ctx.id.clone();
    let ctx = Arc::new(ctx);
    let progress = ProgressReporter::new(jobs.clone(), job_id.clone());
    progress.report("preprocessing", 10);

    // a panic anywhere in the pipeline must only fail this job
    let mut pipeline = AbortOnDrop(tokio::spawn({
        let processor = processor.clone();
        let ctx = ctx.clone();
        let progress = progress.clone();
        async move { processor.process(&ctx, &progress).await }
    }));
    let outcome = match (&mut pipeline.0).await {
        Ok(outcome) => outcome,
        Err(e) => Err(SchedulerError::Internal(format!("pipeline task did not complete: {}", e))),
    };

    match &outcome {
        Ok(result) => info!(
            "Job {} completed by {} ({:.2}s audio, confidence {:.2})",
            job_id, result.model_name, result.duration_seconds, result.confidence
        ),
        Err(e) => error!("Job {} failed: {}", job_id, e),
    }

    if !jobs.finish(&job_id, outcome) {
        info!("Job {} was deleted while processing, discarding its outcome", job_id);
    }

    processor.cleanup(&ctx).await;
    tasks.lock().remove(&job_id);
}
