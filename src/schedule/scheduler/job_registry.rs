use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use crate::error::{Result, SchedulerError};
use crate::schedule::processors::JobContext;
use crate::schedule::types::{Job, JobCounts, JobOutcome, JobSnapshot, JobStatus, Progress, TranscriptionResult};

/// Shared job table. Every accessor copies data out, no lock is held
/// across an await.
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job: Job) {
        self.jobs.write().insert(job.id.clone(), job);
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.jobs.read().contains_key(job_id)
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    pub fn snapshot(&self, job_id: &str) -> Result<JobSnapshot> {
        self.jobs
            .read()
            .get(job_id)
            .map(Job::snapshot)
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))
    }

    pub fn outcome(&self, job_id: &str) -> Result<JobOutcome> {
        self.jobs
            .read()
            .get(job_id)
            .map(Job::outcome)
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))
    }

    pub fn remove(&self, job_id: &str) -> Result<Job> {
        self.jobs
            .write()
            .remove(job_id)
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))
    }

    /// Pending -> Processing. Only one caller can win this per job.
    pub fn begin(&self, job_id: &str) -> Result<JobContext> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::NotFound(job_id.to_string()))?;

        if job.status != JobStatus::Pending {
            return Err(SchedulerError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status,
                expected: JobStatus::Pending,
            });
        }

        job.status = JobStatus::Processing;
        job.started_at = Some(Utc::now());
        Ok(JobContext {
            id: job.id.clone(),
            file_path: job.file_path.clone(),
            format: job.format,
        })
    }

    /// Mutate a Processing job. Returns false when the job is gone or no
    /// longer processing, in which case nothing is written.
    pub fn update(&self, job_id: &str, apply: impl FnOnce(&mut Job)) -> bool {
        match self.jobs.write().get_mut(job_id) {
            Some(job) if job.status == JobStatus::Processing => {
                apply(job);
                true
            }
            _ => false,
        }
    }

    /// Terminal transition. Sets exactly one of result / error.
    pub fn finish(&self, job_id: &str, outcome: Result<TranscriptionResult>) -> bool {
        self.update(job_id, |job| {
            job.completed_at = Some(Utc::now());
            match outcome {
                Ok(result) => {
                    job.status = JobStatus::Completed;
                    job.progress = Some(Progress::new("completed", 100));
                    job.result = Some(result);
                    job.error = None;
                }
                Err(e) => {
                    job.status = JobStatus::Failed;
                    job.progress = Some(Progress::new("failed", 0));
                    job.result = None;
                    job.error = Some(e.job_message());
                }
            }
        })
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for job in self.jobs.read().values() {
            counts.record(job.status);
        }
        counts
    }
}
