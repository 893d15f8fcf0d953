use std::fmt::Display;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::asr::TranscribeSegment;
use crate::audio::AudioFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: String,
    /// 0-100
    pub percent: u8,
}

impl Progress {
    pub fn new(stage: impl Into<String>, percent: u8) -> Self {
        Self {
            stage: stage.into(),
            percent: percent.min(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    /// In [0, 1].
    pub confidence: f32,
    pub duration_seconds: f64,
    pub model_name: String,
    pub device_used: Option<u32>,
    /// Timed pieces of `text`, empty when the backend produces none.
    #[serde(default)]
    pub segments: Vec<TranscribeSegment>,
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub file_path: PathBuf,
    pub filename: String,
    pub format: AudioFormat,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_device: Option<u32>,
    pub progress: Option<Progress>,
    pub result: Option<TranscriptionResult>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(id: String, file_path: PathBuf, format: AudioFormat, file_size: u64) -> Self {
        let filename = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| file_path.display().to_string());

        Self {
            id,
            status: JobStatus::Pending,
            file_path,
            filename,
            format,
            file_size,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_device: None,
            progress: None,
            result: None,
            error: None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.id.clone(),
            status: self.status,
            filename: self.filename.clone(),
            format: self.format,
            file_size: self.file_size,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            assigned_device: self.assigned_device,
            progress: self.progress.clone(),
        }
    }

    pub fn outcome(&self) -> JobOutcome {
        match (self.status, &self.result, &self.error) {
            (JobStatus::Completed, Some(result), _) => JobOutcome::Completed(result.clone()),
            (JobStatus::Failed, _, Some(error)) => JobOutcome::Failed(error.clone()),
            (status, _, _) => JobOutcome::InProgress(status),
        }
    }
}

/// Point-in-time copy of a job, safe to hand out while the job keeps running.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub status: JobStatus,
    pub filename: String,
    pub format: AudioFormat,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_device: Option<u32>,
    pub progress: Option<Progress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(TranscriptionResult),
    Failed(String),
    InProgress(JobStatus),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl JobCounts {
    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }
}
