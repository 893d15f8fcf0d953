use thiserror::Error;

use crate::schedule::types::JobStatus;

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("job `{0}` not found")]
    NotFound(String),

    #[error("job `{job_id}` is {status}, expected {expected}")]
    InvalidState {
        job_id: String,
        status: JobStatus,
        expected: JobStatus,
    },

    #[error("no decode strategy could read the audio: {0}")]
    UnreadableAudio(String),

    #[error("all backend tiers exhausted ({0})")]
    NoBackendAvailable(String),

    #[error("backend `{backend}` failed: {reason}")]
    BackendInvocationFailure { backend: String, reason: String },

    #[error("internal failure: {0}")]
    Internal(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    pub fn backend_failure(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::BackendInvocationFailure {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable machine-readable code, equal to the variant name.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::NotFound(_) => "NotFound",
            Self::InvalidState { .. } => "InvalidState",
            Self::UnreadableAudio(_) => "UnreadableAudio",
            Self::NoBackendAvailable(_) => "NoBackendAvailable",
            Self::BackendInvocationFailure { .. } => "BackendInvocationFailure",
            Self::Internal(_) => "Internal",
            Self::Io(_) => "Io",
        }
    }

    /// Errors caused by the request itself rather than by the pipeline.
    pub const fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::NotFound(_) | Self::InvalidState { .. }
        )
    }

    /// The string stored on a Failed job.
    pub fn job_message(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}
