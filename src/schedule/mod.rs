pub mod types;
pub mod processors;
pub mod scheduler;
#[cfg(test)]
mod tests;

// 重导出主要类型
pub use types::{Job, JobCounts, JobOutcome, JobSnapshot, JobStatus, Progress, TranscriptionResult};

// 重导出处理器接口
pub use processors::{CleanupPolicy, JobContext, JobProcessor, ProcessorHealth, ProgressReporter, TranscribeProcessor};

// 重导出调度器接口
pub use scheduler::{HealthReport, JobRegistry, JobScheduler, WorkerPool};
