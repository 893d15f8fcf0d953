use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{JobContext, JobProcessor, ProcessorHealth, ProgressReporter};
use crate::asr::{BackendRegistry, TranscribeResult};
use crate::audio::AudioNormalizer;
use crate::config::SchedulerSettings;
use crate::device::{DeviceAllocator, ResourceMonitor};
use crate::error::{Result, SchedulerError};
use crate::schedule::types::TranscriptionResult;

/// When to release loaded models after a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupPolicy {
    pub after_every_job: bool,
    pub on_pressure: bool,
}

impl CleanupPolicy {
    pub fn should_run(&self, under_pressure: bool) -> bool {
        self.after_every_job || (under_pressure && self.on_pressure)
    }
}

impl From<&SchedulerSettings> for CleanupPolicy {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            after_every_job: settings.clear_cache_after_job,
            on_pressure: settings.cleanup_on_pressure,
        }
    }
}

/// Allocates a device, normalizes the audio and walks the backend tiers
/// until one of them returns a transcript.
pub struct TranscribeProcessor {
    allocator: DeviceAllocator,
    monitor: Arc<ResourceMonitor>,
    normalizer: Arc<AudioNormalizer>,
    backends: Arc<BackendRegistry>,
    cleanup: CleanupPolicy,
}

impl TranscribeProcessor {
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        normalizer: Arc<AudioNormalizer>,
        backends: Arc<BackendRegistry>,
        cleanup: CleanupPolicy,
    ) -> Self {
        Self {
            allocator: DeviceAllocator::new(monitor.inventory().clone()),
            monitor,
            normalizer,
            backends,
            cleanup,
        }
    }

    pub fn backends(&self) -> &Arc<BackendRegistry> {
        &self.backends
    }

    /// Tiers are tried strictly in order and the first success is final.
    async fn transcribe_with_fallback(
        &self,
        job_id: &str,
        audio: &Path,
        device: Option<u32>,
    ) -> Result<TranscribeResult> {
        if self.backends.is_empty() {
            return Err(SchedulerError::NoBackendAvailable("no backends registered".to_string()));
        }

        let mut failures = Vec::new();
        for tier in 0..self.backends.len() {
            let name = self.backends.name(tier).unwrap_or("unknown").to_string();

            if let Err(reason) = self.backends.ensure_loaded(tier).await {
                debug!("Job {} skipping tier {} ({}): {}", job_id, tier, name, reason);
                failures.push(format!("{}: load failed: {}", name, reason));
                continue;
            }

            match self.backends.invoke(tier, audio, device).await {
                Ok(result) => {
                    if tier > 0 {
                        warn!("Job {} served by fallback tier {} ({})", job_id, tier, name);
                    }
                    return Ok(result);
                }
                Err(e) => {
                    warn!("Job {} tier {} ({}) failed: {}", job_id, tier, name, e);
                    failures.push(e.to_string());
                }
            }
        }

        Err(SchedulerError::NoBackendAvailable(failures.join("; ")))
    }
}

#[async_trait]
impl JobProcessor for TranscribeProcessor {
    async fn process(&self, ctx: &JobContext, progress: &ProgressReporter) -> Result<TranscriptionResult> {
        info!("Processing audio file: {}", ctx.file_path.display());

        // 分配前先采样，把内存不足的设备排除在外
        if !self.monitor.inventory().is_empty() {
            self.monitor.sample().await;
        }
        let device = self.allocator.pick_device(&ctx.id);
        progress.assign_device(device);

        progress.report("normalizing", 20);
        let canonical = self.normalizer.normalize(&ctx.file_path).await?;
        debug!(
            "Job {} canonical audio {:.2}s via {}",
            ctx.id,
            canonical.duration_seconds(),
            canonical.strategy
        );

        progress.report("transcribing", 50);
        let transcript = self.transcribe_with_fallback(&ctx.id, canonical.path(), device).await?;

        Ok(TranscriptionResult {
            text: transcript.full_text,
            confidence: transcript.confidence.clamp(0.0, 1.0),
            duration_seconds: transcript.duration_seconds,
            model_name: transcript.model_name,
            device_used: device,
            segments: transcript.segments,
        })
    }

    async fn cleanup(&self, ctx: &JobContext) {
        let sample = self.monitor.sample().await;
        if self.cleanup.should_run(sample.under_pressure()) {
            info!(
                "Running cleanup after job {} (pressure: {})",
                ctx.id,
                sample.under_pressure()
            );
            self.backends.release_ready();
        }
    }

    async fn health(&self) -> ProcessorHealth {
        ProcessorHealth {
            devices: self.monitor.inventory().info(),
            resources: self.monitor.sample().await,
            backends: self.backends.statuses(),
            worker_pool_size: self.backends.pool().size(),
            workers_busy: self.backends.pool().busy(),
        }
    }
}
