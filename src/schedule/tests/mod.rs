use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::time::sleep;

use crate::asr::registry::tests::FakeEngine;
use crate::asr::{AsrEngine, AsrParams, BackendRegistry, DegradedStub, WhisperAsr};
use crate::audio::tests::{settings, write_int_wav};
use crate::audio::AudioNormalizer;
use crate::config::ResourceSettings;
use crate::device::monitor::tests::StaticProbe;
use crate::device::{Device, DeviceInventory, PressureThresholds, ResourceMonitor};
use crate::error::SchedulerError;
use crate::schedule::processors::{
    CleanupPolicy, JobContext, JobProcessor, ProcessorHealth, ProgressReporter, TranscribeProcessor,
};
use crate::schedule::scheduler::{JobScheduler, WorkerPool};
use crate::schedule::types::{JobOutcome, JobSnapshot, JobStatus, TranscriptionResult};

// 测试辅助结构：调度器及其临时目录
struct Harness {
    scheduler: JobScheduler,
    uploads: TempDir,
    work: TempDir,
}

impl Harness {
    // 写入一段静音 WAV 并提交
    fn submit_silence(&self, name: &str, seconds: usize) -> Result<String> {
        let path = self.uploads.path().join(name);
        write_int_wav(&path, 1, 16_000, 16_000 * seconds, 0);
        let size = std::fs::metadata(&path)?.len();
        Ok(self.scheduler.submit(path, "wav", size)?)
    }

    fn work_files(&self) -> usize {
        std::fs::read_dir(self.work.path()).map(|dir| dir.count()).unwrap_or(0)
    }
}

// 创建测试环境
fn harness(engines: Vec<Arc<dyn AsrEngine>>, devices: Vec<Device>) -> Harness {
    let uploads = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();

    let monitor = Arc::new(ResourceMonitor::new(
        Arc::new(DeviceInventory::from_devices(devices)),
        Arc::new(StaticProbe::healthy()),
        PressureThresholds::from(&ResourceSettings::default()),
    ));
    let normalizer = Arc::new(AudioNormalizer::new(&settings(work.path())));
    let backends = Arc::new(BackendRegistry::new(engines, WorkerPool::new(4)));
    let processor = TranscribeProcessor::new(
        monitor,
        normalizer,
        backends,
        CleanupPolicy {
            after_every_job: false,
            on_pressure: true,
        },
    );

    Harness {
        scheduler: JobScheduler::new(Arc::new(processor)),
        uploads,
        work,
    }
}

// 等待任务进入终态
async fn wait_for_terminal(scheduler: &JobScheduler, job_id: &str) -> Result<JobSnapshot> {
    for _ in 0..250 {
        let snapshot = scheduler.get_status(job_id)?;
        if snapshot.status.is_terminal() {
            return Ok(snapshot);
        }
        sleep(Duration::from_millis(20)).await;
    }
    anyhow::bail!("job {} did not reach a terminal state", job_id)
}

async fn wait_for_idle(scheduler: &JobScheduler) {
    for _ in 0..250 {
        if scheduler.active_tasks() == 0 {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

fn whisper_tiers() -> Vec<Arc<dyn AsrEngine>> {
    vec![
        Arc::new(WhisperAsr::new("whisper-large-v3", "/nonexistent/ggml-large-v3.bin", AsrParams::new())),
        Arc::new(WhisperAsr::new("whisper-base", "/nonexistent/ggml-base.bin", AsrParams::new())),
        Arc::new(DegradedStub::new()),
    ]
}

#[tokio::test]
async fn silence_completes_with_duration_and_model() -> Result<()> {
    let h = harness(vec![FakeEngine::healthy("primary")], Vec::new());
    let job_id = h.submit_silence("silence.wav", 2)?;
    assert_eq!(h.scheduler.get_status(&job_id)?.status, JobStatus::Pending);
    assert_eq!(h.scheduler.get_result(&job_id)?, JobOutcome::InProgress(JobStatus::Pending));

    h.scheduler.start(&job_id)?;
    let snapshot = wait_for_terminal(&h.scheduler, &job_id).await?;
    assert_eq!(snapshot.status, JobStatus::Completed);
    assert_eq!(snapshot.progress.map(|p| p.percent), Some(100));
    assert!(snapshot.started_at.is_some() && snapshot.completed_at.is_some());

    match h.scheduler.get_result(&job_id)? {
        JobOutcome::Completed(result) => {
            assert!((result.duration_seconds - 2.0).abs() < 0.01);
            assert_eq!(result.model_name, "primary");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn missing_models_degrade_to_the_stub() -> Result<()> {
    let h = harness(whisper_tiers(), Vec::new());
    let job_id = h.submit_silence("silence.wav", 2)?;
    h.scheduler.start(&job_id)?;
    wait_for_terminal(&h.scheduler, &job_id).await?;

    match h.scheduler.get_result(&job_id)? {
        JobOutcome::Completed(result) => {
            assert_eq!(result.model_name, "degraded-stub");
            assert_eq!(result.confidence, 0.0);
            assert!((result.duration_seconds - 2.0).abs() < 0.01);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn unrecognized_format_creates_no_job() {
    let h = harness(vec![FakeEngine::healthy("primary")], Vec::new());
    let err = h
        .scheduler
        .submit(PathBuf::from("/tmp/notes.xyz"), "xyz", 128)
        .unwrap_err();
    assert_eq!(err.code(), "InvalidInput");

    let err = h.scheduler.submit(PathBuf::from("/tmp/empty.wav"), "wav", 0).unwrap_err();
    assert_eq!(err.code(), "InvalidInput");
    assert!(h.scheduler.jobs().is_empty());
}

#[tokio::test]
async fn all_tiers_failing_fails_the_job() -> Result<()> {
    let h = harness(
        vec![
            FakeEngine::unloadable("primary"),
            FakeEngine::unloadable("baseline"),
            FakeEngine::unloadable("stub"),
        ],
        Vec::new(),
    );
    let job_id = h.submit_silence("silence.wav", 1)?;
    h.scheduler.start(&job_id)?;
    let snapshot = wait_for_terminal(&h.scheduler, &job_id).await?;
    assert_eq!(snapshot.status, JobStatus::Failed);

    match h.scheduler.get_result(&job_id)? {
        JobOutcome::Failed(error) => assert!(error.contains("NoBackendAvailable")),
        other => panic!("unexpected outcome {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn single_device_serves_concurrent_jobs() -> Result<()> {
    let h = harness(vec![FakeEngine::healthy("primary")], vec![Device::new(0, "gpu0", 24_576)]);
    let first = h.submit_silence("a.wav", 1)?;
    let second = h.submit_silence("b.wav", 1)?;
    h.scheduler.start(&second)?;
    h.scheduler.start(&first)?;

    for job_id in [&first, &second] {
        let snapshot = wait_for_terminal(&h.scheduler, job_id).await?;
        assert_eq!(snapshot.status, JobStatus::Completed);
        assert_eq!(snapshot.assigned_device, Some(0));
        match h.scheduler.get_result(job_id)? {
            JobOutcome::Completed(result) => assert_eq!(result.device_used, Some(0)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    Ok(())
}

// 处理过程中阻塞，直到测试放行
struct GatedProcessor {
    release: Arc<Notify>,
}

#[async_trait]
impl JobProcessor for GatedProcessor {
    async fn process(&self, _ctx: &JobContext, progress: &ProgressReporter) -> crate::error::Result<TranscriptionResult> {
        progress.report("transcribing", 50);
        self.release.notified().await;
        Ok(TranscriptionResult {
            text: "late".to_string(),
            confidence: 0.5,
            duration_seconds: 1.0,
            model_name: "gated".to_string(),
            device_used: None,
            segments: Vec::new(),
        })
    }

    async fn cleanup(&self, _ctx: &JobContext) {}

    async fn health(&self) -> ProcessorHealth {
        ProcessorHealth::default()
    }
}

#[tokio::test]
async fn deleting_a_processing_job_is_not_undone_by_its_task() -> Result<()> {
    let uploads = tempfile::tempdir()?;
    let path = uploads.path().join("long.wav");
    write_int_wav(&path, 1, 16_000, 1600, 0);

    let release = Arc::new(Notify::new());
    let scheduler = JobScheduler::new(Arc::new(GatedProcessor { release: release.clone() }));
    let job_id = scheduler.submit(path.clone(), ".wav", 3244)?;
    scheduler.start(&job_id)?;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(scheduler.get_status(&job_id)?.status, JobStatus::Processing);
    assert_eq!(scheduler.active_tasks(), 1);

    scheduler.delete(&job_id).await?;
    assert!(!path.exists());
    release.notify_one();
    wait_for_idle(&scheduler).await;

    assert_eq!(scheduler.active_tasks(), 0);
    assert_eq!(scheduler.get_status(&job_id).unwrap_err().code(), "NotFound");
    assert!(scheduler.jobs().is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = harness(vec![FakeEngine::healthy("primary")], Vec::new());
    assert!(matches!(h.scheduler.get_status("missing"), Err(SchedulerError::NotFound(_))));
    assert!(matches!(h.scheduler.get_result("missing"), Err(SchedulerError::NotFound(_))));
    assert!(matches!(h.scheduler.delete("missing").await, Err(SchedulerError::NotFound(_))));
    assert!(matches!(h.scheduler.start("missing"), Err(SchedulerError::NotFound(_))));
}

#[tokio::test]
async fn a_job_can_only_be_started_once() -> Result<()> {
    let h = harness(vec![FakeEngine::healthy("primary")], Vec::new());
    let job_id = h.submit_silence("once.wav", 1)?;
    h.scheduler.start(&job_id)?;
    let err = h.scheduler.start(&job_id).unwrap_err();
    assert_eq!(err.code(), "InvalidState");

    wait_for_terminal(&h.scheduler, &job_id).await?;
    let err = h.scheduler.start(&job_id).unwrap_err();
    assert_eq!(err.code(), "InvalidState");
    Ok(())
}

#[tokio::test]
async fn healthy_primary_is_always_preferred() -> Result<()> {
    let primary = FakeEngine::healthy("primary");
    let baseline = FakeEngine::healthy("baseline");
    let stub = FakeEngine::healthy("stub");
    let h = harness(vec![primary.clone(), baseline.clone(), stub.clone()], Vec::new());

    let mut ids = Vec::new();
    for i in 0..5 {
        let job_id = h.submit_silence(&format!("clip-{}.wav", i), 1)?;
        h.scheduler.start(&job_id)?;
        ids.push(job_id);
    }
    for job_id in &ids {
        wait_for_terminal(&h.scheduler, job_id).await?;
        match h.scheduler.get_result(job_id)? {
            JobOutcome::Completed(result) => assert_eq!(result.model_name, "primary"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(primary.loads(), 1);
    assert_eq!(baseline.calls() + stub.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn failed_tier_is_never_reloaded_across_jobs() -> Result<()> {
    let primary = FakeEngine::unloadable("primary");
    let baseline = FakeEngine::healthy("baseline");
    let h = harness(vec![primary.clone(), baseline.clone()], Vec::new());

    for i in 0..3 {
        let job_id = h.submit_silence(&format!("clip-{}.wav", i), 1)?;
        h.scheduler.start(&job_id)?;
        wait_for_terminal(&h.scheduler, &job_id).await?;
    }
    assert_eq!(primary.loads(), 1);
    assert_eq!(baseline.calls(), 3);
    Ok(())
}

#[tokio::test]
async fn no_intermediate_files_survive_a_terminal_job() -> Result<()> {
    let h = harness(vec![FakeEngine::healthy("primary")], Vec::new());

    let ok = h.submit_silence("ok.wav", 1)?;
    let garbage_path = h.uploads.path().join("garbage.mp3");
    std::fs::write(&garbage_path, b"this is not an mp3 stream")?;
    let garbage = h.scheduler.submit(garbage_path, "mp3", 25)?;

    h.scheduler.start(&ok)?;
    h.scheduler.start(&garbage)?;
    assert_eq!(wait_for_terminal(&h.scheduler, &ok).await?.status, JobStatus::Completed);
    assert_eq!(wait_for_terminal(&h.scheduler, &garbage).await?.status, JobStatus::Failed);
    wait_for_idle(&h.scheduler).await;

    match h.scheduler.get_result(&garbage)? {
        JobOutcome::Failed(error) => assert!(error.starts_with("UnreadableAudio")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(h.work_files(), 0);
    Ok(())
}

struct PanickingProcessor;

#[async_trait]
impl JobProcessor for PanickingProcessor {
    async fn process(&self, _ctx: &JobContext, _progress: &ProgressReporter) -> crate::error::Result<TranscriptionResult> {
        panic!("decoder segfault stand-in")
    }

    async fn cleanup(&self, _ctx: &JobContext) {}

    async fn health(&self) -> ProcessorHealth {
        ProcessorHealth::default()
    }
}

#[tokio::test]
async fn a_panicking_pipeline_only_fails_its_job() -> Result<()> {
    let scheduler = JobScheduler::new(Arc::new(PanickingProcessor));
    let job_id = scheduler.submit(PathBuf::from("/tmp/does-not-matter.flac"), "flac", 10)?;
    scheduler.start(&job_id)?;
    let snapshot = wait_for_terminal(&scheduler, &job_id).await?;
    assert_eq!(snapshot.status, JobStatus::Failed);
    match scheduler.get_result(&job_id)? {
        JobOutcome::Failed(error) => assert!(error.starts_with("Internal")),
        other => panic!("unexpected outcome {:?}", other),
    }

    // the scheduler keeps accepting work
    let next = scheduler.submit(PathBuf::from("/tmp/next.flac"), "flac", 10)?;
    assert_eq!(scheduler.get_status(&next)?.status, JobStatus::Pending);
    Ok(())
}

#[tokio::test]
async fn shutdown_aborts_in_flight_tasks() -> Result<()> {
    let scheduler = JobScheduler::new(Arc::new(GatedProcessor {
        release: Arc::new(Notify::new()),
    }));
    let job_id = scheduler.submit(PathBuf::from("/tmp/stuck.ogg"), "ogg", 10)?;
    scheduler.start(&job_id)?;
    assert_eq!(scheduler.shutdown(), 1);
    assert_eq!(scheduler.active_tasks(), 0);
    Ok(())
}

#[tokio::test]
async fn health_reports_jobs_and_backends() -> Result<()> {
    let h = harness(whisper_tiers(), vec![Device::new(0, "gpu0", 8192)]);
    let job_id = h.submit_silence("a.wav", 1)?;
    h.submit_silence("b.wav", 1)?;
    h.scheduler.start(&job_id)?;
    wait_for_terminal(&h.scheduler, &job_id).await?;
    wait_for_idle(&h.scheduler).await;

    let report = h.scheduler.health().await;
    assert_eq!(report.status, "healthy");
    assert_eq!(report.jobs.completed, 1);
    assert_eq!(report.jobs.pending, 1);
    assert_eq!(report.active_tasks, 0);
    assert_eq!(report.processor.backends.len(), 3);
    assert_eq!(report.processor.devices.len(), 1);
    assert_eq!(report.processor.worker_pool_size, 4);

    let json = serde_json::to_value(&report)?;
    assert!(json.get("backends").is_some());
    assert_eq!(json["backends"][0]["state"]["state"], "failed");
    Ok(())
}
