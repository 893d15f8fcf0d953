pub mod asr;
pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod schedule;
pub mod utils;
pub mod web;

use std::sync::Arc;

use asr::{AsrEngine, AsrParams, BackendRegistry, DegradedStub, WhisperAsr};
use audio::AudioNormalizer;
use config::Settings;
use device::{optimal_workers, DeviceInventory, HostProbe, PressureThresholds, ResourceMonitor};
use schedule::{CleanupPolicy, JobScheduler, TranscribeProcessor, WorkerPool};
use tracing::info;

pub use error::{Result, SchedulerError};

pub struct AppContext {
    pub settings: Settings,
    pub scheduler: Arc<JobScheduler>,
}

/// 按配置组装设备、后端链与调度器
pub async fn build_context(settings: Settings) -> anyhow::Result<AppContext> {
    tokio::fs::create_dir_all(&settings.server.upload_dir).await?;
    tokio::fs::create_dir_all(&settings.audio.work_dir).await?;

    info!("Discovering devices...");
    let inventory = Arc::new(DeviceInventory::discover(&settings.resources.nvidia_smi_path).await);
    let monitor = Arc::new(ResourceMonitor::new(
        inventory.clone(),
        Arc::new(HostProbe::new(settings.resources.nvidia_smi_path.clone())),
        PressureThresholds::from(&settings.resources),
    ));

    let pool_size = match settings.scheduler.worker_pool_size {
        Some(size) => size,
        None => {
            let sample = monitor.sample().await;
            let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
            optimal_workers(cpus, sample.memory_available_gb.unwrap_or(0.0), inventory.len())
        }
    };
    info!("Worker pool size: {}", pool_size);

    let mut params = AsrParams::new();
    params
        .set_language(settings.backends.language.clone())
        .set_n_threads(settings.backends.whisper_threads)
        .set_use_gpu(!inventory.is_empty());

    let engines: Vec<Arc<dyn AsrEngine>> = vec![
        Arc::new(WhisperAsr::new(
            "whisper-large-v3",
            settings.backends.primary_model.clone(),
            params.clone(),
        )),
        Arc::new(WhisperAsr::new(
            "whisper-base",
            settings.backends.baseline_model.clone(),
            params,
        )),
        Arc::new(DegradedStub::new()),
    ];
    let backends = Arc::new(BackendRegistry::new(engines, WorkerPool::new(pool_size)));

    let processor = TranscribeProcessor::new(
        monitor,
        Arc::new(AudioNormalizer::new(&settings.audio)),
        backends,
        CleanupPolicy::from(&settings.scheduler),
    );

    Ok(AppContext {
        scheduler: Arc::new(JobScheduler::new(Arc::new(processor))),
        settings,
    })
}
