use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::asr::WHISPER_SAMPLE_RATE;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_UPLOAD_PATH: &str = "./asr_data/uploads/";
const DEFAULT_WORK_PATH: &str = "./asr_data/work/";
const DEFAULT_LOG_PATH: &str = "./logs";
const DEFAULT_PRIMARY_MODEL: &str = "./models/ggml-large-v3.bin";
const DEFAULT_BASELINE_MODEL: &str = "./models/ggml-base.bin";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub audio: AudioSettings,
    pub backends: BackendSettings,
    pub resources: ResourceSettings,
    pub scheduler: SchedulerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub bind_addr: SocketAddr,
    pub upload_dir: PathBuf,
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AudioSettings {
    pub work_dir: PathBuf,
    pub target_sample_rate: u32,
    pub normalize: bool,
    pub ffmpeg_path: String,
    pub ffmpeg_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub primary_model: PathBuf,
    pub baseline_model: PathBuf,
    pub language: Option<String>,
    pub whisper_threads: i32,
}

#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub min_available_memory_gb: f64,
    pub max_memory_percent: f64,
    pub min_device_free_memory_gb: f64,
    pub nvidia_smi_path: String,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// `None` derives the pool size from the detected hardware.
    pub worker_pool_size: Option<usize>,
    pub clear_cache_after_job: bool,
    pub cleanup_on_pressure: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            upload_dir: PathBuf::from(DEFAULT_UPLOAD_PATH),
            log_dir: PathBuf::from(DEFAULT_LOG_PATH),
        }
    }
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(DEFAULT_WORK_PATH),
            target_sample_rate: WHISPER_SAMPLE_RATE,
            normalize: true,
            ffmpeg_path: "ffmpeg".to_string(),
            ffmpeg_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            primary_model: PathBuf::from(DEFAULT_PRIMARY_MODEL),
            baseline_model: PathBuf::from(DEFAULT_BASELINE_MODEL),
            language: None,
            whisper_threads: 8,
        }
    }
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            min_available_memory_gb: 8.0,
            max_memory_percent: 95.0,
            min_device_free_memory_gb: 1.0,
            nvidia_smi_path: "nvidia-smi".to_string(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            worker_pool_size: None,
            clear_cache_after_job: false,
            cleanup_on_pressure: true,
        }
    }
}

impl Settings {
    /// 从环境变量读取配置，其次是 .env 文件，最后使用默认值
    pub fn from_env() -> Self {
        let audio_defaults = AudioSettings::default();
        let backend_defaults = BackendSettings::default();
        let resource_defaults = ResourceSettings::default();
        let scheduler_defaults = SchedulerSettings::default();

        let server_defaults = ServerSettings::default();

        Self {
            server: ServerSettings {
                bind_addr: parsed("ASR_BIND_ADDR", server_defaults.bind_addr),
                upload_dir: lookup("ASR_UPLOAD_PATH").map(PathBuf::from).unwrap_or(server_defaults.upload_dir),
                log_dir: lookup("ASR_LOG_PATH").map(PathBuf::from).unwrap_or(server_defaults.log_dir),
            },
            audio: AudioSettings {
                work_dir: lookup("ASR_WORK_PATH").map(PathBuf::from).unwrap_or(audio_defaults.work_dir),
                target_sample_rate: whisper_rate(parsed("ASR_TARGET_SAMPLE_RATE", audio_defaults.target_sample_rate)),
                normalize: parsed("ASR_NORMALIZE_AUDIO", audio_defaults.normalize),
                ffmpeg_path: lookup("ASR_FFMPEG_PATH").unwrap_or(audio_defaults.ffmpeg_path),
                ffmpeg_timeout: Duration::from_secs(parsed(
                    "ASR_FFMPEG_TIMEOUT_SECS",
                    audio_defaults.ffmpeg_timeout.as_secs(),
                )),
            },
            backends: BackendSettings {
                primary_model: lookup("ASR_PRIMARY_MODEL").map(PathBuf::from).unwrap_or(backend_defaults.primary_model),
                baseline_model: lookup("ASR_BASELINE_MODEL").map(PathBuf::from).unwrap_or(backend_defaults.baseline_model),
                language: lookup("ASR_LANGUAGE").filter(|lang| !lang.trim().is_empty()),
                whisper_threads: parsed("ASR_WHISPER_THREADS", backend_defaults.whisper_threads),
            },
            resources: ResourceSettings {
                min_available_memory_gb: parsed("ASR_MIN_AVAILABLE_MEMORY_GB", resource_defaults.min_available_memory_gb),
                max_memory_percent: parsed("ASR_MAX_MEMORY_PERCENT", resource_defaults.max_memory_percent),
                min_device_free_memory_gb: parsed("ASR_MIN_DEVICE_FREE_MEMORY_GB", resource_defaults.min_device_free_memory_gb),
                nvidia_smi_path: lookup("ASR_NVIDIA_SMI_PATH").unwrap_or(resource_defaults.nvidia_smi_path),
            },
            scheduler: SchedulerSettings {
                worker_pool_size: lookup("ASR_WORKER_POOL_SIZE")
                    .and_then(|raw| parse_or_warn::<usize>("ASR_WORKER_POOL_SIZE", &raw))
                    .filter(|size| *size > 0),
                clear_cache_after_job: parsed("ASR_CLEAR_CACHE_AFTER_JOB", scheduler_defaults.clear_cache_after_job),
                cleanup_on_pressure: parsed("ASR_CLEANUP_ON_PRESSURE", scheduler_defaults.cleanup_on_pressure),
            },
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    DEFAULT_BIND_ADDR
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8000)))
}

// whisper 层只接受 16 kHz，其他采样率会让所有任务落到 stub
fn whisper_rate(requested: u32) -> u32 {
    if requested != WHISPER_SAMPLE_RATE {
        warn!(
            "ASR_TARGET_SAMPLE_RATE={} is not supported by the whisper tiers, using {} Hz",
            requested, WHISPER_SAMPLE_RATE
        );
    }
    WHISPER_SAMPLE_RATE
}

fn lookup(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => Some(value),
        Err(_) => dotenv::var(key).ok(),
    }
}

fn parsed<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .and_then(|raw| parse_or_warn(key, &raw))
        .unwrap_or(default)
}

fn parse_or_warn<T>(key: &str, raw: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring invalid value {:?} for {}: {}", raw, key, e);
            None
        }
    }
}
