use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod registry;
pub mod stub;
pub mod whisper;

pub use registry::{BackendRegistry, BackendStatus, LoadState};
pub use stub::DegradedStub;
pub use whisper::WhisperAsr;

/// The only input rate the whisper tiers accept.
pub const WHISPER_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone)]
pub struct AsrParams {
    pub language: Option<String>,
    pub n_threads: i32,
    pub use_gpu: bool,
}

impl Default for AsrParams {
    fn default() -> Self {
        Self::new()
    }
}

impl AsrParams {
    pub fn new() -> Self {
        Self {
            language: None,
            n_threads: 8,
            use_gpu: false,
        }
    }

    pub fn set_language(&mut self, language: Option<String>) -> &mut Self {
        self.language = language;
        self
    }

    pub fn set_n_threads(&mut self, n_threads: i32) -> &mut Self {
        self.n_threads = n_threads.max(1);
        self
    }

    pub fn set_use_gpu(&mut self, use_gpu: bool) -> &mut Self {
        self.use_gpu = use_gpu;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscribeResult {
    pub segments: Vec<TranscribeSegment>,
    pub full_text: String,
    /// In [0, 1].
    pub confidence: f32,
    pub duration_seconds: f64,
    pub model_name: String,
}

/// One transcription backend tier.
///
/// Every call is blocking and runs on the worker pool, never on the async
/// runtime. `audio` always points at a canonical mono WAV.
pub trait AsrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// How many `transcribe` calls may run at once against this engine.
    fn max_concurrency(&self) -> usize {
        1
    }

    fn load(&self) -> Result<()>;

    fn transcribe(&self, audio: &Path, device: Option<u32>) -> Result<TranscribeResult>;

    /// 释放模型占用的内存，下次使用时重新加载
    fn unload(&self) {}
}
