use std::path::{Path, PathBuf};

use anyhow::Result;
use parking_lot::RwLock;
use tracing::{debug, info};

#[cfg(feature = "whisper")]
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::asr::{AsrEngine, AsrParams, TranscribeResult};
#[cfg(feature = "whisper")]
use crate::asr::{TranscribeSegment, WHISPER_SAMPLE_RATE};

/// Reported when a decode produced no tokens to average over.
#[cfg(feature = "whisper")]
const DEFAULT_CONFIDENCE: f32 = 0.8;

pub struct WhisperAsr {
    name: String,
    model_path: PathBuf,
    params: AsrParams,
    #[cfg(feature = "whisper")]
    whisper_ctx: RwLock<Option<WhisperContext>>,
    #[cfg(not(feature = "whisper"))]
    whisper_ctx: RwLock<Option<()>>,
}

impl WhisperAsr {
    pub fn new(name: impl Into<String>, model_path: impl Into<PathBuf>, params: AsrParams) -> Self {
        Self {
            name: name.into(),
            model_path: model_path.into(),
            params,
            whisper_ctx: RwLock::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.whisper_ctx.read().is_some()
    }

    #[cfg(feature = "whisper")]
    fn build_params(&self) -> FullParams<'_, '_> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });

        // 设置使用的线程数，提高并行处理能力
        params.set_n_threads(self.params.n_threads);

        // 未指定语言时自动检测
        params.set_language(Some(self.params.language.as_deref().unwrap_or("auto")));

        // 设置采样温度。较低的值会使输出更加确定
        params.set_temperature(0.3);

        // 禁用翻译功能
        params.set_translate(false);

        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        // 启用上下文可以提高长音频的识别准确度
        params.set_no_context(false);
        params.set_single_segment(false);

        params.set_suppress_blank(true);
        params.set_suppress_non_speech_tokens(true);

        params
    }
}

impl AsrEngine for WhisperAsr {
    fn name(&self) -> &str {
        &self.name
    }

    #[cfg(feature = "whisper")]
    fn load(&self) -> Result<()> {
        if !self.model_path.exists() {
            anyhow::bail!("model file {} does not exist", self.model_path.display());
        }
        let model_path = self
            .model_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("model path {} is not valid UTF-8", self.model_path.display()))?;

        let mut ctx_params = WhisperContextParameters::default();
        ctx_params.use_gpu = self.params.use_gpu;

        info!("Loading whisper model {} from {}", self.name, self.model_path.display());
        let ctx = WhisperContext::new_with_params(model_path, ctx_params)
            .map_err(|e| anyhow::anyhow!("failed to open whisper model: {}", e))?;
        *self.whisper_ctx.write() = Some(ctx);
        Ok(())
    }

    #[cfg(not(feature = "whisper"))]
    fn load(&self) -> Result<()> {
        debug!(
            "{} requested ({} threads, gpu {}) but whisper support is not compiled in",
            self.name, self.params.n_threads, self.params.use_gpu
        );
        anyhow::bail!(
            "{} unavailable: built without the `whisper` feature (model {})",
            self.name,
            self.model_path.display()
        )
    }

    #[cfg(feature = "whisper")]
    fn transcribe(&self, audio: &Path, device: Option<u32>) -> Result<TranscribeResult> {
        let (samples, sample_rate) = crate::audio::read_canonical(audio)?;
        if sample_rate != WHISPER_SAMPLE_RATE {
            anyhow::bail!("whisper expects {} Hz input, got {} Hz", WHISPER_SAMPLE_RATE, sample_rate);
        }
        let duration_seconds = samples.len() as f64 / sample_rate as f64;

        let guard = self.whisper_ctx.read();
        let ctx = guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("{} is not loaded", self.name))?;
        debug!("{} transcribing {} on device {:?}", self.name, audio.display(), device);

        let mut state = ctx.create_state()?;
        state.full(self.build_params(), &samples)?;
        let num_segments = state.full_n_segments()?;

        let mut segments = Vec::new();
        let mut full_text = String::new();
        let mut prob_sum = 0.0f32;
        let mut token_count = 0usize;

        for i in 0..num_segments {
            let text = state.full_get_segment_text(i)?;
            // 时间戳单位为 10ms
            let start = state.full_get_segment_t0(i)? as f64 / 100.0;
            let end = state.full_get_segment_t1(i)? as f64 / 100.0;

            for t in 0..state.full_n_tokens(i)? {
                prob_sum += state.full_get_token_prob(i, t)?;
                token_count += 1;
            }

            full_text.push_str(&text);
            segments.push(TranscribeSegment { text, start, end });
        }

        let confidence = if token_count == 0 {
            DEFAULT_CONFIDENCE
        } else {
            (prob_sum / token_count as f32).clamp(0.0, 1.0)
        };

        Ok(TranscribeResult {
            segments,
            full_text: full_text.trim().to_string(),
            confidence,
            duration_seconds,
            model_name: self.name.clone(),
        })
    }

    #[cfg(not(feature = "whisper"))]
    fn transcribe(&self, audio: &Path, _device: Option<u32>) -> Result<TranscribeResult> {
        anyhow::bail!("{} cannot transcribe {}: whisper support is not compiled in", self.name, audio.display())
    }

    fn unload(&self) {
        if self.whisper_ctx.write().take().is_some() {
            info!("Unloaded whisper model {}", self.name);
        }
    }
}
