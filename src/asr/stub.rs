use std::path::Path;

use anyhow::Result;
use hound::WavReader;

use crate::asr::{AsrEngine, TranscribeResult};

pub const STUB_MODEL_NAME: &str = "degraded-stub";

/// Last tier of the chain. It always loads and never calls a model, so the
/// service keeps answering on hosts with no usable backend. Its results are
/// placeholders and say so in `model_name`.
#[derive(Debug, Default)]
pub struct DegradedStub;

impl DegradedStub {
    pub fn new() -> Self {
        Self
    }
}

impl AsrEngine for DegradedStub {
    fn name(&self) -> &str {
        STUB_MODEL_NAME
    }

    fn max_concurrency(&self) -> usize {
        16
    }

    fn load(&self) -> Result<()> {
        Ok(())
    }

    fn transcribe(&self, audio: &Path, _device: Option<u32>) -> Result<TranscribeResult> {
        let reader = WavReader::open(audio)
            .map_err(|e| anyhow::anyhow!("failed to open canonical audio {}: {}", audio.display(), e))?;
        let spec = reader.spec();
        let frames = reader.duration() as f64;
        let duration_seconds = if spec.sample_rate == 0 {
            0.0
        } else {
            frames / spec.sample_rate as f64
        };

        Ok(TranscribeResult {
            segments: Vec::new(),
            full_text: format!(
                "[{}] placeholder transcript for {:.1}s of audio, no transcription backend was available",
                STUB_MODEL_NAME, duration_seconds
            ),
            confidence: 0.0,
            duration_seconds,
            model_name: STUB_MODEL_NAME.to_string(),
        })
    }
}
