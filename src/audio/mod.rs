pub mod strategies;

use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::Result;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use rayon::prelude::*;
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction};
use serde::{Deserialize, Serialize};
use tempfile::TempPath;
use tracing::{debug, info, warn};

use crate::config::AudioSettings;
use crate::error::SchedulerError;
pub use strategies::{DecodeStrategy, FfmpegTranscoder, HoundDecoder, SymphoniaTranscoder};

const RESAMPLE_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    M4a,
    Aac,
    Flac,
    Ogg,
    Wma,
    Opus,
}

impl AudioFormat {
    pub const SUPPORTED: [AudioFormat; 8] = [
        Self::Wav,
        Self::Mp3,
        Self::M4a,
        Self::Aac,
        Self::Flac,
        Self::Ogg,
        Self::Wma,
        Self::Opus,
    ];

    /// Case-insensitive, the leading dot is optional.
    pub fn from_extension(extension: &str) -> Option<Self> {
        let extension = extension.trim().trim_start_matches('.').to_ascii_lowercase();
        Self::SUPPORTED
            .into_iter()
            .find(|format| format.extension() == extension)
    }

    /// Like `from_extension`, but names the supported list on failure.
    pub fn parse(declared: &str) -> crate::error::Result<Self> {
        Self::from_extension(declared).ok_or_else(|| {
            let supported: Vec<String> = Self::SUPPORTED
                .iter()
                .map(|format| format!(".{}", format.extension()))
                .collect();
            SchedulerError::InvalidInput(format!(
                "unsupported audio format {:?}, supported: {}",
                declared,
                supported.join(", ")
            ))
        })
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Aac => "aac",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
            Self::Wma => "wma",
            Self::Opus => "opus",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Wav => "WAV Audio",
            Self::Mp3 => "MP3 Audio",
            Self::M4a => "M4A Audio",
            Self::Aac => "AAC Audio",
            Self::Flac => "FLAC Audio",
            Self::Ogg => "OGG Audio",
            Self::Wma => "WMA Audio",
            Self::Opus => "OPUS Audio",
        }
    }
}

impl Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// The normalized decode of one input: mono, fixed rate, stored as a float
/// WAV in the work directory. Dropping it deletes the file.
#[derive(Debug)]
pub struct CanonicalAudio {
    path: TempPath,
    pub sample_rate: u32,
    pub num_samples: usize,
    /// Name of the decode strategy that produced it.
    pub strategy: String,
}

impl CanonicalAudio {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.num_samples as f64 / self.sample_rate as f64
    }
}

/// 音频预处理：依次尝试各种解码策略，第一个成功的结果即为标准音频
pub struct AudioNormalizer {
    strategies: Vec<Box<dyn DecodeStrategy>>,
    work_dir: PathBuf,
    target_sample_rate: u32,
    normalize: bool,
}

impl AudioNormalizer {
    pub fn new(settings: &AudioSettings) -> Self {
        let strategies: Vec<Box<dyn DecodeStrategy>> = vec![
            Box::new(HoundDecoder),
            Box::new(SymphoniaTranscoder::new(&settings.work_dir)),
            Box::new(FfmpegTranscoder::new(
                &settings.ffmpeg_path,
                settings.ffmpeg_timeout,
                &settings.work_dir,
            )),
        ];
        Self::with_strategies(settings, strategies)
    }

    pub fn with_strategies(settings: &AudioSettings, strategies: Vec<Box<dyn DecodeStrategy>>) -> Self {
        Self {
            strategies,
            work_dir: settings.work_dir.clone(),
            target_sample_rate: settings.target_sample_rate,
            normalize: settings.normalize,
        }
    }

    pub fn strategy_names(&self) -> Vec<&str> {
        self.strategies.iter().map(|strategy| strategy.name()).collect()
    }

    pub async fn normalize(&self, path: &Path) -> crate::error::Result<CanonicalAudio> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            match strategy.decode(path, self.target_sample_rate).await {
                Ok(samples) if samples.is_empty() => {
                    warn!("Strategy {} decoded zero samples from {}", strategy.name(), path.display());
                    failures.push(format!("{}: decoded zero samples", strategy.name()));
                }
                Ok(samples) => {
                    info!(
                        "Decoded {} with {} ({} samples at {} Hz)",
                        path.display(),
                        strategy.name(),
                        samples.len(),
                        self.target_sample_rate
                    );
                    return self.write_canonical(samples, strategy.name()).await;
                }
                Err(e) => {
                    warn!("Strategy {} failed for {}: {:#}", strategy.name(), path.display(), e);
                    failures.push(format!("{}: {:#}", strategy.name(), e));
                }
            }
        }

        Err(SchedulerError::UnreadableAudio(if failures.is_empty() {
            "no decode strategies configured".to_string()
        } else {
            failures.join("; ")
        }))
    }

    async fn write_canonical(&self, samples: Vec<f32>, strategy: &str) -> crate::error::Result<CanonicalAudio> {
        let work_dir = self.work_dir.clone();
        let sample_rate = self.target_sample_rate;
        let normalize = self.normalize;

        let written = tokio::task::spawn_blocking(move || -> Result<(TempPath, usize)> {
            let samples = if normalize { normalize_audio(&samples) } else { samples };
            let path = tempfile::Builder::new()
                .prefix("canonical-")
                .suffix(".wav")
                .tempfile_in(&work_dir)?
                .into_temp_path();
            write_wav(&path, &samples, sample_rate)?;
            Ok((path, samples.len()))
        })
        .await
        .map_err(|e| SchedulerError::Internal(format!("canonical audio writer did not complete: {}", e)))?;

        let (path, num_samples) =
            written.map_err(|e| SchedulerError::Internal(format!("failed to write canonical audio: {:#}", e)))?;
        debug!("Canonical audio written to {}", path.display());

        Ok(CanonicalAudio {
            path,
            sample_rate,
            num_samples,
            strategy: strategy.to_string(),
        })
    }
}

/// 读取WAV文件，返回交错的样本（范围 [-1, 1]）、通道数和采样率
pub fn read_wav_file(path: &Path) -> Result<(Vec<f32>, usize, u32)> {
    let mut reader = WavReader::open(path).map_err(|e| anyhow::anyhow!("Failed to read WAV file: {}", e))?;
    let spec = reader.spec();
    let num_channels = spec.channels as usize;
    if num_channels == 0 {
        anyhow::bail!("WAV file declares zero channels");
    }

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Float, 32) => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to read samples: {}", e))?,
        (SampleFormat::Int, bits @ 1..=32) => {
            let scale = (1u64 << (bits - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|val| val as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| anyhow::anyhow!("Failed to read samples: {}", e))?
        }
        (format, bits) => anyhow::bail!("Unsupported WAV encoding: {:?} {} bits", format, bits),
    };

    Ok((samples, num_channels, spec.sample_rate))
}

/// Decode a WAV into mono samples at `target_rate`.
pub fn decode_wav(path: &Path, target_rate: u32) -> Result<Vec<f32>> {
    let (samples, num_channels, sample_rate) = read_wav_file(path)?;
    debug!("Original sample rate: {} Hz, {} channel(s)", sample_rate, num_channels);
    let mono = convert_to_mono(&samples, num_channels);
    resample_audio(&mono, sample_rate, target_rate)
}

/// Read a canonical file back as (samples, sample rate).
pub fn read_canonical(path: &Path) -> Result<(Vec<f32>, u32)> {
    let (samples, num_channels, sample_rate) = read_wav_file(path)?;
    Ok((convert_to_mono(&samples, num_channels), sample_rate))
}

pub(crate) fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}

/// 将多声道音频转换为单声道，对每帧的所有通道取平均值
pub fn convert_to_mono(samples: &[f32], num_channels: usize) -> Vec<f32> {
    if num_channels <= 1 {
        return samples.to_vec();
    }
    samples
        .par_chunks(num_channels)
        .map(|chunk| chunk.iter().sum::<f32>() / chunk.len() as f32)
        .collect()
}

/// 归一化音频到 [-1, 1]。静音保持不变
pub fn normalize_audio(samples: &[f32]) -> Vec<f32> {
    let max_abs = samples.par_iter().map(|s| s.abs()).reduce(|| 0.0f32, f32::max);
    if max_abs <= f32::EPSILON {
        return samples.to_vec();
    }
    samples.par_iter().map(|&s| s / max_abs).collect()
}

/// 重采样到目标采样率，按固定块处理以限制内存占用
pub fn resample_audio(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if from_rate == 0 || to_rate == 0 {
        anyhow::bail!("invalid resample {} Hz -> {} Hz", from_rate, to_rate);
    }
    debug!("Resampling from {} Hz to {} Hz", from_rate, to_rate);

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = to_rate as f64 / from_rate as f64;
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| anyhow::anyhow!("resampler init: {}", e))?;

    let expected_len = (samples.len() as f64 * ratio) as usize;
    let mut output = Vec::with_capacity(expected_len + RESAMPLE_CHUNK);
    for chunk in samples.chunks(RESAMPLE_CHUNK) {
        let mut input = chunk.to_vec();
        input.resize(RESAMPLE_CHUNK, 0.0);
        let result = resampler
            .process(&[input], None)
            .map_err(|e| anyhow::anyhow!("resample: {}", e))?;
        if let Some(channel) = result.first() {
            output.extend_from_slice(channel);
        }
    }
    output.truncate(expected_len);
    Ok(output)
}
