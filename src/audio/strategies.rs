use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tempfile::TempPath;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{decode_wav, write_wav};

/// One way of turning an input file into mono samples at a target rate.
#[async_trait]
pub trait DecodeStrategy: Send + Sync {
    fn name(&self) -> &str;
    async fn decode(&self, path: &Path, target_rate: u32) -> Result<Vec<f32>>;
}

async fn decode_wav_blocking(path: PathBuf, target_rate: u32) -> Result<Vec<f32>> {
    tokio::task::spawn_blocking(move || decode_wav(&path, target_rate))
        .await
        .map_err(|e| anyhow::anyhow!("wav decoder did not complete: {}", e))?
}

fn intermediate_wav(work_dir: &Path, prefix: &str) -> Result<TempPath> {
    Ok(tempfile::Builder::new()
        .prefix(prefix)
        .suffix(".wav")
        .tempfile_in(work_dir)?
        .into_temp_path())
}

/// Direct decode with hound. Handles PCM and float WAV.
#[derive(Debug, Default, Clone, Copy)]
pub struct HoundDecoder;

#[async_trait]
impl DecodeStrategy for HoundDecoder {
    fn name(&self) -> &str {
        "hound"
    }

    async fn decode(&self, path: &Path, target_rate: u32) -> Result<Vec<f32>> {
        decode_wav_blocking(path.to_path_buf(), target_rate).await
    }
}

/// Demux and decode with symphonia into an intermediate WAV, then hand that
/// file to the hound decoder.
#[derive(Debug, Clone)]
pub struct SymphoniaTranscoder {
    work_dir: PathBuf,
}

impl SymphoniaTranscoder {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl DecodeStrategy for SymphoniaTranscoder {
    fn name(&self) -> &str {
        "symphonia"
    }

    async fn decode(&self, path: &Path, target_rate: u32) -> Result<Vec<f32>> {
        let source = path.to_path_buf();
        let work_dir = self.work_dir.clone();

        // the intermediate file is removed when the TempPath drops
        let intermediate = tokio::task::spawn_blocking(move || -> Result<TempPath> {
            let (samples, sample_rate) = decode_with_symphonia(&source)?;
            let intermediate = intermediate_wav(&work_dir, "symphonia-")?;
            write_wav(&intermediate, &samples, sample_rate)?;
            Ok(intermediate)
        })
        .await
        .map_err(|e| anyhow::anyhow!("symphonia decoder did not complete: {}", e))??;

        decode_wav_blocking(intermediate.to_path_buf(), target_rate).await
    }
}

/// Decode any container symphonia can probe into mono samples at the
/// source rate.
fn decode_with_symphonia(path: &Path) -> Result<(Vec<f32>, u32)> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| anyhow::anyhow!("probe: {}", e))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| anyhow::anyhow!("no audio track found"))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| anyhow::anyhow!("unknown sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| anyhow::anyhow!("codec: {}", e))?;

    let mut mono: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => anyhow::bail!("packet: {}", e),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping corrupt audio frame: {}", e);
                continue;
            }
            Err(e) => anyhow::bail!("decode: {}", e),
        };

        let spec = *decoded.spec();
        let frames = decoded.frames();
        if frames == 0 {
            continue;
        }
        let channels = spec.channels.count().max(1);
        let mut buffer = SampleBuffer::<f32>::new(frames as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        mono.extend(
            buffer
                .samples()
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32),
        );
    }

    debug!("symphonia decoded {} samples at {} Hz from {}", mono.len(), sample_rate, path.display());
    Ok((mono, sample_rate))
}

/// Last resort: shell out to ffmpeg with a bounded runtime and read its WAV
/// output back with hound.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    program: String,
    timeout: Duration,
    work_dir: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(program: impl Into<String>, timeout: Duration, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl DecodeStrategy for FfmpegTranscoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn decode(&self, path: &Path, target_rate: u32) -> Result<Vec<f32>> {
        let output_path = intermediate_wav(&self.work_dir, "ffmpeg-")?;

        let child = Command::new(&self.program)
            .arg("-nostdin")
            .args(["-hide_banner", "-loglevel", "error"])
            .arg("-i")
            .arg(path)
            .args(["-ac", "1"])
            .arg("-ar")
            .arg(target_rate.to_string())
            .args(["-f", "wav", "-y"])
            .arg(output_path.as_os_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", self.program, self.timeout))?
            .map_err(|e| anyhow::anyhow!("Failed to execute {}: {}", self.program, e))?;

        if !output.status.success() {
            anyhow::bail!(
                "{} conversion failed with status {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        decode_wav_blocking(output_path.to_path_buf(), target_rate).await
    }
}
