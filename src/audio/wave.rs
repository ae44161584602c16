//! WAV sample I/O and frame-level signal helpers
//!
//! Everything downstream of the transcoder works on 16 kHz mono f32
//! samples; this module is the single place that touches WAV encoding.

use anyhow::{Context, Result};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

pub const SAMPLE_RATE: u32 = 16_000;

/// Load a WAV file as mono f32 samples in [-1.0, 1.0].
///
/// Stereo input is averaged down to mono. The sample rate must already be
/// 16 kHz; resampling is the transcoder's job.
pub fn load_mono_16k(path: &Path) -> Result<Vec<f32>> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("failed to open WAV {}", path.display()))?;
    let spec = reader.spec();

    if spec.sample_rate != SAMPLE_RATE {
        anyhow::bail!(
            "expected {SAMPLE_RATE} Hz audio, got {} Hz in {}",
            spec.sample_rate,
            path.display()
        );
    }

    let samples: Vec<f32> = match spec.sample_format {
        SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("failed to read samples")?
                .into_iter()
                .map(|s| s as f32 / max_val)
                .collect()
        }
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("failed to read samples")?,
    };

    let mono = match spec.channels {
        1 => samples,
        channels => {
            let channels = channels as usize;
            samples
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        }
    };

    Ok(mono)
}

/// Write mono f32 samples as 16 kHz signed-16-bit PCM.
pub fn write_mono_16k(path: &Path, samples: &[f32]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("failed to create WAV {}", path.display()))?;
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * i16::MAX as f32) as i16)?;
    }
    writer.finalize().context("failed to finalize WAV")?;
    Ok(())
}

/// Inspect a WAV header without decoding samples.
pub fn probe_spec(path: &Path) -> Result<(WavSpec, f64)> {
    let reader =
        WavReader::open(path).with_context(|| format!("failed to open WAV {}", path.display()))?;
    let spec = reader.spec();
    let duration = reader.duration() as f64 / spec.sample_rate as f64;
    Ok((spec, duration))
}

/// Scale samples so the absolute peak is 1.0. Silence is left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
    if peak > 0.0 {
        for sample in samples.iter_mut() {
            *sample /= peak;
        }
    }
}

/// Mean absolute amplitude, used as the silence gate for embedding windows.
pub fn mean_abs(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
}

/// Frame-level RMS energy with the given frame and hop sizes.
pub fn rms_frames(samples: &[f32], frame_len: usize, hop_len: usize) -> Vec<f32> {
    if samples.len() < frame_len || frame_len == 0 || hop_len == 0 {
        return Vec::new();
    }
    let mut frames = Vec::with_capacity((samples.len() - frame_len) / hop_len + 1);
    let mut start = 0;
    while start + frame_len <= samples.len() {
        let frame = &samples[start..start + frame_len];
        let energy = frame.iter().map(|s| s * s).sum::<f32>() / frame_len as f32;
        frames.push(energy.sqrt());
        start += hop_len;
    }
    frames
}
