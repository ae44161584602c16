//! Audio acquisition
//!
//! Turns a video descriptor into a normalized 16 kHz mono s16 PCM file via
//! the external downloader and transcoder. Concurrency is bounded by the
//! orchestrator's download semaphore; all intermediate files live in the
//! caller's scratch directory.

use crate::audio::wave;
use crate::config::PipelineConfig;
use crate::error::{AcquisitionKind, PipelineError};
use crate::listing::{SourceType, VideoDescriptor};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);
const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(300);

/// Container extensions the downloader is known to emit.
const RAW_EXTENSIONS: [&str; 5] = ["webm", "mp4", "m4a", "ogg", "opus"];

/// Diagnostic patterns for gated content, matched case-insensitively
/// against downloader stderr.
const MEMBERS_ONLY_PATTERNS: [&str; 3] = [
    "members-only",
    "join this channel",
    "available to this channel's members",
];
const NOT_FOUND_PATTERNS: [&str; 3] = ["video unavailable", "private video", "does not exist"];

/// Normalized PCM audio owned by a single video task. The backing file is
/// removed on drop unless the artifact was persisted.
#[derive(Debug)]
pub struct AudioArtifact {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_seconds: f64,
    keep: bool,
}

impl AudioArtifact {
    /// Mark the file as persisted; drop will leave it in place.
    pub fn persist(&mut self) {
        self.keep = true;
    }
}

impl Drop for AudioArtifact {
    fn drop(&mut self) {
        if !self.keep && self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove audio artifact {}: {e}", self.path.display());
            }
        }
    }
}

/// Thin wrapper over the external media transcoder.
#[derive(Debug, Clone)]
pub struct Transcoder {
    bin: String,
}

impl Transcoder {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Normalize any input into 16 kHz mono s16 PCM WAV.
    pub async fn normalize(
        &self,
        input: &Path,
        output: &Path,
        trim_silence: bool,
    ) -> Result<(), PipelineError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-i")
            .arg(input)
            .args(["-ac", "1", "-ar", "16000", "-sample_fmt", "s16", "-vn"]);
        if trim_silence {
            // Conservative: only leading silence, peak detection, -50 dBFS
            cmd.args([
                "-af",
                "silenceremove=start_periods=1:start_silence=0.1:start_threshold=-50dB:detection=peak",
            ]);
        }
        cmd.arg("-y").arg(output);
        run_tool(cmd, TRANSCODE_TIMEOUT, AcquisitionKind::DecodeFailed).await?;
        if !output.exists() {
            return Err(PipelineError::acquisition(
                AcquisitionKind::DecodeFailed,
                format!("transcoder produced no output for {}", input.display()),
            ));
        }
        Ok(())
    }

    /// Extract `[start, start + duration)` into its own WAV snippet.
    pub async fn extract_span(
        &self,
        input: &Path,
        output: &Path,
        start: f64,
        duration: f64,
    ) -> Result<(), PipelineError> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-i")
            .arg(input)
            .args(["-ss", &format!("{start:.3}"), "-t", &format!("{duration:.3}")])
            .args(["-ac", "1", "-ar", "16000", "-sample_fmt", "s16"])
            .arg("-y")
            .arg(output);
        run_tool(cmd, TRANSCODE_TIMEOUT, AcquisitionKind::DecodeFailed).await?;
        Ok(())
    }
}

/// Acquires audio for descriptors under a bounded download semaphore.
pub struct AudioAcquirer {
    config: Arc<PipelineConfig>,
    transcoder: Transcoder,
    download_slots: Arc<Semaphore>,
}

impl AudioAcquirer {
    pub fn new(config: Arc<PipelineConfig>, download_slots: Arc<Semaphore>) -> Self {
        let transcoder = Transcoder::new(config.transcoder_bin.clone());
        Self {
            config,
            transcoder,
            download_slots,
        }
    }

    pub fn transcoder(&self) -> &Transcoder {
        &self.transcoder
    }

    /// Produce the normalized artifact for one descriptor, writing
    /// intermediates under `scratch`.
    pub async fn acquire(
        &self,
        descriptor: &VideoDescriptor,
        scratch: &Path,
    ) -> Result<AudioArtifact, PipelineError> {
        if let (Some(max), Some(duration)) = (
            self.config.max_duration_seconds,
            descriptor.duration_seconds,
        ) {
            if duration > max {
                return Err(PipelineError::acquisition(
                    AcquisitionKind::TooLong,
                    format!("{} runs {duration:.0}s, cap is {max:.0}s", descriptor.video_id),
                ));
            }
        }

        let _permit = self
            .download_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| {
                PipelineError::acquisition(AcquisitionKind::Network, "download slots closed")
            })?;

        let raw = match descriptor.source_type {
            SourceType::Remote => Some(self.download_raw(descriptor, scratch).await?),
            SourceType::Local => None,
        };
        let input = raw
            .as_deref()
            .unwrap_or_else(|| Path::new(&descriptor.url_or_path));

        if !input.exists() {
            return Err(PipelineError::acquisition(
                AcquisitionKind::NotFound,
                format!("input media {} does not exist", input.display()),
            ));
        }

        let output = scratch.join(format!("{}.wav", descriptor.video_id));
        if !self.config.trim_silence && already_normalized(input) {
            // Local WAVs straight from a prior run need no transcoder pass
            std::fs::copy(input, &output).map_err(|e| {
                PipelineError::acquisition(
                    AcquisitionKind::DecodeFailed,
                    format!("failed to stage {}: {e}", input.display()),
                )
            })?;
        } else {
            self.transcoder
                .normalize(input, &output, self.config.trim_silence)
                .await?;
        }

        if let Some(raw_path) = raw {
            if let Err(e) = std::fs::remove_file(&raw_path) {
                warn!("Failed to remove raw download {}: {e}", raw_path.display());
            }
        }

        let (spec, duration_seconds) = wave::probe_spec(&output).map_err(|e| {
            PipelineError::acquisition(AcquisitionKind::DecodeFailed, e.to_string())
        })?;
        if duration_seconds <= 0.0 {
            return Err(PipelineError::acquisition(
                AcquisitionKind::DecodeFailed,
                format!("{} decoded to zero samples", descriptor.video_id),
            ));
        }

        let mut artifact = AudioArtifact {
            path: output,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            duration_seconds,
            keep: false,
        };

        if !self.config.production_mode {
            if let Some(storage_dir) = &self.config.audio_storage_dir {
                let stored = storage_dir.join(format!("{}.wav", descriptor.video_id));
                if let Err(e) = std::fs::create_dir_all(storage_dir)
                    .and_then(|_| std::fs::copy(&artifact.path, &stored).map(|_| ()))
                {
                    warn!("Failed to persist audio for {}: {e}", descriptor.video_id);
                } else {
                    debug!("Persisted audio to {}", stored.display());
                }
            }
        }

        info!(
            "Acquired {} ({:.1}s at {} Hz)",
            descriptor.video_id, artifact.duration_seconds, artifact.sample_rate
        );
        // Task owns the scratch copy either way
        artifact.keep = false;
        Ok(artifact)
    }

    async fn download_raw(
        &self,
        descriptor: &VideoDescriptor,
        scratch: &Path,
    ) -> Result<PathBuf, PipelineError> {
        let template = scratch.join(format!("{}_raw.%(ext)s", descriptor.video_id));
        let mut cmd = Command::new(&self.config.downloader_bin);
        cmd.args(["-f", "bestaudio/best", "--no-playlist", "--no-progress"])
            .arg("-o")
            .arg(&template);
        if let Some(proxy) = &self.config.downloader_proxy {
            cmd.args(["--proxy", proxy]);
        }
        if let Some(cookies) = &self.config.downloader_cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(&descriptor.url_or_path);

        let stderr = match run_tool(cmd, DOWNLOAD_TIMEOUT, AcquisitionKind::Network).await {
            Ok(stderr) => stderr,
            Err(PipelineError::Acquisition { kind, message }) => {
                return Err(PipelineError::acquisition(
                    classify_downloader_failure(&message).unwrap_or(kind),
                    message,
                ));
            }
            Err(other) => return Err(other),
        };
        debug!("Downloader finished for {}: {stderr}", descriptor.video_id);

        for ext in RAW_EXTENSIONS {
            let candidate = scratch.join(format!("{}_raw.{ext}", descriptor.video_id));
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(PipelineError::acquisition(
            AcquisitionKind::Network,
            format!("downloader wrote no file for {}", descriptor.video_id),
        ))
    }
}

/// Map downloader stderr to a closed failure kind.
pub fn classify_downloader_failure(stderr: &str) -> Option<AcquisitionKind> {
    let lowered = stderr.to_ascii_lowercase();
    if MEMBERS_ONLY_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Some(AcquisitionKind::MembersOnly);
    }
    if NOT_FOUND_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return Some(AcquisitionKind::NotFound);
    }
    None
}

fn already_normalized(path: &Path) -> bool {
    if path.extension().and_then(|e| e.to_str()) != Some("wav") {
        return false;
    }
    match wave::probe_spec(path) {
        Ok((spec, _)) => {
            spec.sample_rate == wave::SAMPLE_RATE
                && spec.channels == 1
                && spec.bits_per_sample == 16
                && spec.sample_format == hound::SampleFormat::Int
        }
        Err(_) => false,
    }
}

/// Run a subprocess with a timeout, returning captured stderr on success.
async fn run_tool(
    mut cmd: Command,
    timeout: Duration,
    failure_kind: AcquisitionKind,
) -> Result<String, PipelineError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            PipelineError::acquisition(
                failure_kind,
                format!("subprocess timed out after {}s", timeout.as_secs()),
            )
        })?
        .map_err(|e| {
            PipelineError::acquisition(failure_kind, format!("failed to spawn subprocess: {e}"))
        })?;

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        return Err(PipelineError::acquisition(
            failure_kind,
            format!("subprocess exited with {}: {stderr}", output.status),
        ));
    }
    Ok(stderr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wave::SAMPLE_RATE;

    #[test]
    fn classifies_downloader_stderr() {
        assert_eq!(
            classify_downloader_failure("ERROR: Join this channel to get access"),
            Some(AcquisitionKind::MembersOnly)
        );
        assert_eq!(
            classify_downloader_failure("ERROR: Video unavailable"),
            Some(AcquisitionKind::NotFound)
        );
        assert_eq!(classify_downloader_failure("connection reset"), None);
    }

    #[test]
    fn recognizes_already_normalized_wavs() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.wav");
        wave::write_mono_16k(&good, &vec![0.1f32; SAMPLE_RATE as usize]).unwrap();
        assert!(already_normalized(&good));

        let other = dir.path().join("clip.mp3");
        std::fs::write(&other, b"not audio").unwrap();
        assert!(!already_normalized(&other));
    }

    #[tokio::test]
    async fn local_wav_acquisition_skips_transcoder() {
        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("episode.wav");
        wave::write_mono_16k(&media, &vec![0.2f32; SAMPLE_RATE as usize * 2]).unwrap();

        let config = Arc::new(PipelineConfig::default());
        let acquirer = AudioAcquirer::new(config, Arc::new(Semaphore::new(2)));
        let descriptor = VideoDescriptor::local(
            "episode",
            "Episode",
            media.to_string_lossy().into_owned(),
        );

        let scratch = tempfile::tempdir().unwrap();
        let artifact = acquirer
            .acquire(&descriptor, scratch.path())
            .await
            .unwrap();
        assert_eq!(artifact.sample_rate, SAMPLE_RATE);
        assert_eq!(artifact.channels, 1);
        assert!((artifact.duration_seconds - 2.0).abs() < 0.01);
        assert!(artifact.path.exists());
    }

    #[tokio::test]
    async fn missing_local_input_maps_to_not_found() {
        let config = Arc::new(PipelineConfig::default());
        let acquirer = AudioAcquirer::new(config, Arc::new(Semaphore::new(1)));
        let descriptor = VideoDescriptor::local("ghost", "Ghost", "/nonexistent/ghost.wav");

        let scratch = tempfile::tempdir().unwrap();
        let err = acquirer
            .acquire(&descriptor, scratch.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Acquisition {
                kind: AcquisitionKind::NotFound,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn over_length_remote_video_is_rejected_before_download() {
        let mut config = PipelineConfig::default();
        config.max_duration_seconds = Some(60.0);
        let acquirer = AudioAcquirer::new(Arc::new(config), Arc::new(Semaphore::new(1)));

        let mut descriptor =
            VideoDescriptor::remote("long1", "Marathon", "https://example.com/watch?v=long1");
        descriptor.duration_seconds = Some(7200.0);

        let scratch = tempfile::tempdir().unwrap();
        let err = acquirer
            .acquire(&descriptor, scratch.path())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Acquisition {
                kind: AcquisitionKind::TooLong,
                ..
            }
        ));
    }
}
