//! Accessibility probe
//!
//! Cheap simulate-only pre-check that a remote video is fetchable before
//! any GPU time is committed to it. Exercises the same extractor path as a
//! real download but writes nothing.

use crate::audio::acquirer::classify_downloader_failure;
use crate::config::PipelineConfig;
use crate::error::AcquisitionKind;
use crate::listing::VideoDescriptor;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Accessible,
    MembersOnly,
    Inaccessible,
}

impl ProbeOutcome {
    pub fn is_accessible(&self) -> bool {
        matches!(self, ProbeOutcome::Accessible)
    }
}

/// Runs simulate-only downloads under a bounded semaphore.
pub struct AccessibilityProbe {
    config: Arc<PipelineConfig>,
    probe_slots: Arc<Semaphore>,
}

impl AccessibilityProbe {
    pub fn new(config: Arc<PipelineConfig>, probe_slots: Arc<Semaphore>) -> Self {
        Self {
            config,
            probe_slots,
        }
    }

    /// Probe one descriptor. Local files are always accessible; any
    /// downloader failure other than a recognized gating pattern reports
    /// plain inaccessibility.
    pub async fn probe(&self, descriptor: &VideoDescriptor) -> ProbeOutcome {
        if !descriptor.is_remote() {
            return ProbeOutcome::Accessible;
        }

        let _permit = match self.probe_slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return ProbeOutcome::Inaccessible,
        };

        let mut cmd = Command::new(&self.config.downloader_bin);
        cmd.args(["--simulate", "--no-warnings", "--no-playlist"]);
        if let Some(proxy) = &self.config.downloader_proxy {
            cmd.args(["--proxy", proxy]);
        }
        cmd.arg(&descriptor.url_or_path)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(PROBE_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!("Probe spawn failed for {}: {e}", descriptor.video_id);
                return ProbeOutcome::Inaccessible;
            }
            Err(_) => {
                warn!("Probe timed out for {}", descriptor.video_id);
                return ProbeOutcome::Inaccessible;
            }
        };

        if output.status.success() {
            debug!("Probe OK: {}", descriptor.video_id);
            return ProbeOutcome::Accessible;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        match classify_downloader_failure(&stderr) {
            Some(AcquisitionKind::MembersOnly) => {
                info!(
                    "Skipping members-only video {}: {}",
                    descriptor.video_id,
                    descriptor.title.chars().take(50).collect::<String>()
                );
                ProbeOutcome::MembersOnly
            }
            _ => {
                info!("Video inaccessible: {}", descriptor.video_id);
                ProbeOutcome::Inaccessible
            }
        }
    }

    /// Convenience wrapper matching the boolean contract.
    pub async fn is_accessible(&self, descriptor: &VideoDescriptor) -> bool {
        self.probe(descriptor).await.is_accessible()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_descriptors_skip_the_downloader() {
        let config = Arc::new(PipelineConfig::default());
        let probe = AccessibilityProbe::new(config, Arc::new(Semaphore::new(1)));
        let descriptor = VideoDescriptor::local("clip", "Clip", "/media/clip.wav");
        assert!(probe.is_accessible(&descriptor).await);
    }

    #[tokio::test]
    async fn missing_downloader_reports_inaccessible() {
        let mut config = PipelineConfig::default();
        config.downloader_bin = "/nonexistent/downloader-bin".to_string();
        let probe = AccessibilityProbe::new(Arc::new(config), Arc::new(Semaphore::new(1)));
        let descriptor =
            VideoDescriptor::remote("vid1", "Video", "https://example.com/watch?v=vid1");
        assert_eq!(probe.probe(&descriptor).await, ProbeOutcome::Inaccessible);
    }
}
