//! Per-video ingest state and batch reporting
//!
//! The ingest row is the resumability anchor: every video advances
//! monotonically through the status set, errors accrue a retry count, and
//! three strikes park the video as skipped until an explicit reset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Errors beyond this count park the video as skipped.
pub const MAX_RETRIES: u32 = 3;

/// Persisted pipeline position for one video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Pending,
    Transcribed,
    Chunked,
    Embedded,
    Upserted,
    Done,
    Error,
    NeedsWhisper,
    Skipped,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Transcribed => "transcribed",
            IngestStatus::Chunked => "chunked",
            IngestStatus::Embedded => "embedded",
            IngestStatus::Upserted => "upserted",
            IngestStatus::Done => "done",
            IngestStatus::Error => "error",
            IngestStatus::NeedsWhisper => "needs_whisper",
            IngestStatus::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(IngestStatus::Pending),
            "transcribed" => Some(IngestStatus::Transcribed),
            "chunked" => Some(IngestStatus::Chunked),
            "embedded" => Some(IngestStatus::Embedded),
            "upserted" => Some(IngestStatus::Upserted),
            "done" => Some(IngestStatus::Done),
            "error" => Some(IngestStatus::Error),
            "needs_whisper" => Some(IngestStatus::NeedsWhisper),
            "skipped" => Some(IngestStatus::Skipped),
            _ => None,
        }
    }
}

/// One row of persisted ingest state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestState {
    pub video_id: String,
    pub status: IngestStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub has_yt_transcript: bool,
    pub has_whisper: bool,
    pub enhanced_asr_used: bool,
    pub monologue_fast_path: bool,
    pub diarization_failed: bool,
    pub chunk_count: usize,
    pub embedding_count: usize,
    pub updated_at: DateTime<Utc>,
}

impl IngestState {
    pub fn new(video_id: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            status: IngestStatus::Pending,
            retry_count: 0,
            last_error: None,
            has_yt_transcript: false,
            has_whisper: false,
            enhanced_asr_used: false,
            monologue_fast_path: false,
            diarization_failed: false,
            chunk_count: 0,
            embedding_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Re-entry rule: completed and struck-out videos are skipped, every
    /// other state resumes from the top of the pipeline.
    pub fn should_skip(&self) -> bool {
        match self.status {
            IngestStatus::Done | IngestStatus::Skipped => true,
            IngestStatus::Error => self.retry_count >= MAX_RETRIES,
            _ => false,
        }
    }
}

/// Structured per-video outcome emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoReport {
    pub video_id: String,
    pub success: bool,
    #[serde(default)]
    pub skipped: bool,
    pub method: Option<String>,
    pub chunks: usize,
    pub processing_time: f64,
    pub error: Option<String>,
}

impl VideoReport {
    pub fn skipped(video_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            success: false,
            skipped: true,
            method: None,
            chunks: 0,
            processing_time: 0.0,
            error: Some(reason.into()),
        }
    }
}

/// Aggregate batch summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_chunks: usize,
    pub total_processing_time: f64,

    /// Attribution share across all successfully processed audio
    pub speaker_time_percentages: HashMap<String, f64>,

    pub reports: Vec<VideoReport>,
}

impl IngestionSummary {
    pub fn from_reports(reports: Vec<VideoReport>, speaker_seconds: HashMap<String, f64>) -> Self {
        let total = reports.len();
        let succeeded = reports.iter().filter(|r| r.success).count();
        let skipped = reports.iter().filter(|r| r.skipped).count();
        let failed = total - succeeded - skipped;
        let total_chunks = reports.iter().map(|r| r.chunks).sum();
        let total_processing_time = reports.iter().map(|r| r.processing_time).sum();

        let attributed_total: f64 = speaker_seconds.values().sum();
        let speaker_time_percentages = if attributed_total > 0.0 {
            speaker_seconds
                .into_iter()
                .map(|(speaker, secs)| (speaker, secs / attributed_total * 100.0))
                .collect()
        } else {
            HashMap::new()
        };

        Self {
            total,
            succeeded,
            failed,
            skipped,
            total_chunks,
            total_processing_time,
            speaker_time_percentages,
            reports,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64 * 100.0
    }
}
