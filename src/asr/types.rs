//! Transcription result types
//!
//! Sentence-level segments carry the whisper quality metrics that drive
//! selective refinement; words carry per-token confidence plus the speaker
//! attribution written by the aligner.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Word-level token with optional speaker attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WordToken {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub asr_confidence: f32,
    pub speaker: Option<String>,
    pub speaker_confidence: Option<f32>,
    pub speaker_margin: Option<f32>,
    #[serde(default)]
    pub is_overlap: bool,
}

/// Sentence-level ASR segment with quality metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub avg_logprob: f32,
    pub compression_ratio: f32,
    pub no_speech_prob: f32,
    #[serde(default)]
    pub needs_refinement: bool,
    #[serde(default)]
    pub was_refined: bool,

    /// Index of the span head this segment was merged into during
    /// refinement, if any
    pub merged_into: Option<usize>,

    pub speaker: Option<String>,
    pub speaker_confidence: Option<f32>,
}

/// One diarization cluster turn after profile attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeakerSegment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
    pub confidence: f32,
    pub margin: f32,
    pub cluster_id: Option<usize>,
    #[serde(default)]
    pub is_overlap: bool,
}

/// Per-speaker confidence statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfidenceStats {
    pub min: f32,
    pub max: f32,
    pub avg: f32,
}

/// Aggregate attribution summary attached to a finished result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeakerSummary {
    pub total_duration: f64,
    pub speaker_time_percentages: HashMap<String, f64>,
    pub confidence_stats: HashMap<String, ConfidenceStats>,
    pub unknown_segments: usize,
}

/// How a video's transcript was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptionMethod {
    MonologueFastPath,
    FullPipeline,
}

impl TranscriptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionMethod::MonologueFastPath => "monologue_fast_path",
            TranscriptionMethod::FullPipeline => "full_enhanced_pipeline",
        }
    }
}

/// Result metadata accumulated across pipeline stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionMetadata {
    pub method: TranscriptionMethod,
    pub primary_model: String,
    pub refinement_model: Option<String>,
    pub language: String,
    pub duration: f64,
    #[serde(default)]
    pub monologue_fast_path: bool,

    /// Mean fast-path similarity to the primary profile, when the gate ran
    pub primary_similarity: Option<f32>,

    #[serde(default)]
    pub diarization_failed: bool,
    #[serde(default)]
    pub diarization_fallback: bool,
    #[serde(default)]
    pub low_quality_segments: usize,
    #[serde(default)]
    pub refined_segments: usize,
    #[serde(default)]
    pub diarization_turns: usize,
    #[serde(default)]
    pub identified_speakers: usize,
    pub summary: Option<SpeakerSummary>,
}

impl TranscriptionMetadata {
    pub fn new(
        primary_model: impl Into<String>,
        language: impl Into<String>,
        duration: f64,
    ) -> Self {
        Self {
            method: TranscriptionMethod::FullPipeline,
            primary_model: primary_model.into(),
            refinement_model: None,
            language: language.into(),
            duration,
            monologue_fast_path: false,
            primary_similarity: None,
            diarization_failed: false,
            diarization_fallback: false,
            low_quality_segments: 0,
            refined_segments: 0,
            diarization_turns: 0,
            identified_speakers: 0,
            summary: None,
        }
    }
}

/// Complete transcription with attribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub segments: Vec<AsrSegment>,
    pub words: Vec<WordToken>,
    pub speakers: Vec<SpeakerSegment>,
    pub metadata: TranscriptionMetadata,
}

impl TranscriptionResult {
    /// Indices and spans of segments flagged for refinement.
    pub fn low_confidence_spans(&self) -> Vec<(f64, f64, usize)> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.needs_refinement)
            .map(|(idx, s)| (s.start, s.end, idx))
            .collect()
    }

    /// Label every segment and word with one speaker. Used by the
    /// monologue fast-path and the diarization-failure fallback.
    pub fn label_all(&mut self, speaker: &str, confidence: f32) {
        for segment in &mut self.segments {
            segment.speaker = Some(speaker.to_string());
            segment.speaker_confidence = Some(confidence);
        }
        for word in &mut self.words {
            word.speaker = Some(speaker.to_string());
            word.speaker_confidence = Some(confidence);
        }
    }

    /// Recompute the per-speaker time/confidence summary from the current
    /// speaker segments.
    pub fn add_summary_stats(&mut self, unknown_label: &str) {
        let mut total_duration = 0.0f64;
        let mut speaker_times: HashMap<String, f64> = HashMap::new();
        let mut confidences: HashMap<String, Vec<f32>> = HashMap::new();

        for segment in &self.speakers {
            let duration = segment.end - segment.start;
            total_duration += duration;
            *speaker_times.entry(segment.speaker.clone()).or_default() += duration;
            confidences
                .entry(segment.speaker.clone())
                .or_default()
                .push(segment.confidence);
        }

        let mut percentages = HashMap::new();
        if total_duration > 0.0 {
            for (speaker, time) in &speaker_times {
                percentages.insert(speaker.clone(), time / total_duration * 100.0);
            }
        }

        let confidence_stats = confidences
            .into_iter()
            .map(|(speaker, values)| {
                let min = values.iter().copied().fold(f32::INFINITY, f32::min);
                let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let avg = values.iter().sum::<f32>() / values.len() as f32;
                (speaker, ConfidenceStats { min, max, avg })
            })
            .collect();

        let unknown_segments = self
            .speakers
            .iter()
            .filter(|s| s.speaker == unknown_label)
            .count();

        self.metadata.summary = Some(SpeakerSummary {
            total_duration,
            speaker_time_percentages: percentages,
            confidence_stats,
            unknown_segments,
        });
    }
}
