//! Transcript output formats
//!
//! Renders a finished transcription as SRT, WebVTT, speaker-grouped plain
//! text, JSON, word-level JSON, or a human summary. Speaker prefixes are
//! `"<Speaker>: "` and are omitted for the unknown sentinel.

use crate::asr::types::TranscriptionResult;
use crate::error::PipelineError;
use std::fmt::Write as _;

/// Formatter bound to a primary-speaker name and unknown label.
pub struct TranscriptFormatter {
    primary_speaker: String,
    unknown_label: String,
}

impl TranscriptFormatter {
    pub fn new(primary_speaker: impl Into<String>, unknown_label: impl Into<String>) -> Self {
        Self {
            primary_speaker: primary_speaker.into(),
            unknown_label: unknown_label.into(),
        }
    }

    /// Full structured result as JSON.
    pub fn to_json(&self, result: &TranscriptionResult) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(result)
            .map_err(|e| PipelineError::chunking(format!("JSON encoding failed: {e}")))
    }

    /// SRT with `HH:MM:SS,mmm` timestamps and speaker prefixes.
    pub fn to_srt(&self, result: &TranscriptionResult) -> String {
        let mut out = String::new();
        let mut cue = 1usize;
        for segment in &result.segments {
            if segment.text.trim().is_empty() {
                continue;
            }
            let _ = writeln!(out, "{cue}");
            let _ = writeln!(
                out,
                "{} --> {}",
                format_timestamp_srt(segment.start),
                format_timestamp_srt(segment.end)
            );
            let _ = writeln!(
                out,
                "{}{}",
                self.speaker_prefix(segment.speaker.as_deref()),
                segment.text.trim()
            );
            out.push('\n');
            cue += 1;
        }
        out
    }

    /// WebVTT with `HH:MM:SS.mmm` timestamps and speaker CSS classes.
    pub fn to_vtt(&self, result: &TranscriptionResult) -> String {
        let mut out = String::from("WEBVTT\n\n");
        out.push_str("STYLE\n");
        out.push_str("::cue(.chaffee) { color: #2196F3; font-weight: bold; }\n");
        out.push_str("::cue(.guest) { color: #FF9800; }\n");
        out.push_str("::cue(.unknown) { color: #999; font-style: italic; }\n\n");

        for segment in &result.segments {
            if segment.text.trim().is_empty() {
                continue;
            }
            let _ = writeln!(
                out,
                "{} --> {}",
                format_timestamp_vtt(segment.start),
                format_timestamp_vtt(segment.end)
            );
            let class = self.speaker_class(segment.speaker.as_deref());
            let prefix = self.speaker_prefix(segment.speaker.as_deref());
            let text = segment.text.trim();
            if prefix.is_empty() {
                let _ = writeln!(out, "<c.{class}>{text}</c>");
            } else {
                let _ = writeln!(out, "<c.{class}>{prefix}{text}</c>");
            }
            out.push('\n');
        }
        out
    }

    /// Plain text grouped by consecutive speaker.
    pub fn to_speaker_text(&self, result: &TranscriptionResult) -> String {
        let mut out = String::new();
        let mut current_speaker: Option<String> = None;
        let mut block: Vec<&str> = Vec::new();

        for segment in &result.segments {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            let speaker = segment
                .speaker
                .clone()
                .unwrap_or_else(|| self.unknown_label.clone());
            if current_speaker.as_ref() != Some(&speaker) {
                self.flush_block(&mut out, current_speaker.as_deref(), &block);
                block.clear();
                current_speaker = Some(speaker);
            }
            block.push(text);
        }
        self.flush_block(&mut out, current_speaker.as_deref(), &block);
        out.trim_end().to_string()
    }

    /// Word-level JSON: one record per word with timing and attribution.
    pub fn to_word_json(&self, result: &TranscriptionResult) -> Result<String, PipelineError> {
        serde_json::to_string_pretty(&result.words)
            .map_err(|e| PipelineError::chunking(format!("JSON encoding failed: {e}")))
    }

    /// Human summary: duration, per-speaker share, attribution confidence.
    pub fn summary_report(&self, result: &TranscriptionResult) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== Transcription Summary ===");
        let _ = writeln!(out, "Method: {}", result.metadata.method.as_str());
        let _ = writeln!(out, "Model: {}", result.metadata.primary_model);
        let _ = writeln!(out, "Duration: {:.1}s", result.metadata.duration);
        let _ = writeln!(out, "Segments: {}", result.segments.len());
        let _ = writeln!(out, "Words: {}", result.words.len());

        if let Some(summary) = &result.metadata.summary {
            let mut shares: Vec<(&String, &f64)> =
                summary.speaker_time_percentages.iter().collect();
            shares.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (speaker, pct) in shares {
                let _ = writeln!(out, "{speaker}: {pct:.1}% of audio");
            }
            if summary.unknown_segments > 0 {
                let _ = writeln!(out, "Unknown segments: {}", summary.unknown_segments);
            }
            let primary_pct = summary
                .speaker_time_percentages
                .get(&self.primary_speaker)
                .copied()
                .unwrap_or(0.0);
            if primary_pct > 90.0 {
                let _ = writeln!(
                    out,
                    "High confidence: {primary_pct:.1}% attributed to {}",
                    self.primary_speaker
                );
            } else if primary_pct < 50.0 {
                let _ = writeln!(
                    out,
                    "Low primary attribution: only {primary_pct:.1}% of audio"
                );
            }
        }
        out
    }

    fn flush_block(&self, out: &mut String, speaker: Option<&str>, block: &[&str]) {
        if block.is_empty() {
            return;
        }
        let joined = block.join(" ");
        match speaker {
            Some(name) if name != self.unknown_label => {
                let _ = writeln!(out, "{name}: {joined}\n");
            }
            _ => {
                let _ = writeln!(out, "{joined}\n");
            }
        }
    }

    fn speaker_prefix(&self, speaker: Option<&str>) -> String {
        match speaker {
            Some(name) if name != self.unknown_label => format!("{name}: "),
            _ => String::new(),
        }
    }

    fn speaker_class(&self, speaker: Option<&str>) -> &'static str {
        match speaker {
            Some(name) if name == self.unknown_label => "unknown",
            Some(name) if name.eq_ignore_ascii_case(&self.primary_speaker) => "chaffee",
            Some(_) => "guest",
            None => "unknown",
        }
    }
}

/// `HH:MM:SS,mmm`
pub fn format_timestamp_srt(seconds: f64) -> String {
    let (h, m, s, ms) = split_timestamp(seconds);
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

/// `HH:MM:SS.mmm`
pub fn format_timestamp_vtt(seconds: f64) -> String {
    let (h, m, s, ms) = split_timestamp(seconds);
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

fn split_timestamp(seconds: f64) -> (u64, u64, u64, u64) {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    (
        total_ms / 3_600_000,
        (total_ms % 3_600_000) / 60_000,
        (total_ms % 60_000) / 1000,
        total_ms % 1000,
    )
}
