//! Retrieval chunking
//!
//! Groups attributed segments into ~45 s sentence-aware chunks, cleaning
//! transcript artifacts along the way. Chunks carry a stable hash so
//! re-ingestion upserts instead of duplicating.

use crate::asr::types::AsrSegment;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// Hard slack past the target before a chunk is force-closed.
pub const CHUNK_TOLERANCE_SECS: f64 = 15.0;

/// One retrieval-sized chunk of transcript.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Chunk {
    pub chunk_index: usize,
    pub text: String,
    pub t_start: f64,
    pub t_end: f64,
    pub word_count: usize,
    pub embedding: Option<Vec<f32>>,
    pub speaker: Option<String>,

    /// Per-speaker share of chunk time when speakers are mixed
    pub speaker_fractions: Option<HashMap<String, f64>>,
}

impl Chunk {
    /// Stable content address for idempotent upserts.
    pub fn stable_hash(&self, video_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(video_id.as_bytes());
        hasher.update(self.chunk_index.to_le_bytes());
        hasher.update(self.text.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Greedily accumulate segments into chunks of roughly `target_seconds`.
///
/// A chunk closes when adding the next segment would pass the target and
/// the chunk already ends in terminal punctuation, or unconditionally once
/// the tolerance would be exceeded. Empty segments (refinement leftovers)
/// are skipped.
pub fn chunk_segments(
    segments: &[AsrSegment],
    target_seconds: f64,
    unknown_label: &str,
) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<&AsrSegment> = Vec::new();

    for segment in segments {
        if segment.text.trim().is_empty() {
            continue;
        }

        if let Some(first) = current.first() {
            let would_span = segment.end - first.start;
            if would_span > target_seconds {
                let trailing_terminal = current
                    .last()
                    .map(|s| ends_terminal(&s.text))
                    .unwrap_or(false);
                if trailing_terminal || would_span > target_seconds + CHUNK_TOLERANCE_SECS {
                    chunks.push(finalize_chunk(&current, chunks.len(), unknown_label));
                    current.clear();
                }
            }
        }
        current.push(segment);
    }
    if !current.is_empty() {
        chunks.push(finalize_chunk(&current, chunks.len(), unknown_label));
    }

    debug!("Chunked {} segments into {} chunks", segments.len(), chunks.len());
    chunks
}

fn finalize_chunk(segments: &[&AsrSegment], index: usize, unknown_label: &str) -> Chunk {
    let raw_text = segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let text = clean_text(&raw_text);
    let word_count = text.split_whitespace().count();

    // Majority speaker by accumulated duration
    let mut durations: HashMap<String, f64> = HashMap::new();
    let mut total = 0.0f64;
    for segment in segments {
        let duration = segment.end - segment.start;
        total += duration;
        let label = segment
            .speaker
            .clone()
            .unwrap_or_else(|| unknown_label.to_string());
        *durations.entry(label).or_default() += duration;
    }

    let speaker = durations
        .iter()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(name, _)| name.clone());
    let speaker_fractions = if durations.len() > 1 && total > 0.0 {
        Some(
            durations
                .iter()
                .map(|(name, duration)| (name.clone(), duration / total))
                .collect(),
        )
    } else {
        None
    };

    Chunk {
        chunk_index: index,
        text,
        t_start: segments.first().map(|s| s.start).unwrap_or(0.0),
        t_end: segments.last().map(|s| s.end).unwrap_or(0.0),
        word_count,
        embedding: None,
        speaker,
        speaker_fractions,
    }
}

fn ends_terminal(text: &str) -> bool {
    matches!(text.trim_end().chars().last(), Some('.') | Some('!') | Some('?'))
}

/// Clean transcript text: collapse whitespace, strip bracketed artifacts,
/// normalize spaces around punctuation, capitalize the leading letter.
pub fn clean_text(text: &str) -> String {
    let mut cleaned = String::with_capacity(text.len());

    // Strip [Music]-style and (inaudible)-style artifacts
    let mut depth_square = 0usize;
    let mut depth_round = 0usize;
    for ch in text.chars() {
        match ch {
            '[' => depth_square += 1,
            ']' => depth_square = depth_square.saturating_sub(1),
            '(' => depth_round += 1,
            ')' => depth_round = depth_round.saturating_sub(1),
            _ if depth_square == 0 && depth_round == 0 => cleaned.push(ch),
            _ => {}
        }
    }

    // Collapse whitespace
    let mut collapsed = String::with_capacity(cleaned.len());
    let mut last_space = true;
    for ch in cleaned.chars() {
        if ch.is_whitespace() {
            if !last_space {
                collapsed.push(' ');
                last_space = true;
            }
        } else {
            collapsed.push(ch);
            last_space = false;
        }
    }

    // No space before terminal punctuation, one space after
    let mut normalized = String::with_capacity(collapsed.len());
    let chars: Vec<char> = collapsed.trim().chars().collect();
    for (i, &ch) in chars.iter().enumerate() {
        if ch == ' ' && matches!(chars.get(i + 1), Some('.') | Some('!') | Some('?')) {
            continue;
        }
        normalized.push(ch);
        if matches!(ch, '.' | '!' | '?') {
            if let Some(&next) = chars.get(i + 1) {
                if next.is_alphanumeric() {
                    normalized.push(' ');
                }
            }
        }
    }

    // Capitalize the leading letter
    let mut result: Vec<char> = normalized.trim().chars().collect();
    if let Some(first) = result.first_mut() {
        if first.is_lowercase() {
            *first = first.to_ascii_uppercase();
        }
    }
    result.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, end: f64, text: &str, speaker: Option<&str>) -> AsrSegment {
        AsrSegment {
            start,
            end,
            text: text.to_string(),
            avg_logprob: -0.1,
            compression_ratio: 1.2,
            no_speech_prob: 0.02,
            needs_refinement: false,
            was_refined: false,
            merged_into: None,
            speaker: speaker.map(|s| s.to_string()),
            speaker_confidence: speaker.map(|_| 0.8),
        }
    }

    #[test]
    fn clean_text_strips_artifacts_and_normalizes() {
        assert_eq!(
            clean_text("  hello   [Music] world (inaudible) .  next"),
            "Hello world. Next"
        );
        assert_eq!(clean_text("already clean."), "Already clean.");
        assert_eq!(clean_text(""), "");
    }

    #[test]
    fn chunks_respect_target_and_tolerance() {
        // 10 segments of 10 s each, each ending in a period
        let segments: Vec<AsrSegment> = (0..10)
            .map(|i| {
                segment(
                    i as f64 * 10.0,
                    (i + 1) as f64 * 10.0,
                    "Ten seconds of talk.",
                    Some("Chaffee"),
                )
            })
            .collect();

        let chunks = chunk_segments(&segments, 45.0, "Unknown");
        assert!(chunks.len() >= 2);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert!(chunk.t_end - chunk.t_start <= 45.0 + CHUNK_TOLERANCE_SECS);
            assert!(chunk.word_count > 0);
        }
        // Intervals are disjoint and increasing
        for pair in chunks.windows(2) {
            assert!(pair[0].t_end <= pair[1].t_start);
        }
    }

    #[test]
    fn chunk_text_concatenates_segment_texts() {
        let segments = vec![
            segment(0.0, 20.0, "First part.", Some("Chaffee")),
            segment(20.0, 40.0, "second part.", Some("Chaffee")),
        ];
        let chunks = chunk_segments(&segments, 45.0, "Unknown");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "First part. Second part.");
        assert_eq!(chunks[0].word_count, 4);
    }

    #[test]
    fn empty_segments_are_skipped() {
        let segments = vec![
            segment(0.0, 10.0, "Kept.", Some("Chaffee")),
            segment(10.0, 20.0, "", None),
            segment(20.0, 30.0, "Also kept.", Some("Chaffee")),
        ];
        let chunks = chunk_segments(&segments, 45.0, "Unknown");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Kept. Also kept.");
    }

    #[test]
    fn mixed_chunk_records_speaker_fractions() {
        let segments = vec![
            segment(0.0, 30.0, "Primary speaking.", Some("Chaffee")),
            segment(30.0, 40.0, "Guest reply.", Some("Guest")),
        ];
        let chunks = chunk_segments(&segments, 45.0, "Unknown");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].speaker.as_deref(), Some("Chaffee"));
        let fractions = chunks[0].speaker_fractions.as_ref().unwrap();
        assert!((fractions["Chaffee"] - 0.75).abs() < 1e-9);
        assert!((fractions["Guest"] - 0.25).abs() < 1e-9);
    }

    #[test]
    fn stable_hash_is_deterministic_and_keyed() {
        let segments = vec![segment(0.0, 10.0, "Hash me.", Some("Chaffee"))];
        let chunks = chunk_segments(&segments, 45.0, "Unknown");
        let a = chunks[0].stable_hash("video1");
        let b = chunks[0].stable_hash("video1");
        let c = chunks[0].stable_hash("video2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
