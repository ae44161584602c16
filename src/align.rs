//! Word and segment speaker alignment
//!
//! Attaches a speaker label and confidence to each ASR word from the
//! attributed diarizer timeline, then propagates a majority label to each
//! sentence-level segment. Words inside overlapping speech face a
//! tightened threshold.

use crate::asr::types::{SpeakerSegment, TranscriptionResult};
use crate::config::PipelineConfig;
use std::collections::HashMap;
use tracing::debug;

/// Tolerance when binning words into their parent segment.
const WORD_EPSILON: f64 = 0.05;

/// Align word and segment speaker labels in place.
pub fn align_words(
    result: &mut TranscriptionResult,
    speakers: &[SpeakerSegment],
    config: &PipelineConfig,
) {
    if !config.align_words {
        return;
    }

    let mut timeline: Vec<&SpeakerSegment> = speakers.iter().collect();
    timeline.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));

    for word in &mut result.words {
        // Candidates ranked by overlap duration with the word
        let mut candidates: Vec<(&SpeakerSegment, f64)> = timeline
            .iter()
            .filter(|s| word.end > s.start && word.start < s.end)
            .map(|s| {
                let overlap = word.end.min(s.end) - word.start.max(s.start);
                (*s, overlap)
            })
            .collect();

        if candidates.is_empty() {
            word.speaker = Some(config.unknown_label.clone());
            word.speaker_confidence = None;
            word.speaker_margin = None;
            word.is_overlap = false;
            continue;
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let (best, _) = candidates[0];
        let is_overlap = candidates.len() > 1;

        let mut speaker = best.speaker.clone();
        let mut confidence = best.confidence;
        let mut margin = best.margin;

        if is_overlap && speaker != config.unknown_label {
            // Overlapping speech must clear the profile threshold plus the
            // overlap bonus
            let required = config.threshold_for(&speaker) + config.overlap_bonus;
            if best.confidence < required {
                speaker = config.unknown_label.clone();
                confidence = 0.0;
                margin = 0.0;
            }
        }

        word.speaker = Some(speaker);
        word.speaker_confidence = Some(confidence);
        word.speaker_margin = Some(margin);
        word.is_overlap = is_overlap;
    }

    propagate_to_segments(result, config);
}

/// Majority vote per sentence-level segment, excluding the unknown label.
fn propagate_to_segments(result: &mut TranscriptionResult, config: &PipelineConfig) {
    for segment in &mut result.segments {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut confidence_sums: HashMap<&str, f32> = HashMap::new();

        for word in &result.words {
            if word.start < segment.start - WORD_EPSILON || word.end > segment.end + WORD_EPSILON {
                continue;
            }
            let Some(speaker) = word.speaker.as_deref() else {
                continue;
            };
            if speaker == config.unknown_label {
                continue;
            }
            *counts.entry(speaker).or_default() += 1;
            *confidence_sums.entry(speaker).or_default() +=
                word.speaker_confidence.unwrap_or(0.0);
        }

        match counts.iter().max_by_key(|(_, &count)| count) {
            Some((&majority, &count)) => {
                segment.speaker = Some(majority.to_string());
                segment.speaker_confidence = Some(confidence_sums[majority] / count as f32);
            }
            None => {
                segment.speaker = Some(config.unknown_label.clone());
                segment.speaker_confidence = Some(0.0);
            }
        }
    }

    debug!(
        "Aligned {} words across {} segments",
        result.words.len(),
        result.segments.len()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asr::types::{AsrSegment, TranscriptionMetadata, WordToken};

    fn word(text: &str, start: f64, end: f64) -> WordToken {
        WordToken {
            text: text.to_string(),
            start,
            end,
            asr_confidence: 0.9,
            speaker: None,
            speaker_confidence: None,
            speaker_margin: None,
            is_overlap: false,
        }
    }

    fn segment(start: f64, end: f64, text: &str) -> AsrSegment {
        AsrSegment {
            start,
            end,
            text: text.to_string(),
            avg_logprob: -0.1,
            compression_ratio: 1.3,
            no_speech_prob: 0.02,
            needs_refinement: false,
            was_refined: false,
            merged_into: None,
            speaker: None,
            speaker_confidence: None,
        }
    }

    fn speaker(start: f64, end: f64, name: &str, confidence: f32) -> SpeakerSegment {
        SpeakerSegment {
            start,
            end,
            speaker: name.to_string(),
            confidence,
            margin: 0.2,
            cluster_id: Some(0),
            is_overlap: false,
        }
    }

    fn result(segments: Vec<AsrSegment>, words: Vec<WordToken>) -> TranscriptionResult {
        TranscriptionResult {
            text: String::new(),
            segments,
            words,
            speakers: vec![],
            metadata: TranscriptionMetadata::new("distil-large-v3", "en", 10.0),
        }
    }

    #[test]
    fn words_inherit_the_covering_speaker() {
        let config = PipelineConfig::default();
        let mut r = result(
            vec![segment(0.0, 4.0, "hello there")],
            vec![word("hello", 0.5, 1.0), word("there", 1.2, 1.8)],
        );
        let speakers = vec![speaker(0.0, 4.0, "Chaffee", 0.8)];

        align_words(&mut r, &speakers, &config);

        for w in &r.words {
            assert_eq!(w.speaker.as_deref(), Some("Chaffee"));
            assert_eq!(w.speaker_confidence, Some(0.8));
            assert!(!w.is_overlap);
        }
        assert_eq!(r.segments[0].speaker.as_deref(), Some("Chaffee"));
        assert!((r.segments[0].speaker_confidence.unwrap() - 0.8).abs() < 1e-6);
    }

    #[test]
    fn uncovered_words_are_unknown() {
        let config = PipelineConfig::default();
        let mut r = result(
            vec![segment(0.0, 4.0, "hello")],
            vec![word("hello", 3.0, 3.5)],
        );
        let speakers = vec![speaker(0.0, 1.0, "Chaffee", 0.9)];

        align_words(&mut r, &speakers, &config);
        assert_eq!(r.words[0].speaker.as_deref(), Some("Unknown"));
        assert_eq!(r.segments[0].speaker.as_deref(), Some("Unknown"));
    }

    #[test]
    fn overlap_applies_the_tightened_threshold() {
        let config = PipelineConfig::default();
        // Two speakers overlap the word; best confidence 0.63 passes the
        // base primary threshold (0.62) but not 0.62 + 0.03.
        let mut r = result(
            vec![segment(0.0, 2.0, "contested")],
            vec![word("contested", 0.5, 1.0)],
        );
        let speakers = vec![
            speaker(0.0, 1.2, "Chaffee", 0.63),
            speaker(0.8, 2.0, "Guest", 0.5),
        ];

        align_words(&mut r, &speakers, &config);
        let w = &r.words[0];
        assert!(w.is_overlap);
        assert_eq!(w.speaker.as_deref(), Some("Unknown"));
        assert_eq!(w.speaker_confidence, Some(0.0));
    }

    #[test]
    fn overlap_with_enough_confidence_keeps_the_speaker() {
        let config = PipelineConfig::default();
        let mut r = result(
            vec![segment(0.0, 2.0, "clear")],
            vec![word("clear", 0.5, 1.0)],
        );
        // 0.70 >= 0.62 + 0.03
        let speakers = vec![
            speaker(0.0, 1.2, "Chaffee", 0.70),
            speaker(0.9, 2.0, "Guest", 0.5),
        ];

        align_words(&mut r, &speakers, &config);
        let w = &r.words[0];
        assert!(w.is_overlap);
        assert_eq!(w.speaker.as_deref(), Some("Chaffee"));
    }

    #[test]
    fn segment_majority_excludes_unknown_words() {
        let config = PipelineConfig::default();
        let mut r = result(
            vec![segment(0.0, 6.0, "mixed segment here")],
            vec![
                word("mixed", 0.0, 1.0),
                word("segment", 1.0, 2.0),
                word("here", 4.5, 5.5),
            ],
        );
        // Two words covered by the guest, one uncovered
        let speakers = vec![speaker(0.0, 2.5, "Guest", 0.9)];

        align_words(&mut r, &speakers, &config);
        assert_eq!(r.segments[0].speaker.as_deref(), Some("Guest"));
    }

    #[test]
    fn alignment_disabled_leaves_words_untouched() {
        let mut config = PipelineConfig::default();
        config.align_words = false;
        let mut r = result(vec![segment(0.0, 2.0, "off")], vec![word("off", 0.0, 1.0)]);
        let speakers = vec![speaker(0.0, 2.0, "Chaffee", 0.9)];

        align_words(&mut r, &speakers, &config);
        assert!(r.words[0].speaker.is_none());
    }
}
