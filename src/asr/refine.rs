//! Selective refinement pass
//!
//! Re-transcribes low-confidence spans with the high-quality model.
//! Adjacent flagged spans are merged to cut snippet-extraction overhead;
//! refined text replaces the first original segment of each merged span
//! and the remaining span members are emptied.

use crate::asr::engine::{SpeechRecognizer, TranscribeRequest};
use crate::asr::types::TranscriptionResult;
use crate::audio::Transcoder;
use crate::error::PipelineError;
use std::path::Path;
use tracing::{debug, info, warn};

/// Outcome counters for one refinement run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefinementStats {
    pub flagged_segments: usize,
    pub merged_spans: usize,
    pub refined_segments: usize,
}

/// Merge flagged spans whose gaps are at most `gap` seconds.
///
/// Input tuples are `(start, end, segment_index)`; output spans carry every
/// member index in order.
pub fn merge_adjacent_spans(
    mut spans: Vec<(f64, f64, usize)>,
    gap: f64,
) -> Vec<(f64, f64, Vec<usize>)> {
    if spans.is_empty() {
        return Vec::new();
    }
    spans.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut merged: Vec<(f64, f64, Vec<usize>)> = Vec::new();
    let (mut start, mut end, first_idx) = spans[0];
    let mut indices = vec![first_idx];

    for &(s, e, idx) in &spans[1..] {
        if s <= end + gap {
            end = end.max(e);
            indices.push(idx);
        } else {
            merged.push((start, end, std::mem::take(&mut indices)));
            start = s;
            end = e;
            indices.push(idx);
        }
    }
    merged.push((start, end, indices));
    merged
}

/// Run the refinement pass over every flagged span of `result`.
///
/// Snippets are extracted into `scratch` at the pipeline sample rate and
/// removed after each span. A span whose re-transcription fails keeps its
/// original text.
pub async fn refine(
    audio_path: &Path,
    result: &mut TranscriptionResult,
    recognizer: &dyn SpeechRecognizer,
    request: &TranscribeRequest,
    transcoder: &Transcoder,
    merge_gap: f64,
    scratch: &Path,
) -> Result<RefinementStats, PipelineError> {
    let spans = result.low_confidence_spans();
    let mut stats = RefinementStats {
        flagged_segments: spans.len(),
        ..Default::default()
    };
    if spans.is_empty() {
        debug!("No low-confidence segments, skipping refinement");
        return Ok(stats);
    }

    let merged = merge_adjacent_spans(spans, merge_gap);
    stats.merged_spans = merged.len();
    info!(
        "Refining {} low-confidence segments in {} merged spans with {}",
        stats.flagged_segments,
        stats.merged_spans,
        recognizer.model_name()
    );

    for (span_idx, (start, end, indices)) in merged.into_iter().enumerate() {
        let snippet = scratch.join(format!("refine_{span_idx}.wav"));
        let extraction = transcoder
            .extract_span(audio_path, &snippet, start, end - start)
            .await;
        if let Err(e) = extraction {
            warn!("Failed to extract span {start:.1}-{end:.1}: {e}");
            continue;
        }

        let refined = match recognizer.transcribe(&snippet, request) {
            Ok(output) => output,
            Err(e) => {
                warn!("Refinement failed for span {start:.1}-{end:.1}: {e}");
                let _ = std::fs::remove_file(&snippet);
                continue;
            }
        };
        let _ = std::fs::remove_file(&snippet);

        if refined.segments.is_empty() {
            continue;
        }

        // The span head keeps its original timeline; only text and the
        // quality metrics come from the refined pass
        let combined_text = refined
            .segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let best_logprob = refined
            .segments
            .iter()
            .map(|s| s.avg_logprob)
            .fold(f32::NEG_INFINITY, f32::max);
        let best_compression = refined
            .segments
            .iter()
            .map(|s| s.compression_ratio)
            .fold(f32::INFINITY, f32::min);

        let head = indices[0];
        {
            let segment = &mut result.segments[head];
            segment.text = combined_text;
            segment.avg_logprob = best_logprob;
            segment.compression_ratio = best_compression;
            segment.needs_refinement = false;
            segment.was_refined = true;
        }
        for &idx in &indices[1..] {
            let segment = &mut result.segments[idx];
            segment.text.clear();
            segment.needs_refinement = false;
            segment.was_refined = true;
            segment.merged_into = Some(head);
        }
        stats.refined_segments += indices.len();
    }

    result.metadata.refined_segments = stats.refined_segments;
    result.metadata.refinement_model = Some(recognizer.model_name().to_string());
    result.text = result
        .segments
        .iter()
        .map(|s| s.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    info!(
        "Refinement replaced {}/{} segments",
        stats.refined_segments,
        result.segments.len()
    );
    Ok(stats)
}
