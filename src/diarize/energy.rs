//! Energy-based fallback diarizer
//!
//! Frame-level RMS above a threshold defines speech; a long pause between
//! speech runs starts a new cluster id. This backend never separates
//! simultaneous speakers, it only guarantees the pipeline keeps running
//! without model weights.

use crate::audio::wave;
use crate::diarize::{normalize_turns, DiarTurn, Diarizer};
use crate::error::PipelineError;
use std::path::Path;
use tracing::{debug, info};

const FRAME_LEN: usize = 1024;
const HOP_LEN: usize = 512;

pub struct EnergyDiarizer {
    pub energy_threshold: f32,
    pub min_turn_duration: f64,
    pub pause_duration: f64,
}

impl Default for EnergyDiarizer {
    fn default() -> Self {
        Self {
            energy_threshold: 0.01,
            min_turn_duration: 1.0,
            pause_duration: 0.5,
        }
    }
}

impl EnergyDiarizer {
    fn frames_to_turns(&self, frames: &[f32]) -> Vec<DiarTurn> {
        let hop_secs = HOP_LEN as f64 / wave::SAMPLE_RATE as f64;
        let mut turns: Vec<DiarTurn> = Vec::new();
        let mut cluster_id = 0usize;
        let mut run_start: Option<usize> = None;

        for (idx, &energy) in frames.iter().enumerate() {
            let speaking = energy > self.energy_threshold;
            match (speaking, run_start) {
                (true, None) => run_start = Some(idx),
                (false, Some(start)) => {
                    self.push_run(&mut turns, &mut cluster_id, start, idx, hop_secs);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            self.push_run(&mut turns, &mut cluster_id, start, frames.len(), hop_secs);
        }
        turns
    }

    fn push_run(
        &self,
        turns: &mut Vec<DiarTurn>,
        cluster_id: &mut usize,
        start_frame: usize,
        end_frame: usize,
        hop_secs: f64,
    ) {
        let start = start_frame as f64 * hop_secs;
        let end = end_frame as f64 * hop_secs + FRAME_LEN as f64 / wave::SAMPLE_RATE as f64;
        if end - start < self.min_turn_duration {
            return;
        }
        if let Some(previous) = turns.last() {
            if start - previous.end > self.pause_duration {
                *cluster_id += 1;
            }
        }
        turns.push(DiarTurn {
            start,
            end,
            cluster_id: *cluster_id,
        });
    }
}

impl Diarizer for EnergyDiarizer {
    fn diarize(&self, audio_path: &Path) -> Result<Vec<DiarTurn>, PipelineError> {
        let samples = wave::load_mono_16k(audio_path)
            .map_err(|e| PipelineError::diarization(e.to_string()))?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }

        let frames = wave::rms_frames(&samples, FRAME_LEN, HOP_LEN);
        debug!("Energy diarizer scanned {} frames", frames.len());

        let turns = normalize_turns(self.frames_to_turns(&frames));
        let clusters = turns.iter().map(|t| t.cluster_id).max().map(|m| m + 1).unwrap_or(0);
        info!(
            "Energy diarization found {} turns in {} clusters",
            turns.len(),
            clusters
        );
        Ok(turns)
    }
}
