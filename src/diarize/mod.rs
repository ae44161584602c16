//! Speaker diarization
//!
//! Partitions audio into `(start, end, cluster_id)` turns. Two backends:
//! an energy-based fallback that runs anywhere, and a neural ONNX pipeline
//! that actually separates voices. The neural backend degrades to the
//! energy one when its weights cannot be loaded.

pub mod energy;
pub mod neural;

pub use energy::EnergyDiarizer;
pub use neural::NeuralDiarizer;

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One diarizer turn. Turns for a file are sorted by start and cluster ids
/// are dense from zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiarTurn {
    pub start: f64,
    pub end: f64,
    pub cluster_id: usize,
}

impl DiarTurn {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Capability set for C7.
pub trait Diarizer: Send + Sync {
    fn diarize(&self, audio_path: &Path) -> Result<Vec<DiarTurn>, PipelineError>;
}

/// Sort turns and remap cluster ids to be dense from zero in order of
/// first appearance.
pub fn normalize_turns(mut turns: Vec<DiarTurn>) -> Vec<DiarTurn> {
    turns.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
    let mut remap: Vec<usize> = Vec::new();
    for turn in &mut turns {
        let dense = match remap.iter().position(|&id| id == turn.cluster_id) {
            Some(pos) => pos,
            None => {
                remap.push(turn.cluster_id);
                remap.len() - 1
            }
        };
        turn.cluster_id = dense;
    }
    turns
}
