//! Neural diarizer
//!
//! ONNX segmentation model finds speech regions in overlapping 10 s
//! windows; each region is embedded with the speaker model and regions are
//! agglomerated into clusters by cosine similarity. Requires provisioned
//! model weights; load failure is reported so the caller can fall back to
//! the energy backend.

use crate::audio::wave;
use crate::config::NeuralDiarizerConfig;
use crate::diarize::{normalize_turns, DiarTurn, Diarizer};
use crate::error::PipelineError;
use crate::voice::embedder::OnnxSpeakerEmbedder;
use crate::voice::profile::cosine_similarity;
use ndarray::Array2;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const WINDOW_SECS: f64 = 10.0;
const STEP_SECS: f64 = 5.0;
const SPEECH_PROB_THRESHOLD: f32 = 0.5;
const MIN_REGION_SECS: f64 = 0.5;

pub struct NeuralDiarizer {
    segmentation: Mutex<Session>,
    embedder: Arc<OnnxSpeakerEmbedder>,
    cluster_similarity_threshold: f32,
}

impl NeuralDiarizer {
    /// Load the segmentation model. Missing weights produce a
    /// `Diarization` error naming the configuration knobs that provision
    /// them.
    pub fn new(
        config: &NeuralDiarizerConfig,
        embedder: Arc<OnnxSpeakerEmbedder>,
    ) -> Result<Self, PipelineError> {
        let model_path = segmentation_model_path(config)?;

        info!("Loading segmentation model {}", model_path.display());
        let segmentation = Session::builder()
            .map_err(|e| PipelineError::diarization(format!("ONNX session builder: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| {
                PipelineError::diarization(format!(
                    "failed to load segmentation model {}: {e}",
                    model_path.display()
                ))
            })?;

        Ok(Self {
            segmentation: Mutex::new(segmentation),
            embedder,
            cluster_similarity_threshold: config.cluster_similarity_threshold,
        })
    }

    /// Per-frame any-speaker activity for one audio window.
    fn window_speech_probs(&self, window: &[f32]) -> Result<Vec<f32>, PipelineError> {
        let input = Array2::from_shape_vec((1, window.len()), window.to_vec())
            .map_err(|e| PipelineError::diarization(format!("segmentation input: {e}")))?;

        let mut session = self
            .segmentation
            .lock()
            .map_err(|_| PipelineError::diarization("segmentation session poisoned"))?;
        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| PipelineError::diarization(format!("segmentation tensor: {e}")))?;
        let outputs = session
            .run(ort::inputs![tensor])
            .map_err(|e| PipelineError::diarization(format!("segmentation inference: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::diarization(format!("segmentation output: {e}")))?;

        // Output is [1, frames, channels]; a frame is speech when any
        // speaker channel is active.
        let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
        let (frames, channels) = match dims.len() {
            3 => (dims[1], dims[2]),
            2 => (dims[0], dims[1]),
            _ => (data.len(), 1),
        };
        let mut probs = Vec::with_capacity(frames);
        for frame in 0..frames {
            let row = &data[frame * channels..(frame + 1) * channels];
            probs.push(row.iter().copied().fold(f32::MIN, f32::max));
        }
        Ok(probs)
    }

    /// Contiguous speech regions over the whole file, in seconds.
    fn speech_regions(&self, samples: &[f32]) -> Result<Vec<(f64, f64)>, PipelineError> {
        let window_len = (WINDOW_SECS * wave::SAMPLE_RATE as f64) as usize;
        let step_len = (STEP_SECS * wave::SAMPLE_RATE as f64) as usize;

        let mut regions: Vec<(f64, f64)> = Vec::new();
        let mut position = 0usize;
        while position < samples.len() {
            let end = (position + window_len).min(samples.len());
            let window = &samples[position..end];
            let offset = position as f64 / wave::SAMPLE_RATE as f64;

            let probs = self.window_speech_probs(window)?;
            if !probs.is_empty() {
                let frame_secs = (window.len() as f64 / wave::SAMPLE_RATE as f64) / probs.len() as f64;
                let mut run_start: Option<usize> = None;
                for (idx, &p) in probs.iter().enumerate() {
                    let speaking = p >= SPEECH_PROB_THRESHOLD;
                    match (speaking, run_start) {
                        (true, None) => run_start = Some(idx),
                        (false, Some(start)) => {
                            regions.push((
                                offset + start as f64 * frame_secs,
                                offset + idx as f64 * frame_secs,
                            ));
                            run_start = None;
                        }
                        _ => {}
                    }
                }
                if let Some(start) = run_start {
                    regions.push((
                        offset + start as f64 * frame_secs,
                        offset + window.len() as f64 / wave::SAMPLE_RATE as f64,
                    ));
                }
            }

            if end == samples.len() {
                break;
            }
            position += step_len;
        }

        Ok(merge_regions(regions, 0.1))
    }
}

impl Diarizer for NeuralDiarizer {
    fn diarize(&self, audio_path: &Path) -> Result<Vec<DiarTurn>, PipelineError> {
        let mut samples = wave::load_mono_16k(audio_path)
            .map_err(|e| PipelineError::diarization(e.to_string()))?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        wave::peak_normalize(&mut samples);

        let regions = self.speech_regions(&samples)?;
        debug!("Segmentation found {} speech regions", regions.len());

        // Embed each region and agglomerate by cosine similarity against
        // running cluster centroids.
        let mut centroids: Vec<Vec<f32>> = Vec::new();
        let mut counts: Vec<usize> = Vec::new();
        let mut turns: Vec<DiarTurn> = Vec::new();

        for &(start, end) in &regions {
            if end - start < MIN_REGION_SECS {
                continue;
            }
            let lo = (start * wave::SAMPLE_RATE as f64) as usize;
            let hi = ((end * wave::SAMPLE_RATE as f64) as usize).min(samples.len());
            if hi <= lo {
                continue;
            }
            let embedding = match self.embedder.embed_window(&samples[lo..hi]) {
                Ok(embedding) => embedding,
                Err(e) => {
                    debug!("Skipping region {start:.2}-{end:.2}: {e}");
                    continue;
                }
            };

            let mut best: Option<(usize, f32)> = None;
            for (cluster_id, centroid) in centroids.iter().enumerate() {
                let sim = cosine_similarity(&embedding, centroid);
                if best.map(|(_, s)| sim > s).unwrap_or(true) {
                    best = Some((cluster_id, sim));
                }
            }

            let cluster_id = match best {
                Some((id, sim)) if sim >= self.cluster_similarity_threshold => {
                    // Running mean keeps the centroid stable as turns accrue
                    let n = counts[id] as f32;
                    for (acc, value) in centroids[id].iter_mut().zip(embedding.iter()) {
                        *acc = (*acc * n + value) / (n + 1.0);
                    }
                    counts[id] += 1;
                    id
                }
                _ => {
                    centroids.push(embedding);
                    counts.push(1);
                    centroids.len() - 1
                }
            };

            turns.push(DiarTurn {
                start,
                end,
                cluster_id,
            });
        }

        let turns = normalize_turns(turns);
        info!(
            "Neural diarization: {} turns across {} clusters",
            turns.len(),
            centroids.len()
        );
        Ok(turns)
    }
}

/// Resolve and verify the configured segmentation weights.
fn segmentation_model_path(
    config: &NeuralDiarizerConfig,
) -> Result<&std::path::PathBuf, PipelineError> {
    let model_path = config.segmentation_model_path.as_ref().ok_or_else(|| {
        PipelineError::diarization(
            "neural diarizer requires segmentation_model_path (and an auth token to provision the weights)",
        )
    })?;
    if !model_path.exists() {
        return Err(PipelineError::diarization(format!(
            "segmentation model not found: {}",
            model_path.display()
        )));
    }
    Ok(model_path)
}

/// Merge regions that overlap or nearly touch.
fn merge_regions(mut regions: Vec<(f64, f64)>, slack: f64) -> Vec<(f64, f64)> {
    if regions.is_empty() {
        return regions;
    }
    regions.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    let mut merged = vec![regions[0]];
    for (start, end) in regions.into_iter().skip(1) {
        let last = merged.last_mut().unwrap();
        if start <= last.1 + slack {
            last.1 = last.1.max(end);
        } else {
            merged.push((start, end));
        }
    }
    merged
}
