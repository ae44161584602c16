//! Speaker embedding extraction
//!
//! Slides a 3 s window (1.5 s stride) over peak-normalized audio and runs
//! each accepted window through an ECAPA-style ONNX model, yielding one
//! L2-unit vector per window.

use crate::audio::wave;
use crate::error::PipelineError;
use crate::voice::mel::compute_mel_features;
use crate::voice::profile::l2_normalize;
use ndarray::Axis;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Sliding-window parameters for embedding extraction.
#[derive(Debug, Clone)]
pub struct WindowParams {
    pub window_secs: f32,
    pub stride_secs: f32,

    /// Windows whose mean absolute amplitude falls below this are skipped
    /// as silence
    pub min_window_energy: f32,

    /// Stop after this many accepted windows; `None` scans the whole file
    pub max_windows: Option<usize>,
}

impl Default for WindowParams {
    fn default() -> Self {
        Self {
            window_secs: 3.0,
            stride_secs: 1.5,
            min_window_energy: 1e-4,
            max_windows: None,
        }
    }
}

impl WindowParams {
    pub fn prefix(max_windows: usize) -> Self {
        Self {
            max_windows: Some(max_windows),
            ..Self::default()
        }
    }
}

/// Capability seam for C4: anything that can turn audio into a sequence of
/// fixed-dimension unit vectors.
pub trait EmbeddingExtractor: Send + Sync {
    fn embedding_dim(&self) -> usize;

    /// Extract one embedding per accepted window of the file.
    fn extract(
        &self,
        audio_path: &Path,
        params: &WindowParams,
    ) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// ONNX-backed speaker embedder.
pub struct OnnxSpeakerEmbedder {
    session: Mutex<Session>,
    dim: usize,
    model_name: String,
}

impl std::fmt::Debug for OnnxSpeakerEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSpeakerEmbedder")
            .field("dim", &self.dim)
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl OnnxSpeakerEmbedder {
    pub fn new(model_path: &Path, dim: usize) -> Result<Self, PipelineError> {
        if !model_path.exists() {
            return Err(PipelineError::identification(format!(
                "speaker embedding model not found: {}",
                model_path.display()
            )));
        }
        info!("Loading speaker embedding model {}", model_path.display());
        let session = Session::builder()
            .map_err(|e| PipelineError::identification(format!("ONNX session builder: {e}")))?
            .commit_from_file(model_path)
            .map_err(|e| {
                PipelineError::identification(format!(
                    "failed to load embedding model {}: {e}",
                    model_path.display()
                ))
            })?;
        let model_name = model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("speaker_embedding")
            .to_string();
        Ok(Self {
            session: Mutex::new(session),
            dim,
            model_name,
        })
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Run one window of samples through the model.
    pub fn embed_window(&self, samples: &[f32]) -> Result<Vec<f32>, PipelineError> {
        let features = compute_mel_features(samples, wave::SAMPLE_RATE)
            .map_err(|e| PipelineError::identification(e.to_string()))?;
        let batch = features.insert_axis(Axis(0));

        let mut session = self
            .session
            .lock()
            .map_err(|_| PipelineError::identification("embedding session poisoned"))?;

        let input = TensorRef::from_array_view(batch.view())
            .map_err(|e| PipelineError::identification(format!("input tensor: {e}")))?;
        let outputs = session
            .run(ort::inputs![input])
            .map_err(|e| PipelineError::identification(format!("embedding inference: {e}")))?;

        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PipelineError::identification(format!("embedding output: {e}")))?;

        if data.len() < self.dim {
            return Err(PipelineError::identification(format!(
                "embedding model produced {} values, expected at least {}",
                data.len(),
                self.dim
            )));
        }
        let mut embedding = data[..self.dim].to_vec();
        l2_normalize(&mut embedding);
        Ok(embedding)
    }
}

impl EmbeddingExtractor for OnnxSpeakerEmbedder {
    fn embedding_dim(&self) -> usize {
        self.dim
    }

    fn extract(
        &self,
        audio_path: &Path,
        params: &WindowParams,
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut samples = wave::load_mono_16k(audio_path)
            .map_err(|e| PipelineError::identification(e.to_string()))?;
        if samples.is_empty() {
            return Ok(Vec::new());
        }
        wave::peak_normalize(&mut samples);

        let window_len = (params.window_secs * wave::SAMPLE_RATE as f32) as usize;
        let stride_len = (params.stride_secs * wave::SAMPLE_RATE as f32) as usize;

        // Audio shorter than one window pads up and yields exactly one
        if samples.len() < window_len {
            samples.resize(window_len, 0.0);
        }

        let mut embeddings = Vec::new();
        let mut start = 0;
        while start + window_len <= samples.len() {
            let window = &samples[start..start + window_len];
            if wave::mean_abs(window) >= params.min_window_energy {
                embeddings.push(self.embed_window(window)?);
                if let Some(cap) = params.max_windows {
                    if embeddings.len() >= cap {
                        break;
                    }
                }
            }
            start += stride_len;
        }

        debug!(
            "Extracted {} embeddings from {}",
            embeddings.len(),
            audio_path.display()
        );
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_params_defaults_match_contract() {
        let params = WindowParams::default();
        assert_eq!(params.window_secs, 3.0);
        assert_eq!(params.stride_secs, 1.5);
        assert_eq!(params.min_window_energy, 1e-4);
        assert!(params.max_windows.is_none());
    }

    #[test]
    fn prefix_params_cap_window_count() {
        let params = WindowParams::prefix(3);
        assert_eq!(params.max_windows, Some(3));
    }

    #[test]
    fn missing_model_is_an_identification_error() {
        let err = OnnxSpeakerEmbedder::new(Path::new("/nonexistent/model.onnx"), 192).unwrap_err();
        assert!(matches!(err, PipelineError::Identification { .. }));
    }
}
