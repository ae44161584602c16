//! Pipeline configuration
//!
//! Every behavioral switch in the ingestion core is an explicit field here.
//! Defaults match the production tuning for a single-primary-speaker corpus.

use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Whisper task selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsrTask {
    Transcribe,
    Translate,
}

/// Diarizer backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiarizerKind {
    /// Energy-based fallback; runs anywhere, does not separate speakers
    Energy,

    /// ONNX segmentation + embedding clustering
    Neural,
}

/// ASR engine configuration shared by the primary and refinement passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsrConfig {
    /// Path to the primary (fast) whisper model
    pub primary_model_path: PathBuf,

    /// Path to the refinement (high-quality) model; `None` reuses the primary
    pub refinement_model_path: Option<PathBuf>,

    /// Enable the selective second pass over low-confidence spans
    pub enable_refinement: bool,

    /// Beam size for the primary pass
    pub beam_size: usize,

    /// Beam size for the refinement pass
    pub refinement_beam_size: usize,

    /// Audio chunk length in seconds handed to the model
    pub chunk_length: usize,

    /// Drop segments the model itself flags as non-speech
    pub vad_filter: bool,

    /// Language hint; `None` enables auto-detection
    pub language: Option<String>,

    pub task: AsrTask,

    /// Domain vocabulary injected as the initial prompt
    pub initial_prompt: Option<String>,

    /// Threads per inference call
    pub num_threads: usize,

    /// A segment needs refinement when avg_logprob falls at or below this
    pub low_conf_avg_logprob: f32,

    /// ... or when compression_ratio reaches this
    pub low_conf_compression_ratio: f32,

    /// ... or when no_speech_prob reaches this
    pub low_conf_no_speech_prob: f32,

    /// Adjacent flagged spans closer than this many seconds are merged
    /// before refinement
    pub refinement_merge_gap: f64,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            primary_model_path: PathBuf::from("models/ggml-distil-large-v3.bin"),
            refinement_model_path: Some(PathBuf::from("models/ggml-large-v3.bin")),
            enable_refinement: true,
            beam_size: 5,
            refinement_beam_size: 8,
            chunk_length: 30,
            vad_filter: true,
            language: Some("en".to_string()),
            task: AsrTask::Transcribe,
            initial_prompt: None,
            num_threads: 4,
            low_conf_avg_logprob: -0.35,
            low_conf_compression_ratio: 2.4,
            low_conf_no_speech_prob: 0.8,
            refinement_merge_gap: 2.0,
        }
    }
}

/// Neural diarizer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NeuralDiarizerConfig {
    /// ONNX segmentation model weights
    pub segmentation_model_path: Option<PathBuf>,

    /// Auth token used when the weights were provisioned; recorded so a
    /// missing-model error can say what to fix
    pub auth_token: Option<String>,

    /// Cosine similarity threshold for merging segments into one cluster
    pub cluster_similarity_threshold: f32,
}

/// Top-level configuration for the ingestion core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Profile treated as primary for fast-path and threshold selection
    pub primary_speaker_name: String,

    /// Minimum raw similarity for attributing a cluster to the primary
    pub primary_min_sim: f32,

    /// Minimum raw similarity for attributing a cluster to a guest profile
    pub guest_min_sim: f32,

    /// Required gap between best and second-best profile similarity
    pub attr_margin: f32,

    /// Extra threshold applied to words inside overlapping speech
    pub overlap_bonus: f32,

    /// Label used when no profile passes the gate
    pub unknown_label: String,

    /// Enable the monologue fast-path
    pub assume_monologue: bool,

    /// Enable word-level speaker propagation
    pub align_words: bool,

    pub enable_diarization: bool,
    pub diarizer: DiarizerKind,

    /// Clusters shorter than this many seconds are labeled unknown
    pub min_speaker_duration: f64,

    pub chunk_target_seconds: f64,

    /// Concurrent accessibility probes
    pub probe_slots: usize,

    /// Concurrent audio downloads
    pub download_slots: usize,

    /// GPU worker override; `None` sizes from VRAM and CPU cores
    pub gpu_workers: Option<usize>,

    /// Available VRAM in GB used for worker sizing
    pub vram_gb: Option<f32>,

    /// Directory holding voice profile JSON documents
    pub voices_dir: PathBuf,

    /// Keep normalized audio here after ingestion; `None` discards it
    pub audio_storage_dir: Option<PathBuf>,

    /// Production mode never persists audio
    pub production_mode: bool,

    /// Reject remote videos longer than this many seconds
    pub max_duration_seconds: Option<f64>,

    /// Speaker embedding ONNX model (ECAPA-style, unit-vector output)
    pub embedding_model_path: PathBuf,

    /// Output dimensionality of the speaker embedding model
    pub embedding_dim: usize,

    pub asr: AsrConfig,
    pub neural_diarizer: NeuralDiarizerConfig,

    /// External downloader binary
    pub downloader_bin: String,

    /// Optional proxy handed to the downloader
    pub downloader_proxy: Option<String>,

    /// Optional cookies file handed to the downloader
    pub downloader_cookies: Option<PathBuf>,

    /// Media transcoder binary
    pub transcoder_bin: String,

    /// Apply conservative silence trimming during normalization
    pub trim_silence: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            primary_speaker_name: "Chaffee".to_string(),
            primary_min_sim: 0.62,
            guest_min_sim: 0.82,
            attr_margin: 0.05,
            overlap_bonus: 0.03,
            unknown_label: "Unknown".to_string(),
            assume_monologue: true,
            align_words: true,
            enable_diarization: true,
            diarizer: DiarizerKind::Energy,
            min_speaker_duration: 3.0,
            chunk_target_seconds: 45.0,
            probe_slots: 16,
            download_slots: 8,
            gpu_workers: None,
            vram_gb: None,
            voices_dir: PathBuf::from("voices"),
            audio_storage_dir: None,
            production_mode: false,
            max_duration_seconds: None,
            embedding_model_path: PathBuf::from("models/speaker_embedding.onnx"),
            embedding_dim: 192,
            asr: AsrConfig::default(),
            neural_diarizer: NeuralDiarizerConfig {
                segmentation_model_path: None,
                auth_token: None,
                cluster_similarity_threshold: 0.7,
            },
            downloader_bin: "yt-dlp".to_string(),
            downloader_proxy: None,
            downloader_cookies: None,
            transcoder_bin: "ffmpeg".to_string(),
            trim_silence: false,
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration. Violations here are fatal to a batch.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.primary_speaker_name.trim().is_empty() {
            return Err(PipelineError::configuration(
                "primary_speaker_name must not be empty",
            ));
        }
        for (name, value) in [
            ("primary_min_sim", self.primary_min_sim),
            ("guest_min_sim", self.guest_min_sim),
            ("attr_margin", self.attr_margin),
            ("overlap_bonus", self.overlap_bonus),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(PipelineError::configuration(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.asr.beam_size == 0 || self.asr.beam_size > 20 {
            return Err(PipelineError::configuration(format!(
                "beam_size must be within 1..=20, got {}",
                self.asr.beam_size
            )));
        }
        if self.asr.refinement_beam_size == 0 || self.asr.refinement_beam_size > 20 {
            return Err(PipelineError::configuration(format!(
                "refinement_beam_size must be within 1..=20, got {}",
                self.asr.refinement_beam_size
            )));
        }
        if self.probe_slots == 0 || self.download_slots == 0 {
            return Err(PipelineError::configuration(
                "probe_slots and download_slots must be at least 1",
            ));
        }
        if self.chunk_target_seconds <= 0.0 {
            return Err(PipelineError::configuration(
                "chunk_target_seconds must be positive",
            ));
        }
        if self.unknown_label.trim().is_empty() {
            return Err(PipelineError::configuration(
                "unknown_label must not be empty",
            ));
        }
        Ok(())
    }

    /// Threshold applied when attributing a cluster to `speaker`.
    pub fn threshold_for(&self, speaker: &str) -> f32 {
        if speaker.eq_ignore_ascii_case(&self.primary_speaker_name) {
            self.primary_min_sim
        } else {
            self.guest_min_sim
        }
    }

    /// The deliberately looser monologue fast-path gate.
    pub fn fast_path_threshold(&self) -> f32 {
        (self.primary_min_sim - 0.05).max(0.55)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(PipelineConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_thresholds() {
        let mut config = PipelineConfig::default();
        config.guest_min_sim = 1.2;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.asr.beam_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn fast_path_gate_is_looser_than_attribution() {
        let config = PipelineConfig::default();
        assert!(config.fast_path_threshold() < config.primary_min_sim);
        assert!((config.fast_path_threshold() - 0.57).abs() < 1e-6);

        let mut strict = PipelineConfig::default();
        strict.primary_min_sim = 0.5;
        // Floor kicks in below 0.60
        assert!((strict.fast_path_threshold() - 0.55).abs() < 1e-6);
    }

    #[test]
    fn threshold_selection_is_case_insensitive() {
        let config = PipelineConfig::default();
        assert_eq!(config.threshold_for("chaffee"), config.primary_min_sim);
        assert_eq!(config.threshold_for("CHAFFEE"), config.primary_min_sim);
        assert_eq!(config.threshold_for("Guest"), config.guest_min_sim);
    }
}
