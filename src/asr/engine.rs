//! Whisper ASR engine
//!
//! Wraps whisper.cpp for both the primary (fast) and refinement
//! (high-quality) passes. The engine is immutable after load; each
//! transcription creates its own inference state, so one engine serves a
//! whole worker.

use crate::asr::types::{AsrSegment, WordToken};
use crate::audio::wave;
use crate::config::{AsrConfig, AsrTask};
use crate::error::PipelineError;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Quality gates that flag a segment for refinement.
#[derive(Debug, Clone, Copy)]
pub struct QualityThresholds {
    pub avg_logprob: f32,
    pub compression_ratio: f32,
    pub no_speech_prob: f32,
}

impl QualityThresholds {
    pub fn from_config(config: &AsrConfig) -> Self {
        Self {
            avg_logprob: config.low_conf_avg_logprob,
            compression_ratio: config.low_conf_compression_ratio,
            no_speech_prob: config.low_conf_no_speech_prob,
        }
    }

    pub fn flags(&self, segment: &AsrSegment) -> bool {
        segment.avg_logprob <= self.avg_logprob
            || segment.compression_ratio >= self.compression_ratio
            || segment.no_speech_prob >= self.no_speech_prob
    }
}

/// Parameters for one transcription call.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub beam_size: usize,
    pub language: Option<String>,
    pub translate: bool,
    pub initial_prompt: Option<String>,
    pub word_timestamps: bool,
    pub vad_filter: bool,
    pub num_threads: usize,
    pub quality: QualityThresholds,
}

impl TranscribeRequest {
    pub fn primary(config: &AsrConfig) -> Self {
        Self {
            beam_size: config.beam_size,
            language: config.language.clone(),
            translate: matches!(config.task, AsrTask::Translate),
            initial_prompt: config.initial_prompt.clone(),
            word_timestamps: true,
            vad_filter: config.vad_filter,
            num_threads: config.num_threads,
            quality: QualityThresholds::from_config(config),
        }
    }

    pub fn refinement(config: &AsrConfig) -> Self {
        Self {
            beam_size: config.refinement_beam_size,
            ..Self::primary(config)
        }
    }
}

/// Raw engine output before speaker attribution.
#[derive(Debug, Clone)]
pub struct RecognizerOutput {
    pub segments: Vec<AsrSegment>,
    pub words: Vec<WordToken>,
    pub language: String,
    pub duration: f64,
}

/// Capability seam for C5/C6: both ASR roles expose the same operation.
pub trait SpeechRecognizer: Send + Sync {
    fn model_name(&self) -> &str;

    fn transcribe(
        &self,
        audio_path: &Path,
        request: &TranscribeRequest,
    ) -> Result<RecognizerOutput, PipelineError>;
}

/// whisper.cpp-backed recognizer.
pub struct WhisperEngine {
    context: WhisperContext,
    model_name: String,
}

impl std::fmt::Debug for WhisperEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WhisperEngine")
            .field("model_name", &self.model_name)
            .finish()
    }
}

impl WhisperEngine {
    pub fn new(model_path: &Path) -> Result<Self, PipelineError> {
        if !model_path.exists() {
            return Err(PipelineError::transcription(format!(
                "whisper model not found: {}",
                model_path.display()
            )));
        }
        info!("Loading whisper model {}", model_path.display());
        let path_str = model_path.to_str().ok_or_else(|| {
            PipelineError::transcription("model path is not valid UTF-8".to_string())
        })?;
        let context =
            WhisperContext::new_with_params(path_str, WhisperContextParameters::default())
                .map_err(|e| {
                    PipelineError::transcription(format!(
                        "failed to load whisper model {}: {e}",
                        model_path.display()
                    ))
                })?;
        let model_name = model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("whisper")
            .to_string();
        Ok(Self {
            context,
            model_name,
        })
    }

    fn build_params<'a>(request: &'a TranscribeRequest) -> FullParams<'a, 'a> {
        let strategy = if request.beam_size > 1 {
            SamplingStrategy::BeamSearch {
                beam_size: request.beam_size as i32,
                patience: 1.0,
            }
        } else {
            SamplingStrategy::Greedy { best_of: 1 }
        };
        let mut params = FullParams::new(strategy);
        params.set_n_threads(request.num_threads as i32);
        if let Some(lang) = request.language.as_deref() {
            params.set_language(Some(lang));
        }
        params.set_translate(request.translate);
        params.set_token_timestamps(request.word_timestamps);
        if let Some(prompt) = request.initial_prompt.as_deref() {
            params.set_initial_prompt(prompt);
        }
        // Temperature fallback schedule 0.0, 0.2, .., 1.0
        params.set_temperature(0.0);
        params.set_temperature_inc(0.2);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params
    }
}

impl SpeechRecognizer for WhisperEngine {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn transcribe(
        &self,
        audio_path: &Path,
        request: &TranscribeRequest,
    ) -> Result<RecognizerOutput, PipelineError> {
        let started = Instant::now();
        let samples = wave::load_mono_16k(audio_path)
            .map_err(|e| PipelineError::transcription(e.to_string()))?;
        let duration = samples.len() as f64 / wave::SAMPLE_RATE as f64;
        debug!(
            "Transcribing {:.2}s from {} with {}",
            duration,
            audio_path.display(),
            self.model_name
        );

        let params = Self::build_params(request);
        let mut state = self
            .context
            .create_state()
            .map_err(|e| PipelineError::transcription(format!("whisper state: {e}")))?;
        state
            .full(params, &samples)
            .map_err(|e| PipelineError::transcription(format!("whisper inference: {e}")))?;

        let language = request
            .language
            .clone()
            .or_else(|| {
                whisper_rs::get_lang_str(state.full_lang_id_from_state()).map(|s| s.to_string())
            })
            .unwrap_or_else(|| "en".to_string());

        let mut segments = Vec::new();
        let mut words = Vec::new();
        for segment in state.as_iter() {
            let start = segment.start_timestamp() as f64 / 100.0;
            let end = segment.end_timestamp() as f64 / 100.0;
            let text = segment.to_string().trim().to_string();
            let no_speech_prob = segment.no_speech_probability();

            if text.is_empty() {
                continue;
            }
            if request.vad_filter && no_speech_prob >= 0.95 {
                debug!("VAD filter dropped segment {start:.2}-{end:.2}");
                continue;
            }

            let mut logprob_sum = 0.0f32;
            let mut token_count = 0usize;
            for token_idx in 0..segment.n_tokens() {
                let Some(token) = segment.get_token(token_idx) else {
                    continue;
                };
                let token_text = token.to_string();
                let trimmed = token_text.trim();
                if trimmed.is_empty() || trimmed.starts_with("[_") || trimmed.starts_with("<|") {
                    continue;
                }
                let data = token.token_data();
                logprob_sum += data.p.max(1e-10).ln();
                token_count += 1;

                if request.word_timestamps {
                    words.push(WordToken {
                        text: trimmed.to_string(),
                        start: data.t0 as f64 / 100.0,
                        end: data.t1 as f64 / 100.0,
                        asr_confidence: data.p,
                        speaker: None,
                        speaker_confidence: None,
                        speaker_margin: None,
                        is_overlap: false,
                    });
                }
            }

            let avg_logprob = if token_count > 0 {
                logprob_sum / token_count as f32
            } else {
                0.0
            };
            let mut asr_segment = AsrSegment {
                start,
                end,
                text: text.clone(),
                avg_logprob,
                compression_ratio: compression_ratio(&text),
                no_speech_prob,
                needs_refinement: false,
                was_refined: false,
                merged_into: None,
                speaker: None,
                speaker_confidence: None,
            };
            asr_segment.needs_refinement = request.quality.flags(&asr_segment);
            segments.push(asr_segment);
        }

        info!(
            "{} produced {} segments / {} words in {:.1}s",
            self.model_name,
            segments.len(),
            words.len(),
            started.elapsed().as_secs_f32()
        );
        Ok(RecognizerOutput {
            segments,
            words,
            language,
            duration,
        })
    }
}

/// Per-worker lazy model slot guarded by a double-checked lock, so
/// concurrent first access never double-allocates model memory.
pub struct LazyWhisperEngine {
    model_path: PathBuf,
    slot: OnceLock<Arc<WhisperEngine>>,
    init_lock: Mutex<()>,
}

impl LazyWhisperEngine {
    pub fn new(model_path: PathBuf) -> Self {
        Self {
            model_path,
            slot: OnceLock::new(),
            init_lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Result<Arc<WhisperEngine>, PipelineError> {
        if let Some(engine) = self.slot.get() {
            return Ok(engine.clone());
        }
        let _guard = self
            .init_lock
            .lock()
            .map_err(|_| PipelineError::transcription("model init lock poisoned"))?;
        if let Some(engine) = self.slot.get() {
            return Ok(engine.clone());
        }
        let engine = Arc::new(WhisperEngine::new(&self.model_path)?);
        let _ = self.slot.set(engine.clone());
        Ok(engine)
    }
}

/// Ratio of text length to its deflate-compressed length; repetitive
/// hallucinated output compresses far better than real speech.
pub fn compression_ratio(text: &str) -> f32 {
    if text.is_empty() {
        return 1.0;
    }
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    if encoder.write_all(text.as_bytes()).is_err() {
        return 1.0;
    }
    match encoder.finish() {
        Ok(compressed) if !compressed.is_empty() => text.len() as f32 / compressed.len() as f32,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(avg_logprob: f32, compression_ratio: f32, no_speech_prob: f32) -> AsrSegment {
        AsrSegment {
            start: 0.0,
            end: 1.0,
            text: "test".to_string(),
            avg_logprob,
            compression_ratio,
            no_speech_prob,
            needs_refinement: false,
            was_refined: false,
            merged_into: None,
            speaker: None,
            speaker_confidence: None,
        }
    }

    #[test]
    fn quality_gates_match_refinement_rules() {
        let quality = QualityThresholds {
            avg_logprob: -0.35,
            compression_ratio: 2.4,
            no_speech_prob: 0.8,
        };

        assert!(!quality.flags(&segment(-0.1, 1.5, 0.1)));
        assert!(quality.flags(&segment(-0.35, 1.5, 0.1)));
        assert!(quality.flags(&segment(-0.1, 2.4, 0.1)));
        assert!(quality.flags(&segment(-0.1, 1.5, 0.8)));
    }

    #[test]
    fn repetitive_text_compresses_harder() {
        let repetitive = "the the the the the the the the the the the the the the";
        let varied = "quick brown foxes jump over seventeen lazy dogs at dawn";
        assert!(compression_ratio(repetitive) > compression_ratio(varied));
        assert_eq!(compression_ratio(""), 1.0);
    }

    #[test]
    fn refinement_request_raises_beam_size() {
        let config = AsrConfig::default();
        let primary = TranscribeRequest::primary(&config);
        let refinement = TranscribeRequest::refinement(&config);
        assert_eq!(primary.beam_size, 5);
        assert_eq!(refinement.beam_size, 8);
        assert_eq!(primary.language, refinement.language);
    }

    #[test]
    fn missing_model_is_a_transcription_error() {
        let err = WhisperEngine::new(Path::new("/nonexistent/model.bin")).unwrap_err();
        assert!(matches!(err, PipelineError::Transcription { .. }));
    }
}
