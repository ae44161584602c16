//! Per-video processing task
//!
//! Owns one video end to end: acquisition, fast-path or full
//! transcription/attribution, chunking, embedding, and the idempotent
//! upsert. All scratch files live in a task-scoped temp directory;
//! cancellation is observed at stage boundaries.

use crate::align::align_words;
use crate::asr::engine::{RecognizerOutput, SpeechRecognizer, TranscribeRequest};
use crate::asr::refine::refine;
use crate::asr::types::{
    SpeakerSegment, TranscriptionMetadata, TranscriptionMethod, TranscriptionResult,
};
use crate::audio::{AudioAcquirer, AudioArtifact, Transcoder};
use crate::cancel::CancelToken;
use crate::chunker::chunk_segments;
use crate::config::PipelineConfig;
use crate::diarize::Diarizer;
use crate::embed::TextEmbedder;
use crate::error::PipelineError;
use crate::identify::SpeakerIdentifier;
use crate::listing::VideoDescriptor;
use crate::monologue::MonologueGate;
use crate::pipeline::state::{IngestState, IngestStatus, VideoReport, MAX_RETRIES};
use crate::storage::adapter::{PersistenceAdapter, StatusUpdate};
use crate::voice::embedder::EmbeddingExtractor;
use crate::voice::profile::VoiceProfile;
use crate::voice::store::VoiceProfileStore;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task;
use tracing::{info, warn};

/// Hands out the worker's ASR engines, loading lazily on first use.
pub trait RecognizerProvider: Send + Sync {
    fn primary(&self) -> Result<Arc<dyn SpeechRecognizer>, PipelineError>;
    fn refinement(&self) -> Result<Arc<dyn SpeechRecognizer>, PipelineError>;
}

/// Whisper-backed provider; the refinement slot falls back to the primary
/// model when no separate path is configured.
pub struct WhisperProvider {
    primary: crate::asr::engine::LazyWhisperEngine,
    refinement: Option<crate::asr::engine::LazyWhisperEngine>,
}

impl WhisperProvider {
    pub fn new(config: &PipelineConfig) -> Self {
        let refinement = config
            .asr
            .refinement_model_path
            .as_ref()
            .filter(|path| path.as_path() != config.asr.primary_model_path.as_path())
            .map(|path| crate::asr::engine::LazyWhisperEngine::new(path.clone()));
        Self {
            primary: crate::asr::engine::LazyWhisperEngine::new(
                config.asr.primary_model_path.clone(),
            ),
            refinement,
        }
    }
}

impl RecognizerProvider for WhisperProvider {
    fn primary(&self) -> Result<Arc<dyn SpeechRecognizer>, PipelineError> {
        let engine: Arc<dyn SpeechRecognizer> = self.primary.get()?;
        Ok(engine)
    }

    fn refinement(&self) -> Result<Arc<dyn SpeechRecognizer>, PipelineError> {
        match &self.refinement {
            Some(lazy) => {
                let engine: Arc<dyn SpeechRecognizer> = lazy.get()?;
                Ok(engine)
            }
            None => self.primary(),
        }
    }
}

/// Everything one worker needs to process videos. Models are owned by the
/// context and never shared across workers.
pub struct WorkerContext {
    pub config: Arc<PipelineConfig>,
    pub store: Arc<dyn PersistenceAdapter>,
    pub recognizers: Arc<dyn RecognizerProvider>,
    pub voice_extractor: Arc<dyn EmbeddingExtractor>,
    pub text_embedder: Arc<dyn TextEmbedder>,
    pub diarizer: Arc<dyn Diarizer>,

    /// True when the neural diarizer could not load and the energy
    /// backend stands in
    pub diarizer_is_fallback: bool,

    pub profile_store: Arc<VoiceProfileStore>,
    pub profiles: Vec<Arc<VoiceProfile>>,
    pub transcoder: Transcoder,
    pub gpu_slots: Arc<Semaphore>,
    pub cancel: CancelToken,
}

impl WorkerContext {
    fn primary_profile(&self) -> Option<&Arc<VoiceProfile>> {
        self.profiles
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(&self.config.primary_speaker_name))
    }
}

/// Outcome of one video task, with attribution time for the batch summary.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub report: VideoReport,
    pub speaker_seconds: HashMap<String, f64>,
}

/// Process one video end to end. Never panics the worker: every failure
/// lands in ingest state and the report.
pub async fn process_video(
    ctx: &WorkerContext,
    acquirer: &AudioAcquirer,
    descriptor: &VideoDescriptor,
    preacquired: Option<AudioArtifact>,
) -> ProcessOutcome {
    let started = Instant::now();
    let video_id = descriptor.video_id.clone();

    // Re-entry rules first
    match ctx.store.get_ingest_state(&video_id).await {
        Ok(Some(state)) if state.should_skip() => {
            info!("Skipping {video_id}: already {}", state.status.as_str());
            return ProcessOutcome {
                report: VideoReport::skipped(
                    video_id,
                    format!("already {}", state.status.as_str()),
                ),
                speaker_seconds: HashMap::new(),
            };
        }
        Ok(Some(_)) => {}
        Ok(None) => {
            if let Err(e) = ctx
                .store
                .upsert_ingest_state(&IngestState::new(&video_id))
                .await
            {
                return failure_outcome(&video_id, started, e);
            }
        }
        Err(e) => return failure_outcome(&video_id, started, e),
    }

    match run_stages(ctx, acquirer, descriptor, preacquired).await {
        Ok((result, chunk_count)) => {
            let speaker_seconds = result
                .speakers
                .iter()
                .map(|s| (s.speaker.clone(), s.end - s.start))
                .fold(HashMap::new(), |mut acc, (speaker, secs)| {
                    *acc.entry(speaker).or_insert(0.0) += secs;
                    acc
                });
            ProcessOutcome {
                report: VideoReport {
                    video_id,
                    success: true,
                    skipped: false,
                    method: Some(result.metadata.method.as_str().to_string()),
                    chunks: chunk_count,
                    processing_time: started.elapsed().as_secs_f64(),
                    error: None,
                },
                speaker_seconds,
            }
        }
        Err(PipelineError::Cancelled) => {
            // Scoped scratch is already gone; ingest state is untouched
            info!("Cancelled while processing {video_id}");
            ProcessOutcome {
                report: VideoReport {
                    video_id,
                    success: false,
                    skipped: false,
                    method: None,
                    chunks: 0,
                    processing_time: started.elapsed().as_secs_f64(),
                    error: Some("cancelled".to_string()),
                },
                speaker_seconds: HashMap::new(),
            }
        }
        Err(e) => {
            warn!("Processing {video_id} failed: {e}");
            let retry_count = match ctx.store.get_ingest_state(&video_id).await {
                Ok(Some(state)) => state.retry_count + 1,
                _ => 1,
            };
            let status = if retry_count >= MAX_RETRIES {
                IngestStatus::Skipped
            } else {
                IngestStatus::Error
            };
            let _ = ctx
                .store
                .update_ingest_status(
                    &video_id,
                    status,
                    StatusUpdate {
                        last_error: Some(e.to_string()),
                        increment_retry: true,
                        ..Default::default()
                    },
                )
                .await;
            failure_outcome(&video_id, started, e)
        }
    }
}

fn failure_outcome(video_id: &str, started: Instant, error: PipelineError) -> ProcessOutcome {
    ProcessOutcome {
        report: VideoReport {
            video_id: video_id.to_string(),
            success: false,
            skipped: false,
            method: None,
            chunks: 0,
            processing_time: started.elapsed().as_secs_f64(),
            error: Some(error.to_string()),
        },
        speaker_seconds: HashMap::new(),
    }
}

/// The ordered pipeline stages for one video.
async fn run_stages(
    ctx: &WorkerContext,
    acquirer: &AudioAcquirer,
    descriptor: &VideoDescriptor,
    preacquired: Option<AudioArtifact>,
) -> Result<(TranscriptionResult, usize), PipelineError> {
    let video_id = &descriptor.video_id;
    let scratch = tempfile::tempdir()
        .map_err(|e| PipelineError::transcription(format!("cannot create scratch dir: {e}")))?;

    ctx.cancel.check()?;
    let artifact = match preacquired {
        Some(artifact) => artifact,
        None => acquirer.acquire(descriptor, scratch.path()).await?,
    };

    ctx.cancel.check()?;
    let mut result = {
        let _permit = ctx
            .gpu_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Cancelled)?;
        transcribe_and_attribute(ctx, &artifact.path, scratch.path()).await?
    };
    result.metadata.diarization_fallback = ctx.diarizer_is_fallback;
    result.add_summary_stats(&ctx.config.unknown_label);

    ctx.store
        .update_ingest_status(
            video_id,
            IngestStatus::Transcribed,
            StatusUpdate {
                has_whisper: Some(true),
                enhanced_asr_used: Some(result.metadata.refined_segments > 0),
                monologue_fast_path: Some(result.metadata.monologue_fast_path),
                diarization_failed: Some(result.metadata.diarization_failed),
                ..Default::default()
            },
        )
        .await?;

    // Chunk
    ctx.cancel.check()?;
    let mut chunks = chunk_segments(
        &result.segments,
        ctx.config.chunk_target_seconds,
        &ctx.config.unknown_label,
    );
    if chunks.is_empty() {
        return Err(PipelineError::chunking(format!(
            "no usable transcript text for {video_id}"
        )));
    }
    ctx.store
        .update_ingest_status(
            video_id,
            IngestStatus::Chunked,
            StatusUpdate {
                chunk_count: Some(chunks.len()),
                ..Default::default()
            },
        )
        .await?;

    // Embed
    ctx.cancel.check()?;
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = ctx.text_embedder.embed(&texts)?;
    if vectors.len() != chunks.len() {
        return Err(PipelineError::embedding(format!(
            "embedder returned {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        )));
    }
    for (chunk, vector) in chunks.iter_mut().zip(vectors) {
        chunk.embedding = Some(vector);
    }
    ctx.store
        .update_ingest_status(
            video_id,
            IngestStatus::Embedded,
            StatusUpdate {
                embedding_count: Some(chunks.len()),
                ..Default::default()
            },
        )
        .await?;

    // Upsert
    ctx.cancel.check()?;
    let source_id = ctx.store.upsert_source(descriptor).await?;
    let written = ctx.store.upsert_chunks(source_id, video_id, &chunks).await?;
    ctx.store
        .update_ingest_status(video_id, IngestStatus::Upserted, StatusUpdate::default())
        .await?;
    ctx.store
        .update_ingest_status(video_id, IngestStatus::Done, StatusUpdate::default())
        .await?;

    info!(
        "Completed {video_id}: {written} chunks via {}",
        result.metadata.method.as_str()
    );
    drop(artifact);
    Ok((result, written))
}

/// Fast-path gate, then either label-everything-primary or the full
/// diarize/identify/align pipeline.
async fn transcribe_and_attribute(
    ctx: &WorkerContext,
    audio_path: &Path,
    scratch: &Path,
) -> Result<TranscriptionResult, PipelineError> {
    if ctx.config.assume_monologue {
        if let Some(primary) = ctx.primary_profile() {
            let gate = MonologueGate::new(
                &ctx.config,
                &ctx.profile_store,
                ctx.voice_extractor.as_ref(),
            );
            if let Some(similarity) = gate.check(audio_path, primary)? {
                let mut result = transcribe_two_stage(ctx, audio_path, scratch).await?;
                result.label_all(&primary.name, similarity);
                result.speakers = result
                    .segments
                    .iter()
                    .map(|s| SpeakerSegment {
                        start: s.start,
                        end: s.end,
                        speaker: primary.name.clone(),
                        confidence: similarity,
                        margin: similarity,
                        cluster_id: None,
                        is_overlap: false,
                    })
                    .collect();
                result.metadata.method = TranscriptionMethod::MonologueFastPath;
                result.metadata.monologue_fast_path = true;
                result.metadata.primary_similarity = Some(similarity);
                result.metadata.identified_speakers = 1;
                return Ok(result);
            }
        } else {
            warn!(
                "Primary profile '{}' not enrolled; fast-path unavailable",
                ctx.config.primary_speaker_name
            );
        }
    }

    let mut result = transcribe_two_stage(ctx, audio_path, scratch).await?;

    if !ctx.config.enable_diarization {
        result.label_all(&ctx.config.unknown_label, 0.0);
        return Ok(result);
    }

    ctx.cancel.check()?;
    match ctx.diarizer.diarize(audio_path) {
        Ok(turns) if !turns.is_empty() => {
            result.metadata.diarization_turns = turns.len();
            let identifier = SpeakerIdentifier::new(
                &ctx.config,
                &ctx.profile_store,
                ctx.voice_extractor.as_ref(),
            );
            let speakers =
                identifier.identify(audio_path, &turns, &ctx.profiles, scratch)?;
            if speakers.is_empty() {
                result.label_all(&ctx.config.unknown_label, 0.0);
            } else {
                align_words(&mut result, &speakers, &ctx.config);
                result.metadata.identified_speakers = speakers
                    .iter()
                    .map(|s| s.speaker.as_str())
                    .collect::<std::collections::HashSet<_>>()
                    .len();
                result.speakers = speakers;
            }
        }
        Ok(_) => {
            warn!("Diarizer produced no turns; labeling everything unknown");
            result.label_all(&ctx.config.unknown_label, 0.0);
            result.metadata.diarization_failed = true;
        }
        Err(e) => {
            // Degrade instead of failing the video
            warn!("Diarization failed ({e}); labeling everything unknown");
            result.label_all(&ctx.config.unknown_label, 0.0);
            result.metadata.diarization_failed = true;
        }
    }
    Ok(result)
}

/// C5 primary pass plus the selective C6 refinement pass.
async fn transcribe_two_stage(
    ctx: &WorkerContext,
    audio_path: &Path,
    scratch: &Path,
) -> Result<TranscriptionResult, PipelineError> {
    let primary = ctx.recognizers.primary()?;
    let request = TranscribeRequest::primary(&ctx.config.asr);

    let output: RecognizerOutput = {
        let primary = primary.clone();
        let path = audio_path.to_path_buf();
        let request = request.clone();
        task::spawn_blocking(move || primary.transcribe(&path, &request))
            .await
            .map_err(|e| PipelineError::transcription(format!("join error: {e}")))??
    };

    let text = output
        .segments
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let flagged = output.segments.iter().filter(|s| s.needs_refinement).count();

    let mut metadata = TranscriptionMetadata::new(
        primary.model_name().to_string(),
        output.language.clone(),
        output.duration,
    );
    metadata.low_quality_segments = flagged;

    let mut result = TranscriptionResult {
        text,
        segments: output.segments,
        words: output.words,
        speakers: Vec::new(),
        metadata,
    };

    if ctx.config.asr.enable_refinement && flagged > 0 {
        ctx.cancel.check()?;
        let refiner = ctx.recognizers.refinement()?;
        refine(
            audio_path,
            &mut result,
            refiner.as_ref(),
            &TranscribeRequest::refinement(&ctx.config.asr),
            &ctx.transcoder,
            ctx.config.asr.refinement_merge_gap,
            scratch,
        )
        .await?;
    }

    Ok(result)
}
