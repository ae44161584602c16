//! Ingestion orchestrator
//!
//! Runs a batch of videos through the pipeline. Small batches run one
//! concurrent task per video; large batches run three sequential phases
//! (accessibility pre-filter, bulk download, GPU fan-out) so no GPU time
//! is spent on unfetchable or undownloaded items.

use crate::audio::{AccessibilityProbe, AudioAcquirer, AudioArtifact, ProbeOutcome, Transcoder};
use crate::cancel::CancelToken;
use crate::config::{DiarizerKind, PipelineConfig};
use crate::diarize::{Diarizer, EnergyDiarizer, NeuralDiarizer};
use crate::embed::TextEmbedder;
use crate::error::PipelineError;
use crate::listing::VideoDescriptor;
use crate::pipeline::state::{IngestStatus, IngestionSummary, VideoReport};
use crate::pipeline::worker::{
    process_video, ProcessOutcome, RecognizerProvider, WhisperProvider, WorkerContext,
};
use crate::storage::adapter::{PersistenceAdapter, StatusUpdate};
use crate::voice::embedder::{EmbeddingExtractor, OnnxSpeakerEmbedder};
use crate::voice::store::VoiceProfileStore;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

/// Batches above this size run the three-phase pipeline.
const PHASED_THRESHOLD: usize = 25;

/// Remote batches above this size are pre-filtered for accessibility.
const PROBE_THRESHOLD: usize = 15;

/// Per-worker GPU budget with both ASR tiers plus the diarizer loaded.
const PER_WORKER_GB_ENHANCED: f32 = 3.5;

/// Per-worker GPU budget for a fast-only configuration.
const PER_WORKER_GB_FAST: f32 = 2.5;

/// Builds one worker's model set. Called once per GPU worker; models are
/// never shared across workers.
pub trait ComponentFactory: Send + Sync {
    fn build(&self) -> Result<WorkerComponents, PipelineError>;
}

pub struct WorkerComponents {
    pub recognizers: Arc<dyn RecognizerProvider>,
    pub voice_extractor: Arc<dyn EmbeddingExtractor>,
    pub diarizer: Arc<dyn Diarizer>,
    pub diarizer_is_fallback: bool,
}

/// Production factory: whisper engines, the ONNX speaker embedder, and the
/// configured diarizer with automatic energy fallback.
pub struct DefaultComponentFactory {
    config: Arc<PipelineConfig>,
}

impl DefaultComponentFactory {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }
}

impl ComponentFactory for DefaultComponentFactory {
    fn build(&self) -> Result<WorkerComponents, PipelineError> {
        let recognizers: Arc<dyn RecognizerProvider> =
            Arc::new(WhisperProvider::new(&self.config));
        let embedder = Arc::new(OnnxSpeakerEmbedder::new(
            &self.config.embedding_model_path,
            self.config.embedding_dim,
        )?);

        let (diarizer, diarizer_is_fallback): (Arc<dyn Diarizer>, bool) =
            match self.config.diarizer {
                DiarizerKind::Energy => (Arc::new(EnergyDiarizer::default()), false),
                DiarizerKind::Neural => {
                    match NeuralDiarizer::new(&self.config.neural_diarizer, embedder.clone()) {
                        Ok(neural) => (Arc::new(neural), false),
                        Err(e) => {
                            warn!("Neural diarizer unavailable ({e}); using energy fallback");
                            (Arc::new(EnergyDiarizer::default()), true)
                        }
                    }
                }
            };

        Ok(WorkerComponents {
            recognizers,
            voice_extractor: embedder,
            diarizer,
            diarizer_is_fallback,
        })
    }
}

/// Size the GPU worker pool from available VRAM and CPU cores.
pub fn compute_worker_count(vram_gb: Option<f32>, cpu_cores: usize, full_enhanced: bool) -> usize {
    let per_worker_gb = if full_enhanced {
        PER_WORKER_GB_ENHANCED
    } else {
        PER_WORKER_GB_FAST
    };
    let hard_cap = if full_enhanced { 4 } else { 8 };
    let by_vram = vram_gb
        .map(|vram| ((vram * 0.85) / per_worker_gb).floor() as usize)
        .unwrap_or(hard_cap);
    by_vram.min(cpu_cores.max(1)).min(hard_cap).max(1)
}

/// The batch orchestrator (C12).
pub struct IngestionPipeline {
    config: Arc<PipelineConfig>,
    store: Arc<dyn PersistenceAdapter>,
    text_embedder: Arc<dyn TextEmbedder>,
    factory: Arc<dyn ComponentFactory>,
    profile_store: Arc<VoiceProfileStore>,
    cancel: CancelToken,
}

impl IngestionPipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn PersistenceAdapter>,
        text_embedder: Arc<dyn TextEmbedder>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let config = Arc::new(config);
        let profile_store = Arc::new(VoiceProfileStore::new(&config.voices_dir));
        Ok(Self {
            factory: Arc::new(DefaultComponentFactory::new(config.clone())),
            profile_store,
            config,
            store,
            text_embedder,
            cancel: CancelToken::new(),
        })
    }

    /// Swap the model factory; tests and bespoke deployments use this.
    pub fn with_factory(mut self, factory: Arc<dyn ComponentFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Process a batch and return the aggregate summary.
    pub async fn run(
        &self,
        videos: Vec<VideoDescriptor>,
    ) -> Result<IngestionSummary, PipelineError> {
        if videos.is_empty() {
            return Ok(IngestionSummary::default());
        }
        info!(
            "Ingesting {} videos ({} mode)",
            videos.len(),
            if videos.len() > PHASED_THRESHOLD {
                "phased"
            } else {
                "concurrent"
            }
        );

        let outcomes = if videos.len() > PHASED_THRESHOLD {
            self.run_phased(videos).await?
        } else {
            self.run_concurrent(videos).await?
        };

        let mut speaker_seconds: HashMap<String, f64> = HashMap::new();
        let mut reports = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            for (speaker, secs) in outcome.speaker_seconds {
                *speaker_seconds.entry(speaker).or_insert(0.0) += secs;
            }
            reports.push(outcome.report);
        }

        let summary = IngestionSummary::from_reports(reports, speaker_seconds);
        info!(
            "Batch complete: {}/{} succeeded ({:.1}%), {} chunks",
            summary.succeeded,
            summary.total,
            summary.success_rate(),
            summary.total_chunks
        );
        Ok(summary)
    }

    fn worker_count(&self) -> usize {
        if let Some(count) = self.config.gpu_workers {
            return count.max(1);
        }
        let mut sys = sysinfo::System::new_all();
        sys.refresh_all();
        let cores = sys
            .physical_core_count()
            .unwrap_or_else(|| sys.cpus().len().max(1));
        compute_worker_count(self.config.vram_gb, cores, self.config.asr.enable_refinement)
    }

    fn build_context(
        &self,
        components: WorkerComponents,
        gpu_slots: Arc<Semaphore>,
    ) -> Arc<WorkerContext> {
        let profiles = self.profile_store.load_all();
        if profiles.is_empty() {
            warn!(
                "No voice profiles under {}; attribution will be unknown-only",
                self.profile_store.voices_dir().display()
            );
        }
        Arc::new(WorkerContext {
            config: self.config.clone(),
            store: self.store.clone(),
            recognizers: components.recognizers,
            voice_extractor: components.voice_extractor,
            text_embedder: self.text_embedder.clone(),
            diarizer: components.diarizer,
            diarizer_is_fallback: components.diarizer_is_fallback,
            profile_store: self.profile_store.clone(),
            profiles,
            transcoder: Transcoder::new(self.config.transcoder_bin.clone()),
            gpu_slots,
            cancel: self.cancel.clone(),
        })
    }

    /// One task per video; every stage overlaps across videos under the
    /// three semaphores.
    async fn run_concurrent(
        &self,
        videos: Vec<VideoDescriptor>,
    ) -> Result<Vec<ProcessOutcome>, PipelineError> {
        let worker_count = self.worker_count();
        let gpu_slots = Arc::new(Semaphore::new(worker_count));
        let probe_slots = Arc::new(Semaphore::new(self.config.probe_slots));
        let download_slots = Arc::new(Semaphore::new(self.config.download_slots));

        let ctx = self.build_context(self.factory.build()?, gpu_slots);
        let acquirer = Arc::new(AudioAcquirer::new(self.config.clone(), download_slots));
        let probe = Arc::new(AccessibilityProbe::new(self.config.clone(), probe_slots));
        let should_probe =
            videos.iter().filter(|v| v.is_remote()).count() > PROBE_THRESHOLD;

        let mut handles = Vec::with_capacity(videos.len());
        for video in videos {
            let ctx = ctx.clone();
            let acquirer = acquirer.clone();
            let probe = probe.clone();
            handles.push(tokio::spawn(async move {
                if should_probe && video.is_remote() {
                    let outcome = probe.probe(&video).await;
                    if !outcome.is_accessible() {
                        return skip_inaccessible(&ctx, &video, outcome).await;
                    }
                }
                process_video(&ctx, &acquirer, &video, None).await
            }));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Video task panicked: {e}"),
            }
        }
        Ok(outcomes)
    }

    /// Three sequential phases: probe, download, GPU fan-out.
    async fn run_phased(
        &self,
        videos: Vec<VideoDescriptor>,
    ) -> Result<Vec<ProcessOutcome>, PipelineError> {
        let probe_slots = Arc::new(Semaphore::new(self.config.probe_slots));
        let download_slots = Arc::new(Semaphore::new(self.config.download_slots));
        let probe = Arc::new(AccessibilityProbe::new(self.config.clone(), probe_slots));
        let acquirer = Arc::new(AudioAcquirer::new(self.config.clone(), download_slots));

        // Phase 1: accessibility pre-filter
        self.cancel.check()?;
        let total = videos.len();
        let mut outcomes: Vec<ProcessOutcome> = Vec::new();
        let mut accessible: Vec<VideoDescriptor> = Vec::new();
        {
            let mut handles = Vec::with_capacity(videos.len());
            for video in videos {
                let probe = probe.clone();
                handles.push(tokio::spawn(async move {
                    let outcome = probe.probe(&video).await;
                    (video, outcome)
                }));
            }
            for handle in handles {
                let (video, outcome) = handle
                    .await
                    .map_err(|e| PipelineError::configuration(format!("probe task died: {e}")))?;
                if outcome.is_accessible() {
                    accessible.push(video);
                } else {
                    outcomes.push(skip_report(&self.store, &video, outcome).await);
                }
            }
        }
        info!(
            "Phase 1 complete: {}/{} accessible",
            accessible.len(),
            total
        );
        if accessible.is_empty() {
            return Ok(outcomes);
        }

        // Phase 2: bulk download
        self.cancel.check()?;
        let mut downloaded: Vec<(VideoDescriptor, TempDir, AudioArtifact)> = Vec::new();
        {
            let mut handles = Vec::with_capacity(accessible.len());
            for video in accessible.drain(..) {
                let acquirer = acquirer.clone();
                handles.push(tokio::spawn(async move {
                    let scratch = match tempfile::tempdir() {
                        Ok(scratch) => scratch,
                        Err(e) => {
                            return (
                                video,
                                Err(PipelineError::transcription(format!(
                                    "cannot create scratch dir: {e}"
                                ))),
                            )
                        }
                    };
                    let result = acquirer.acquire(&video, scratch.path()).await;
                    (video, result.map(|artifact| (scratch, artifact)))
                }));
            }
            for handle in handles {
                let (video, result) = handle.await.map_err(|e| {
                    PipelineError::configuration(format!("download task died: {e}"))
                })?;
                match result {
                    Ok((scratch, artifact)) => downloaded.push((video, scratch, artifact)),
                    Err(e) => {
                        outcomes.push(record_failure(&self.store, &video, e).await);
                    }
                }
            }
        }
        info!("Phase 2 complete: {} audio files staged", downloaded.len());

        // Phase 3: GPU fan-out over a bounded queue
        self.cancel.check()?;
        let worker_count = self.worker_count().min(downloaded.len().max(1));
        info!("Phase 3: {} GPU workers", worker_count);
        let (tx, rx) = mpsc::channel::<(VideoDescriptor, TempDir, AudioArtifact)>(
            worker_count * 2,
        );
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut worker_handles = Vec::with_capacity(worker_count);
        for worker_idx in 0..worker_count {
            let components = self.factory.build()?;
            let ctx = self.build_context(components, Arc::new(Semaphore::new(1)));
            let acquirer = acquirer.clone();
            let rx = rx.clone();
            worker_handles.push(tokio::spawn(async move {
                let mut results = Vec::new();
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some((video, scratch, artifact)) = item else {
                        break;
                    };
                    let outcome =
                        process_video(&ctx, &acquirer, &video, Some(artifact)).await;
                    results.push(outcome);
                    drop(scratch);
                }
                info!("GPU worker {worker_idx} drained");
                results
            }));
        }

        for item in downloaded {
            if tx.send(item).await.is_err() {
                break;
            }
        }
        drop(tx);

        for handle in worker_handles {
            match handle.await {
                Ok(results) => outcomes.extend(results),
                Err(e) => warn!("GPU worker panicked: {e}"),
            }
        }
        Ok(outcomes)
    }
}

async fn skip_inaccessible(
    ctx: &WorkerContext,
    video: &VideoDescriptor,
    outcome: ProbeOutcome,
) -> ProcessOutcome {
    skip_report(&ctx.store, video, outcome).await
}

async fn skip_report(
    store: &Arc<dyn PersistenceAdapter>,
    video: &VideoDescriptor,
    outcome: ProbeOutcome,
) -> ProcessOutcome {
    let reason = match outcome {
        ProbeOutcome::MembersOnly => "members-only",
        _ => "inaccessible",
    };
    let _ = store
        .update_ingest_status(
            &video.video_id,
            IngestStatus::Skipped,
            StatusUpdate {
                last_error: Some(reason.to_string()),
                ..Default::default()
            },
        )
        .await;
    ProcessOutcome {
        report: VideoReport::skipped(&video.video_id, reason),
        speaker_seconds: HashMap::new(),
    }
}

async fn record_failure(
    store: &Arc<dyn PersistenceAdapter>,
    video: &VideoDescriptor,
    error: PipelineError,
) -> ProcessOutcome {
    let _ = store
        .update_ingest_status(
            &video.video_id,
            IngestStatus::Error,
            StatusUpdate {
                last_error: Some(error.to_string()),
                increment_retry: true,
                ..Default::default()
            },
        )
        .await;
    ProcessOutcome {
        report: VideoReport {
            video_id: video.video_id.clone(),
            success: false,
            skipped: false,
            method: None,
            chunks: 0,
            processing_time: 0.0,
            error: Some(error.to_string()),
        },
        speaker_seconds: HashMap::new(),
    }
}
