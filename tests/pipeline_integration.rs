//! End-to-end pipeline tests with stub models
//!
//! Exercises the orchestrator, state machine, and persistence with a
//! deterministic recognizer and embedder standing in for the GPU models.
//! The energy diarizer and SQLite adapter are the real implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use voxscribe::asr::engine::{RecognizerOutput, SpeechRecognizer, TranscribeRequest};
use voxscribe::asr::types::{AsrSegment, WordToken};
use voxscribe::audio::wave;
use voxscribe::config::PipelineConfig;
use voxscribe::diarize::EnergyDiarizer;
use voxscribe::embed::{HashingTextEmbedder, TextEmbedder};
use voxscribe::error::PipelineError;
use voxscribe::listing::VideoDescriptor;
use voxscribe::pipeline::state::{IngestState, IngestStatus};
use voxscribe::pipeline::worker::RecognizerProvider;
use voxscribe::pipeline::{ComponentFactory, IngestionPipeline, WorkerComponents};
use voxscribe::storage::adapter::PersistenceAdapter;
use voxscribe::storage::{Database, SqliteAdapter};
use voxscribe::voice::embedder::{EmbeddingExtractor, WindowParams};
use voxscribe::voice::profile::{l2_normalize, VoiceProfile};
use voxscribe::voice::store::VoiceProfileStore;

/// Deterministic recognizer: one ten-second sentence per slice of audio.
struct StubRecognizer;

impl SpeechRecognizer for StubRecognizer {
    fn model_name(&self) -> &str {
        "stub-whisper"
    }

    fn transcribe(
        &self,
        audio_path: &Path,
        _request: &TranscribeRequest,
    ) -> Result<RecognizerOutput, PipelineError> {
        let samples = wave::load_mono_16k(audio_path)
            .map_err(|e| PipelineError::transcription(e.to_string()))?;
        let duration = samples.len() as f64 / wave::SAMPLE_RATE as f64;

        let mut segments = Vec::new();
        let mut words = Vec::new();
        let mut start = 0.0f64;
        let mut index = 0usize;
        while start < duration {
            let end = (start + 10.0).min(duration);
            let text = format!("This is synthetic sentence number {index}.");
            let word_texts: Vec<&str> = text.split_whitespace().collect();
            let step = (end - start) / word_texts.len() as f64;
            for (w, word) in word_texts.iter().enumerate() {
                words.push(WordToken {
                    text: word.to_string(),
                    start: start + w as f64 * step,
                    end: start + (w + 1) as f64 * step,
                    asr_confidence: 0.92,
                    speaker: None,
                    speaker_confidence: None,
                    speaker_margin: None,
                    is_overlap: false,
                });
            }
            segments.push(AsrSegment {
                start,
                end,
                text,
                avg_logprob: -0.12,
                compression_ratio: 1.4,
                no_speech_prob: 0.01,
                needs_refinement: false,
                was_refined: false,
                merged_into: None,
                speaker: None,
                speaker_confidence: None,
            });
            start = end;
            index += 1;
        }

        Ok(RecognizerOutput {
            segments,
            words,
            language: "en".to_string(),
            duration,
        })
    }
}

struct StubProvider;

impl RecognizerProvider for StubProvider {
    fn primary(&self) -> Result<Arc<dyn SpeechRecognizer>, PipelineError> {
        Ok(Arc::new(StubRecognizer))
    }

    fn refinement(&self) -> Result<Arc<dyn SpeechRecognizer>, PipelineError> {
        self.primary()
    }
}

/// Embedder that always hears the primary voice.
struct PrimaryVoiceExtractor;

fn primary_vector() -> Vec<f32> {
    let mut v = vec![0.8, 0.4, 0.2, 0.1];
    l2_normalize(&mut v);
    v
}

impl EmbeddingExtractor for PrimaryVoiceExtractor {
    fn embedding_dim(&self) -> usize {
        4
    }

    fn extract(
        &self,
        _audio_path: &Path,
        params: &WindowParams,
    ) -> Result<Vec<Vec<f32>>, PipelineError> {
        let count = params.max_windows.unwrap_or(5);
        Ok(vec![primary_vector(); count])
    }
}

struct StubFactory;

impl ComponentFactory for StubFactory {
    fn build(&self) -> Result<WorkerComponents, PipelineError> {
        Ok(WorkerComponents {
            recognizers: Arc::new(StubProvider),
            voice_extractor: Arc::new(PrimaryVoiceExtractor),
            diarizer: Arc::new(EnergyDiarizer::default()),
            diarizer_is_fallback: false,
        })
    }
}

struct Fixture {
    _root: tempfile::TempDir,
    config: PipelineConfig,
    adapter: Arc<SqliteAdapter>,
    media_dir: PathBuf,
}

fn fixture() -> Fixture {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let root = tempfile::tempdir().unwrap();
    let voices_dir = root.path().join("voices");
    let media_dir = root.path().join("media");
    std::fs::create_dir_all(&media_dir).unwrap();

    // Enroll the primary profile the stub extractor will always match
    let store = VoiceProfileStore::new(&voices_dir);
    let base = primary_vector();
    let profile = VoiceProfile::from_embeddings(
        "Chaffee",
        vec![base.clone(), base.clone(), base],
        30.0,
        "stub",
        vec![],
    );
    store.save(&profile).unwrap();

    let mut config = PipelineConfig::default();
    config.voices_dir = voices_dir;
    config.gpu_workers = Some(1);
    config.asr.enable_refinement = false;

    let adapter = Arc::new(SqliteAdapter::new(Database::in_memory().unwrap()));

    Fixture {
        _root: root,
        config,
        adapter,
        media_dir,
    }
}

fn write_video(fixture: &Fixture, video_id: &str, secs: f32) -> VideoDescriptor {
    let path = fixture.media_dir.join(format!("{video_id}.wav"));
    let samples: Vec<f32> = (0..(secs * wave::SAMPLE_RATE as f32) as usize)
        .map(|i| {
            let t = i as f32 / wave::SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * 180.0 * t).sin() * 0.5
        })
        .collect();
    wave::write_mono_16k(&path, &samples).unwrap();
    VideoDescriptor::local(video_id, video_id, path.to_string_lossy().into_owned())
}

fn pipeline(fixture: &Fixture) -> IngestionPipeline {
    let embedder: Arc<dyn TextEmbedder> = Arc::new(HashingTextEmbedder::default());
    let store: Arc<dyn PersistenceAdapter> = fixture.adapter.clone();
    IngestionPipeline::new(fixture.config.clone(), store, embedder)
        .unwrap()
        .with_factory(Arc::new(StubFactory))
}

#[tokio::test]
async fn monologue_batch_completes_with_fast_path() {
    let fixture = fixture();
    let videos = vec![write_video(&fixture, "solo1", 95.0)];

    let summary = pipeline(&fixture).run(videos).await.unwrap();

    assert_eq!(summary.total, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 0);
    let report = &summary.reports[0];
    assert_eq!(report.method.as_deref(), Some("monologue_fast_path"));
    assert!(report.chunks >= 2);

    // Everything attributed to the primary speaker
    assert!(summary.speaker_time_percentages["Chaffee"] > 99.0);

    let state = fixture
        .adapter
        .get_ingest_state("solo1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, IngestStatus::Done);
    assert!(state.monologue_fast_path);
    assert!(state.has_whisper);
    assert_eq!(state.chunk_count, report.chunks);
    assert_eq!(state.embedding_count, report.chunks);

    let (_, chunk_count) = fixture
        .adapter
        .check_video_exists("solo1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chunk_count, report.chunks);
}

#[tokio::test]
async fn rerun_is_idempotent_and_skips_done_videos() {
    let fixture = fixture();
    let videos = vec![
        write_video(&fixture, "vid_a", 60.0),
        write_video(&fixture, "vid_b", 60.0),
    ];

    let first = pipeline(&fixture).run(videos.clone()).await.unwrap();
    assert_eq!(first.succeeded, 2);
    let chunks_after_first = fixture
        .adapter
        .check_video_exists("vid_a")
        .await
        .unwrap()
        .unwrap()
        .1;

    let second = pipeline(&fixture).run(videos).await.unwrap();
    assert_eq!(second.succeeded, 0);
    assert_eq!(second.skipped, 2);

    let chunks_after_second = fixture
        .adapter
        .check_video_exists("vid_a")
        .await
        .unwrap()
        .unwrap()
        .1;
    assert_eq!(chunks_after_first, chunks_after_second);
}

#[tokio::test]
async fn interrupted_videos_resume_from_the_top_without_duplicates() {
    let fixture = fixture();
    let videos = vec![
        write_video(&fixture, "resume1", 50.0),
        write_video(&fixture, "resume2", 50.0),
        write_video(&fixture, "fresh", 50.0),
    ];

    // Simulate a crash: one video mid-chunked, one already embedded
    let mut mid = IngestState::new("resume1");
    mid.status = IngestStatus::Chunked;
    mid.chunk_count = 2;
    fixture.adapter.upsert_ingest_state(&mid).await.unwrap();

    let mut embedded = IngestState::new("resume2");
    embedded.status = IngestStatus::Embedded;
    fixture.adapter.upsert_ingest_state(&embedded).await.unwrap();

    let summary = pipeline(&fixture).run(videos).await.unwrap();
    assert_eq!(summary.succeeded, 3);

    for video_id in ["resume1", "resume2", "fresh"] {
        let state = fixture
            .adapter
            .get_ingest_state(video_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.status, IngestStatus::Done, "{video_id}");
        let (_, chunks) = fixture
            .adapter
            .check_video_exists(video_id)
            .await
            .unwrap()
            .unwrap();
        // 50 s of audio at a 45 s chunk target: exactly two chunks, no
        // duplicates from the earlier partial run
        assert_eq!(chunks, 2, "{video_id}");
    }
}

#[tokio::test]
async fn failures_accrue_retries_then_park_as_skipped() {
    let fixture = fixture();
    let ghost = VideoDescriptor::local("ghost", "Ghost", "/nonexistent/ghost.wav");

    for attempt in 1..=3u32 {
        let summary = pipeline(&fixture).run(vec![ghost.clone()]).await.unwrap();
        assert_eq!(summary.failed, 1, "attempt {attempt}");
        let state = fixture
            .adapter
            .get_ingest_state("ghost")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state.retry_count, attempt);
    }

    let state = fixture
        .adapter
        .get_ingest_state("ghost")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.status, IngestStatus::Skipped);

    // Struck out: further runs skip without touching the retry count
    let summary = pipeline(&fixture).run(vec![ghost]).await.unwrap();
    assert_eq!(summary.skipped, 1);
    let state = fixture
        .adapter
        .get_ingest_state("ghost")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.retry_count, 3);
}

#[tokio::test]
async fn cancelled_batch_reports_without_completing() {
    let fixture = fixture();
    let videos = vec![write_video(&fixture, "cancelme", 60.0)];

    let pipeline = pipeline(&fixture);
    pipeline.cancel_token().cancel();
    let summary = pipeline.run(videos).await;

    // Phased checks abort outright; concurrent tasks report per video
    match summary {
        Ok(summary) => {
            assert_eq!(summary.succeeded, 0);
            let report = &summary.reports[0];
            assert_eq!(report.error.as_deref(), Some("cancelled"));
        }
        Err(PipelineError::Cancelled) => {}
        Err(other) => panic!("unexpected error: {other}"),
    }

    // No chunk rows were committed
    assert!(fixture
        .adapter
        .check_video_exists("cancelme")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn empty_batch_yields_empty_summary() {
    let fixture = fixture();
    let summary = pipeline(&fixture).run(Vec::new()).await.unwrap();
    assert_eq!(summary.total, 0);
    assert_eq!(summary.success_rate(), 0.0);
    assert!(summary.speaker_time_percentages.is_empty());
}

#[tokio::test]
async fn speaker_percentages_aggregate_across_videos() {
    let fixture = fixture();
    let videos = vec![
        write_video(&fixture, "pct1", 45.0),
        write_video(&fixture, "pct2", 45.0),
    ];
    let summary = pipeline(&fixture).run(videos).await.unwrap();
    assert_eq!(summary.succeeded, 2);

    let mut total: f64 = summary.speaker_time_percentages.values().sum();
    // Single attributed speaker accounts for all attributed time
    assert!((total - 100.0).abs() < 1e-6);
    total = summary.speaker_time_percentages["Chaffee"];
    assert!((total - 100.0).abs() < 1e-6);
}

#[tokio::test]
async fn source_rows_track_descriptors() {
    let fixture = fixture();
    let videos = vec![write_video(&fixture, "srccheck", 30.0)];
    let summary = pipeline(&fixture).run(videos).await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let (source_id, count) = fixture
        .adapter
        .check_video_exists("srccheck")
        .await
        .unwrap()
        .unwrap();
    assert!(source_id > 0);
    assert_eq!(count, summary.reports[0].chunks);
}
