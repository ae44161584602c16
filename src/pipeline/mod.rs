//! Ingestion orchestration

pub mod orchestrator;
pub mod state;
pub mod worker;

pub use orchestrator::{
    compute_worker_count, ComponentFactory, DefaultComponentFactory, IngestionPipeline,
    WorkerComponents,
};
pub use state::{IngestState, IngestStatus, IngestionSummary, VideoReport, MAX_RETRIES};
pub use worker::{process_video, ProcessOutcome, RecognizerProvider, WhisperProvider, WorkerContext};
