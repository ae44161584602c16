//! Two-stage speech recognition
//!
//! A fast primary pass over the whole file, then selective high-quality
//! re-transcription of spans the quality metrics flag.

pub mod engine;
pub mod refine;
pub mod types;

pub use engine::{
    LazyWhisperEngine, QualityThresholds, RecognizerOutput, SpeechRecognizer, TranscribeRequest,
    WhisperEngine,
};
pub use refine::{refine, RefinementStats};
pub use types::{
    AsrSegment, SpeakerSegment, TranscriptionMetadata, TranscriptionMethod, TranscriptionResult,
    WordToken,
};
