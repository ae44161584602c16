//! Pipeline error types
//!
//! Closed error set shared across the ingestion pipeline. Every stage maps
//! its failures into one of these variants; the orchestrator decides per
//! variant whether a failure is fatal to the batch or only to one video.

use thiserror::Error;

/// Failure sub-kind for audio acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionKind {
    /// Video does not exist or is private
    NotFound,

    /// Members-only or otherwise gated content
    MembersOnly,

    /// Download or connectivity failure
    Network,

    /// Duration exceeds the configured maximum
    TooLong,

    /// The media could not be decoded into PCM
    DecodeFailed,
}

impl std::fmt::Display for AcquisitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AcquisitionKind::NotFound => "not_found",
            AcquisitionKind::MembersOnly => "members_only",
            AcquisitionKind::Network => "network",
            AcquisitionKind::TooLong => "too_long",
            AcquisitionKind::DecodeFailed => "decode_failed",
        };
        f.write_str(s)
    }
}

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("audio acquisition failed ({kind}): {message}")]
    Acquisition {
        kind: AcquisitionKind,
        message: String,
    },

    #[error("transcription failed: {message}")]
    Transcription { message: String },

    #[error("diarization failed: {message}")]
    Diarization { message: String },

    #[error("speaker identification failed: {message}")]
    Identification { message: String },

    #[error("word alignment failed: {message}")]
    Alignment { message: String },

    #[error("chunking failed: {message}")]
    Chunking { message: String },

    #[error("embedding failed: {message}")]
    Embedding { message: String },

    #[error("persistence failed: {message}")]
    Persistence { message: String },

    #[error("invalid configuration: {message}")]
    Configuration { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn acquisition(kind: AcquisitionKind, message: impl Into<String>) -> Self {
        PipelineError::Acquisition {
            kind,
            message: message.into(),
        }
    }

    pub fn transcription(message: impl Into<String>) -> Self {
        PipelineError::Transcription {
            message: message.into(),
        }
    }

    pub fn diarization(message: impl Into<String>) -> Self {
        PipelineError::Diarization {
            message: message.into(),
        }
    }

    pub fn identification(message: impl Into<String>) -> Self {
        PipelineError::Identification {
            message: message.into(),
        }
    }

    pub fn alignment(message: impl Into<String>) -> Self {
        PipelineError::Alignment {
            message: message.into(),
        }
    }

    pub fn chunking(message: impl Into<String>) -> Self {
        PipelineError::Chunking {
            message: message.into(),
        }
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        PipelineError::Embedding {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        PipelineError::Persistence {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error is fatal to the whole batch rather than one video.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Configuration { .. })
    }
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::persistence(err.to_string())
    }
}
