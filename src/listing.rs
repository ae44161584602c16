//! Video descriptors and listing helpers
//!
//! The remote channel lister is an external collaborator; the core consumes
//! any iterator of descriptors. A local-directory lister and a JSON-dump
//! lister ship here for batch runs over already-fetched material.

use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where a video's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Remote,
    Local,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Remote => "remote",
            SourceType::Local => "local",
        }
    }
}

/// Identity of one input video. Immutable once produced by a lister.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDescriptor {
    /// Opaque unique id
    pub video_id: String,

    pub title: String,

    pub duration_seconds: Option<f64>,

    pub published_at: Option<DateTime<Utc>>,

    pub source_type: SourceType,

    /// Watch URL for remote sources, filesystem path for local ones
    pub url_or_path: String,
}

impl VideoDescriptor {
    pub fn remote(video_id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            title: title.into(),
            duration_seconds: None,
            published_at: None,
            source_type: SourceType::Remote,
            url_or_path: url.into(),
        }
    }

    pub fn local(video_id: impl Into<String>, title: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            video_id: video_id.into(),
            title: title.into(),
            duration_seconds: None,
            published_at: None,
            source_type: SourceType::Local,
            url_or_path: path.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.source_type == SourceType::Remote
    }
}

/// Anything that can enumerate videos for ingestion.
pub trait VideoLister: Send + Sync {
    fn list(&self) -> Result<Vec<VideoDescriptor>, PipelineError>;
}

/// Lists media files under a directory as local descriptors.
///
/// Ids are the file stems, which keeps re-runs over the same tree
/// idempotent.
pub struct LocalFileLister {
    root: PathBuf,
    extensions: Vec<String>,
}

impl LocalFileLister {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: ["wav", "mp3", "m4a", "mp4", "webm", "mkv", "ogg", "flac"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions;
        self
    }

    fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| e == &ext)
            })
            .unwrap_or(false)
    }
}

impl VideoLister for LocalFileLister {
    fn list(&self) -> Result<Vec<VideoDescriptor>, PipelineError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            PipelineError::configuration(format!(
                "cannot list media directory {}: {e}",
                self.root.display()
            ))
        })?;

        let mut descriptors = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                PipelineError::configuration(format!("cannot read directory entry: {e}"))
            })?;
            let path = entry.path();
            if !path.is_file() || !self.accepts(&path) {
                continue;
            }
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            descriptors.push(VideoDescriptor {
                video_id: stem.clone(),
                title: stem,
                duration_seconds: None,
                published_at: None,
                source_type: SourceType::Local,
                url_or_path: path.to_string_lossy().into_owned(),
            });
        }

        // Stable order keeps batch runs reproducible
        descriptors.sort_by(|a, b| a.video_id.cmp(&b.video_id));
        debug!(
            "Listed {} local media files under {}",
            descriptors.len(),
            self.root.display()
        );
        Ok(descriptors)
    }
}

/// Reads a JSON array of descriptors dumped by an external lister.
pub struct JsonFileLister {
    path: PathBuf,
}

impl JsonFileLister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl VideoLister for JsonFileLister {
    fn list(&self) -> Result<Vec<VideoDescriptor>, PipelineError> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            PipelineError::configuration(format!(
                "cannot read video list {}: {e}",
                self.path.display()
            ))
        })?;
        let descriptors: Vec<VideoDescriptor> = serde_json::from_str(&raw).map_err(|e| {
            PipelineError::configuration(format!(
                "invalid video list {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(descriptors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_lister_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_video.wav"), b"x").unwrap();
        std::fs::write(dir.path().join("a_video.mp3"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let listed = LocalFileLister::new(dir.path()).list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].video_id, "a_video");
        assert_eq!(listed[1].video_id, "b_video");
        assert!(listed.iter().all(|d| d.source_type == SourceType::Local));
    }

    #[test]
    fn json_lister_round_trips_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let descriptors = vec![
            VideoDescriptor::remote("abc123", "Episode 1", "https://example.com/watch?v=abc123"),
            VideoDescriptor::local("clip", "Clip", "/media/clip.wav"),
        ];
        let path = dir.path().join("videos.json");
        std::fs::write(&path, serde_json::to_string(&descriptors).unwrap()).unwrap();

        let listed = JsonFileLister::new(&path).list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].video_id, "abc123");
        assert!(listed[0].is_remote());
        assert!(!listed[1].is_remote());
    }
}
