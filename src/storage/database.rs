//! SQLite database handle and schema
//!
//! One connection behind a mutex, shared across blocking tasks. Chunk
//! embeddings are stored as little-endian f32 BLOBs.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Clone)]
pub struct Database {
    pub(crate) connection: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))?;
        Self::initialize(&connection)?;
        info!("Opened ingest database at {}", path.display());
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory db")?;
        Self::initialize(&connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn initialize(connection: &Connection) -> Result<()> {
        connection
            .execute_batch(
                "PRAGMA foreign_keys = ON;

                CREATE TABLE IF NOT EXISTS sources (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_type TEXT NOT NULL,
                    video_id TEXT NOT NULL,
                    title TEXT NOT NULL,
                    duration_seconds REAL,
                    published_at TEXT,
                    url_or_path TEXT,
                    UNIQUE(source_type, video_id)
                );

                CREATE TABLE IF NOT EXISTS chunks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
                    chunk_index INTEGER NOT NULL,
                    chunk_hash TEXT NOT NULL,
                    text TEXT NOT NULL,
                    t_start REAL NOT NULL,
                    t_end REAL NOT NULL,
                    word_count INTEGER NOT NULL,
                    speaker TEXT,
                    speaker_fractions TEXT,
                    embedding BLOB,
                    UNIQUE(source_id, chunk_index)
                );
                CREATE INDEX IF NOT EXISTS idx_chunks_hash ON chunks(chunk_hash);

                CREATE TABLE IF NOT EXISTS ingest_state (
                    video_id TEXT PRIMARY KEY,
                    status TEXT NOT NULL,
                    retry_count INTEGER NOT NULL DEFAULT 0,
                    last_error TEXT,
                    has_yt_transcript INTEGER NOT NULL DEFAULT 0,
                    has_whisper INTEGER NOT NULL DEFAULT 0,
                    enhanced_asr_used INTEGER NOT NULL DEFAULT 0,
                    monologue_fast_path INTEGER NOT NULL DEFAULT 0,
                    diarization_failed INTEGER NOT NULL DEFAULT 0,
                    chunk_count INTEGER NOT NULL DEFAULT 0,
                    embedding_count INTEGER NOT NULL DEFAULT 0,
                    updated_at TEXT NOT NULL
                );",
            )
            .context("failed to initialize schema")?;
        Ok(())
    }
}

/// Encode an embedding as a little-endian f32 BLOB.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 BLOB back into an embedding.
pub fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_in_memory() {
        let db = Database::in_memory().unwrap();
        let conn = db.connection.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'
                 AND name IN ('sources', 'chunks', 'ingest_state')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn vector_blob_round_trip() {
        let vector = vec![0.25f32, -1.5, 3.75, 0.0];
        let blob = vector_to_blob(&vector);
        assert_eq!(blob.len(), 16);
        assert_eq!(blob_to_vector(&blob), vector);
    }
}
