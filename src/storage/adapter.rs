//! Persistence adapter
//!
//! Narrow interface between the pipeline and the relational store. The
//! SQLite implementation keys sources by `(source_type, video_id)` and
//! chunks by `(source_id, chunk_index)`, so re-running a completed video
//! rewrites identical rows instead of duplicating them. Chunk writes for
//! one video are a single transaction.

use crate::chunker::Chunk;
use crate::error::PipelineError;
use crate::listing::VideoDescriptor;
use crate::pipeline::state::{IngestState, IngestStatus};
use crate::storage::database::{vector_to_blob, Database};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tokio::task;
use tracing::{debug, info};

/// Partial update applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub last_error: Option<String>,
    pub increment_retry: bool,
    pub has_whisper: Option<bool>,
    pub enhanced_asr_used: Option<bool>,
    pub monologue_fast_path: Option<bool>,
    pub diarization_failed: Option<bool>,
    pub chunk_count: Option<usize>,
    pub embedding_count: Option<usize>,
}

/// C13: the only surface through which the pipeline touches the store.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
    /// Insert or refresh the source row, returning its id.
    async fn upsert_source(&self, descriptor: &VideoDescriptor) -> Result<i64, PipelineError>;

    /// All-or-none write of a video's chunk set.
    async fn upsert_chunks(
        &self,
        source_id: i64,
        video_id: &str,
        chunks: &[Chunk],
    ) -> Result<usize, PipelineError>;

    async fn get_ingest_state(&self, video_id: &str)
        -> Result<Option<IngestState>, PipelineError>;

    async fn upsert_ingest_state(&self, state: &IngestState) -> Result<(), PipelineError>;

    async fn update_ingest_status(
        &self,
        video_id: &str,
        status: IngestStatus,
        update: StatusUpdate,
    ) -> Result<(), PipelineError>;

    /// `(source_id, chunk_count)` for an already-ingested video.
    async fn check_video_exists(
        &self,
        video_id: &str,
    ) -> Result<Option<(i64, usize)>, PipelineError>;
}

/// SQLite-backed adapter.
pub struct SqliteAdapter {
    db: Database,
}

impl SqliteAdapter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PersistenceAdapter for SqliteAdapter {
    async fn upsert_source(&self, descriptor: &VideoDescriptor) -> Result<i64, PipelineError> {
        let connection = Arc::clone(&self.db.connection);
        let descriptor = descriptor.clone();

        task::spawn_blocking(move || -> Result<i64, PipelineError> {
            let conn = connection.lock().expect("db mutex");
            conn.execute(
                "INSERT INTO sources (source_type, video_id, title, duration_seconds, published_at, url_or_path)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(source_type, video_id) DO UPDATE SET
                     title = excluded.title,
                     duration_seconds = excluded.duration_seconds,
                     published_at = excluded.published_at,
                     url_or_path = excluded.url_or_path",
                params![
                    descriptor.source_type.as_str(),
                    descriptor.video_id,
                    descriptor.title,
                    descriptor.duration_seconds,
                    descriptor.published_at.map(|t| t.to_rfc3339()),
                    descriptor.url_or_path,
                ],
            )?;
            let id: i64 = conn.query_row(
                "SELECT id FROM sources WHERE source_type = ?1 AND video_id = ?2",
                params![descriptor.source_type.as_str(), descriptor.video_id],
                |row| row.get(0),
            )?;
            Ok(id)
        })
        .await
        .map_err(|e| PipelineError::persistence(format!("join error: {e}")))?
    }

    async fn upsert_chunks(
        &self,
        source_id: i64,
        video_id: &str,
        chunks: &[Chunk],
    ) -> Result<usize, PipelineError> {
        let connection = Arc::clone(&self.db.connection);
        let video_id = video_id.to_string();
        let chunks = chunks.to_vec();

        task::spawn_blocking(move || -> Result<usize, PipelineError> {
            let mut conn = connection.lock().expect("db mutex");
            let tx = conn
                .transaction()
                .map_err(PipelineError::from)?;
            for chunk in &chunks {
                let fractions = chunk
                    .speaker_fractions
                    .as_ref()
                    .map(|f| serde_json::to_string(f).unwrap_or_default());
                tx.execute(
                    "INSERT INTO chunks
                         (source_id, chunk_index, chunk_hash, text, t_start, t_end,
                          word_count, speaker, speaker_fractions, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(source_id, chunk_index) DO UPDATE SET
                         chunk_hash = excluded.chunk_hash,
                         text = excluded.text,
                         t_start = excluded.t_start,
                         t_end = excluded.t_end,
                         word_count = excluded.word_count,
                         speaker = excluded.speaker,
                         speaker_fractions = excluded.speaker_fractions,
                         embedding = excluded.embedding",
                    params![
                        source_id,
                        chunk.chunk_index as i64,
                        chunk.stable_hash(&video_id),
                        chunk.text,
                        chunk.t_start,
                        chunk.t_end,
                        chunk.word_count as i64,
                        chunk.speaker,
                        fractions,
                        chunk.embedding.as_deref().map(vector_to_blob),
                    ],
                )?;
            }
            // Stale tail chunks from a previous, longer ingest must go
            tx.execute(
                "DELETE FROM chunks WHERE source_id = ?1 AND chunk_index >= ?2",
                params![source_id, chunks.len() as i64],
            )?;
            tx.commit().map_err(PipelineError::from)?;
            debug!("Upserted {} chunks for {}", chunks.len(), video_id);
            Ok(chunks.len())
        })
        .await
        .map_err(|e| PipelineError::persistence(format!("join error: {e}")))?
    }

    async fn get_ingest_state(
        &self,
        video_id: &str,
    ) -> Result<Option<IngestState>, PipelineError> {
        let connection = Arc::clone(&self.db.connection);
        let video_id = video_id.to_string();

        task::spawn_blocking(move || -> Result<Option<IngestState>, PipelineError> {
            let conn = connection.lock().expect("db mutex");
            let state = conn
                .query_row(
                    "SELECT video_id, status, retry_count, last_error, has_yt_transcript,
                            has_whisper, enhanced_asr_used, monologue_fast_path,
                            diarization_failed, chunk_count, embedding_count, updated_at
                     FROM ingest_state WHERE video_id = ?1",
                    params![video_id],
                    row_to_state,
                )
                .optional()?;
            Ok(state)
        })
        .await
        .map_err(|e| PipelineError::persistence(format!("join error: {e}")))?
    }

    async fn upsert_ingest_state(&self, state: &IngestState) -> Result<(), PipelineError> {
        let connection = Arc::clone(&self.db.connection);
        let state = state.clone();

        task::spawn_blocking(move || -> Result<(), PipelineError> {
            let conn = connection.lock().expect("db mutex");
            conn.execute(
                "INSERT INTO ingest_state
                     (video_id, status, retry_count, last_error, has_yt_transcript, has_whisper,
                      enhanced_asr_used, monologue_fast_path, diarization_failed,
                      chunk_count, embedding_count, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(video_id) DO UPDATE SET
                     status = excluded.status,
                     retry_count = excluded.retry_count,
                     last_error = excluded.last_error,
                     has_yt_transcript = excluded.has_yt_transcript,
                     has_whisper = excluded.has_whisper,
                     enhanced_asr_used = excluded.enhanced_asr_used,
                     monologue_fast_path = excluded.monologue_fast_path,
                     diarization_failed = excluded.diarization_failed,
                     chunk_count = excluded.chunk_count,
                     embedding_count = excluded.embedding_count,
                     updated_at = excluded.updated_at",
                params![
                    state.video_id,
                    state.status.as_str(),
                    state.retry_count,
                    state.last_error,
                    state.has_yt_transcript as i64,
                    state.has_whisper as i64,
                    state.enhanced_asr_used as i64,
                    state.monologue_fast_path as i64,
                    state.diarization_failed as i64,
                    state.chunk_count as i64,
                    state.embedding_count as i64,
                    state.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| PipelineError::persistence(format!("join error: {e}")))?
    }

    async fn update_ingest_status(
        &self,
        video_id: &str,
        status: IngestStatus,
        update: StatusUpdate,
    ) -> Result<(), PipelineError> {
        let mut state = self
            .get_ingest_state(video_id)
            .await?
            .unwrap_or_else(|| IngestState::new(video_id));

        state.status = status;
        state.updated_at = Utc::now();
        if update.increment_retry {
            state.retry_count += 1;
        }
        if let Some(error) = update.last_error {
            state.last_error = Some(error);
        }
        if let Some(v) = update.has_whisper {
            state.has_whisper = v;
        }
        if let Some(v) = update.enhanced_asr_used {
            state.enhanced_asr_used = v;
        }
        if let Some(v) = update.monologue_fast_path {
            state.monologue_fast_path = v;
        }
        if let Some(v) = update.diarization_failed {
            state.diarization_failed = v;
        }
        if let Some(v) = update.chunk_count {
            state.chunk_count = v;
        }
        if let Some(v) = update.embedding_count {
            state.embedding_count = v;
        }

        info!(
            "Ingest state {} -> {} (retries {})",
            video_id,
            status.as_str(),
            state.retry_count
        );
        self.upsert_ingest_state(&state).await
    }

    async fn check_video_exists(
        &self,
        video_id: &str,
    ) -> Result<Option<(i64, usize)>, PipelineError> {
        let connection = Arc::clone(&self.db.connection);
        let video_id = video_id.to_string();

        task::spawn_blocking(move || -> Result<Option<(i64, usize)>, PipelineError> {
            let conn = connection.lock().expect("db mutex");
            let source_id: Option<i64> = conn
                .query_row(
                    "SELECT id FROM sources WHERE video_id = ?1",
                    params![video_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(source_id) = source_id else {
                return Ok(None);
            };
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chunks WHERE source_id = ?1",
                params![source_id],
                |row| row.get(0),
            )?;
            Ok(Some((source_id, count as usize)))
        })
        .await
        .map_err(|e| PipelineError::persistence(format!("join error: {e}")))?
    }
}

fn row_to_state(row: &Row<'_>) -> rusqlite::Result<IngestState> {
    let status_raw: String = row.get(1)?;
    let updated_raw: String = row.get(11)?;
    Ok(IngestState {
        video_id: row.get(0)?,
        status: IngestStatus::parse(&status_raw).unwrap_or(IngestStatus::Pending),
        retry_count: row.get(2)?,
        last_error: row.get(3)?,
        has_yt_transcript: row.get::<_, i64>(4)? != 0,
        has_whisper: row.get::<_, i64>(5)? != 0,
        enhanced_asr_used: row.get::<_, i64>(6)? != 0,
        monologue_fast_path: row.get::<_, i64>(7)? != 0,
        diarization_failed: row.get::<_, i64>(8)? != 0,
        chunk_count: row.get::<_, i64>(9)? as usize,
        embedding_count: row.get::<_, i64>(10)? as usize,
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated_raw)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}
