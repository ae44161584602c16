//! Text embedding seam
//!
//! Chunk embedding is an external collaborator: the core only needs a
//! text-to-vector function. A deterministic hashing embedder ships for
//! tests and offline runs.

use crate::error::PipelineError;
use sha2::{Digest, Sha256};

/// Text-to-vector capability consumed by the orchestrator.
pub trait TextEmbedder: Send + Sync {
    fn dimension(&self) -> usize;

    /// Embed a batch of texts, one vector per input.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
}

/// Deterministic embedder: token hashes scattered into a fixed-dimension
/// bag-of-words vector, L2-normalized. Equal text always embeds equally,
/// which is what the idempotence tests need.
pub struct HashingTextEmbedder {
    dimension: usize,
}

impl HashingTextEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for HashingTextEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl TextEmbedder for HashingTextEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let mut vector = vec![0.0f32; self.dimension];
            for token in text.to_lowercase().split_whitespace() {
                let digest = Sha256::digest(token.as_bytes());
                let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
                    as usize
                    % self.dimension;
                let sign = if digest[4] & 1 == 0 { 1.0 } else { -1.0 };
                vector[bucket] += sign;
            }
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for value in vector.iter_mut() {
                    *value /= norm;
                }
            }
            vectors.push(vector);
        }
        Ok(vectors)
    }
}
