//! Monologue fast-path gate
//!
//! Diarization and identification dominate per-video cost. When the
//! opening of the audio is confidently the enrolled primary voice, the
//! pipeline transcribes without them and labels everything as the primary
//! speaker. The gate is deliberately looser than cluster attribution,
//! reflecting the prior that most content is the primary alone.

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::voice::embedder::{EmbeddingExtractor, WindowParams};
use crate::voice::profile::VoiceProfile;
use crate::voice::store::VoiceProfileStore;
use std::path::Path;
use tracing::{debug, info};

/// Windows sampled from the head of the file (3 windows ≈ first 15 s
/// with silence skipping).
const GATE_WINDOWS: usize = 3;

pub struct MonologueGate<'a> {
    config: &'a PipelineConfig,
    store: &'a VoiceProfileStore,
    extractor: &'a dyn EmbeddingExtractor,
}

impl<'a> MonologueGate<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        store: &'a VoiceProfileStore,
        extractor: &'a dyn EmbeddingExtractor,
    ) -> Self {
        Self {
            config,
            store,
            extractor,
        }
    }

    /// Mean similarity of the opening windows to the primary profile, or
    /// `None` when the gate rejects (no usable audio, or similarity below
    /// the fast-path threshold).
    pub fn check(
        &self,
        audio_path: &Path,
        primary: &VoiceProfile,
    ) -> Result<Option<f32>, PipelineError> {
        if !self.config.assume_monologue {
            return Ok(None);
        }

        let embeddings = self
            .extractor
            .extract(audio_path, &WindowParams::prefix(GATE_WINDOWS))?;
        if embeddings.is_empty() {
            debug!("Fast-path gate found no usable opening audio");
            return Ok(None);
        }

        let mean_similarity = embeddings
            .iter()
            .map(|e| self.store.similarity(e, primary))
            .sum::<f32>()
            / embeddings.len() as f32;
        let threshold = self.config.fast_path_threshold();

        if mean_similarity >= threshold {
            info!(
                "Monologue fast-path triggered: {mean_similarity:.3} >= {threshold:.3}, \
                 skipping diarization"
            );
            Ok(Some(mean_similarity))
        } else {
            info!(
                "Fast-path rejected ({mean_similarity:.3} < {threshold:.3}), \
                 falling back to the full pipeline"
            );
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::profile::l2_normalize;

    struct FixedExtractor {
        vectors: Vec<Vec<f32>>,
    }

    impl EmbeddingExtractor for FixedExtractor {
        fn embedding_dim(&self) -> usize {
            self.vectors.first().map(|v| v.len()).unwrap_or(0)
        }

        fn extract(
            &self,
            _audio_path: &Path,
            params: &WindowParams,
        ) -> Result<Vec<Vec<f32>>, PipelineError> {
            let cap = params.max_windows.unwrap_or(self.vectors.len());
            Ok(self.vectors.iter().take(cap).cloned().collect())
        }
    }

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let mut v = v;
        l2_normalize(&mut v);
        v
    }

    fn primary_profile() -> VoiceProfile {
        let base = unit(vec![1.0, 0.0, 0.0]);
        VoiceProfile::from_embeddings(
            "Chaffee",
            vec![base.clone(), base.clone(), base],
            9.0,
            "ecapa",
            vec![],
        )
    }

    #[test]
    fn matching_voice_passes_the_gate() {
        let config = PipelineConfig::default();
        let store = VoiceProfileStore::new("unused");
        let extractor = FixedExtractor {
            vectors: vec![unit(vec![1.0, 0.1, 0.0]); 10],
        };
        let gate = MonologueGate::new(&config, &store, &extractor);

        let similarity = gate
            .check(Path::new("audio.wav"), &primary_profile())
            .unwrap()
            .expect("gate should pass");
        assert!(similarity >= config.fast_path_threshold());
    }

    #[test]
    fn mismatched_voice_is_rejected() {
        let config = PipelineConfig::default();
        let store = VoiceProfileStore::new("unused");
        let extractor = FixedExtractor {
            vectors: vec![unit(vec![0.0, 1.0, 0.0]); 10],
        };
        let gate = MonologueGate::new(&config, &store, &extractor);

        assert!(gate
            .check(Path::new("audio.wav"), &primary_profile())
            .unwrap()
            .is_none());
    }

    #[test]
    fn disabled_gate_never_fires() {
        let mut config = PipelineConfig::default();
        config.assume_monologue = false;
        let store = VoiceProfileStore::new("unused");
        let extractor = FixedExtractor {
            vectors: vec![unit(vec![1.0, 0.0, 0.0]); 10],
        };
        let gate = MonologueGate::new(&config, &store, &extractor);

        assert!(gate
            .check(Path::new("audio.wav"), &primary_profile())
            .unwrap()
            .is_none());
    }

    #[test]
    fn silent_opening_rejects_the_gate() {
        let config = PipelineConfig::default();
        let store = VoiceProfileStore::new("unused");
        let extractor = FixedExtractor { vectors: vec![] };
        let gate = MonologueGate::new(&config, &store, &extractor);

        assert!(gate
            .check(Path::new("audio.wav"), &primary_profile())
            .unwrap()
            .is_none());
    }
}
