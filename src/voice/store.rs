//! Voice profile store
//!
//! Profiles live as one JSON document per speaker under the voices
//! directory, written atomically via temp-file + rename. Loaded profiles
//! are cached process-wide and shared read-only.

use crate::voice::embedder::{EmbeddingExtractor, WindowParams};
use crate::voice::profile::{
    cosine_similarity, VoiceProfile, MIN_PROFILE_EMBEDDINGS,
};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// How enrollment treats an existing profile of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnrollMode {
    /// Refuse if the profile already exists
    Create,

    /// Replace any existing profile
    Overwrite,

    /// Append new embeddings to an existing profile
    Update,
}

/// Bound on the subsample used when comparing against a profile's raw
/// embedding list.
const MAX_COMPARISON_EMBEDDINGS: usize = 10;

pub struct VoiceProfileStore {
    voices_dir: PathBuf,
    cache: RwLock<HashMap<String, Arc<VoiceProfile>>>,
}

impl VoiceProfileStore {
    pub fn new(voices_dir: impl Into<PathBuf>) -> Self {
        Self {
            voices_dir: voices_dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn profile_path(&self, name: &str) -> PathBuf {
        self.voices_dir.join(format!("{}.json", name.to_lowercase()))
    }

    /// Enrolled profile names, lowercased.
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.voices_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.ends_with(".json") && !name.ends_with(".meta.json") {
                    Some(name.trim_end_matches(".json").to_string())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }

    /// Load a profile by name, consulting the cache first. Legacy
    /// documents are normalized before caching.
    pub fn load(&self, name: &str) -> Result<Option<Arc<VoiceProfile>>> {
        let key = name.to_lowercase();
        if let Some(profile) = self.cache.read().expect("profile cache").get(&key) {
            return Ok(Some(profile.clone()));
        }

        let path = self.profile_path(&key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read profile {}", path.display()))?;
        let mut profile: VoiceProfile = serde_json::from_str(&raw)
            .with_context(|| format!("invalid profile document {}", path.display()))?;
        profile.normalize();

        debug!(
            "Loaded profile {} ({} embeddings, threshold {:.3})",
            profile.name,
            profile.embeddings.len(),
            profile.recommended_threshold
        );

        let profile = Arc::new(profile);
        self.cache
            .write()
            .expect("profile cache")
            .insert(key, profile.clone());
        Ok(Some(profile))
    }

    /// Write a profile atomically and refresh the cache.
    pub fn save(&self, profile: &VoiceProfile) -> Result<()> {
        std::fs::create_dir_all(&self.voices_dir)
            .with_context(|| format!("cannot create {}", self.voices_dir.display()))?;
        let path = self.profile_path(&profile.name);

        let json = serde_json::to_string_pretty(profile).context("failed to encode profile")?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.voices_dir)
            .context("failed to create temp profile file")?;
        tmp.write_all(json.as_bytes())
            .context("failed to write profile")?;
        tmp.persist(&path)
            .with_context(|| format!("failed to move profile into place at {}", path.display()))?;

        self.cache
            .write()
            .expect("profile cache")
            .insert(profile.name.to_lowercase(), Arc::new(profile.clone()));
        info!("Saved voice profile {} to {}", profile.name, path.display());
        Ok(())
    }

    /// Enroll a speaker from local audio files.
    ///
    /// Windows come from the extractor at the standard 3 s / 1.5 s
    /// sliding schedule; each accepted window accounts for one stride of
    /// audio. Enrollment requires at least [`MIN_PROFILE_EMBEDDINGS`]
    /// embeddings and `min_total_seconds` of accepted audio.
    pub fn enroll(
        &self,
        name: &str,
        audio_sources: &[PathBuf],
        mode: EnrollMode,
        min_total_seconds: f64,
        extractor: &dyn EmbeddingExtractor,
    ) -> Result<Arc<VoiceProfile>> {
        let existing = self.load(name)?;
        if existing.is_some() && mode == EnrollMode::Create {
            bail!("profile '{name}' already exists; use overwrite or update");
        }

        let params = WindowParams::default();
        let mut embeddings: Vec<Vec<f32>> = Vec::new();
        let mut sources: Vec<String> = Vec::new();
        for source in audio_sources {
            let extracted = extractor
                .extract(source, &params)
                .map_err(|e| anyhow::anyhow!("embedding extraction failed: {e}"))?;
            if extracted.is_empty() {
                warn!("No usable audio in enrollment source {}", source.display());
                continue;
            }
            embeddings.extend(extracted);
            sources.push(source.to_string_lossy().into_owned());
        }

        let accepted_seconds = embeddings.len() as f64 * params.stride_secs as f64;
        let mut total_seconds = accepted_seconds;

        if mode == EnrollMode::Update {
            if let Some(previous) = &existing {
                let mut merged = previous.embeddings.clone();
                merged.extend(embeddings);
                embeddings = merged;
                total_seconds += previous.metadata.total_duration_seconds;
                let mut merged_sources = previous.audio_sources.clone();
                merged_sources.extend(sources);
                sources = merged_sources;
            }
        }

        if embeddings.len() < MIN_PROFILE_EMBEDDINGS {
            bail!(
                "enrollment for '{name}' produced {} embeddings, need at least {MIN_PROFILE_EMBEDDINGS}",
                embeddings.len()
            );
        }
        if accepted_seconds < min_total_seconds && mode != EnrollMode::Update {
            bail!(
                "enrollment for '{name}' accepted {accepted_seconds:.1}s of audio, need at least {min_total_seconds:.0}s"
            );
        }

        let model = "ecapa".to_string();
        let profile =
            VoiceProfile::from_embeddings(name, embeddings, total_seconds, model, sources);
        self.save(&profile)?;
        Ok(Arc::new(profile))
    }

    /// Cosine similarity of an embedding against a profile's centroid.
    pub fn similarity(&self, embedding: &[f32], profile: &VoiceProfile) -> f32 {
        cosine_similarity(embedding, &profile.centroid)
    }

    /// Maximum similarity against a deterministic subsample of raw profile
    /// embeddings (stride ⌈N/10⌉, at most 10 comparisons).
    pub fn similarity_to_embeddings(&self, embedding: &[f32], embeddings: &[Vec<f32>]) -> f32 {
        if embeddings.is_empty() {
            return 0.0;
        }
        let step = embeddings.len().div_ceil(MAX_COMPARISON_EMBEDDINGS).max(1);
        embeddings
            .iter()
            .step_by(step)
            .take(MAX_COMPARISON_EMBEDDINGS)
            .map(|candidate| cosine_similarity(embedding, candidate))
            .fold(f32::MIN, f32::max)
            .max(-1.0)
    }

    /// Load every enrolled profile, skipping unreadable documents.
    pub fn load_all(&self) -> Vec<Arc<VoiceProfile>> {
        self.list()
            .iter()
            .filter_map(|name| match self.load(name) {
                Ok(profile) => profile,
                Err(e) => {
                    warn!("Skipping unreadable profile {name}: {e}");
                    None
                }
            })
            .collect()
    }

    pub fn voices_dir(&self) -> &Path {
        &self.voices_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::wave;
    use crate::error::PipelineError;
    use crate::voice::profile::l2_normalize;

    /// Deterministic extractor: one fixed unit vector per full stride.
    struct FixedExtractor {
        vector: Vec<f32>,
        per_file: usize,
    }

    impl EmbeddingExtractor for FixedExtractor {
        fn embedding_dim(&self) -> usize {
            self.vector.len()
        }

        fn extract(
            &self,
            _audio_path: &Path,
            _params: &WindowParams,
        ) -> Result<Vec<Vec<f32>>, PipelineError> {
            Ok(vec![self.vector.clone(); self.per_file])
        }
    }

    fn fixed_extractor(per_file: usize) -> FixedExtractor {
        let mut vector = vec![0.4, 0.8, 0.2, 0.1];
        l2_normalize(&mut vector);
        FixedExtractor { vector, per_file }
    }

    fn write_tone(path: &Path) {
        let samples: Vec<f32> = (0..wave::SAMPLE_RATE * 2)
            .map(|i| (2.0 * std::f32::consts::PI * 180.0 * i as f32 / 16000.0).sin() * 0.5)
            .collect();
        wave::write_mono_16k(path, &samples).unwrap();
    }

    #[test]
    fn enroll_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("enroll.wav");
        write_tone(&audio);

        let store = VoiceProfileStore::new(dir.path().join("voices"));
        let extractor = fixed_extractor(25);

        let profile = store
            .enroll("Tester", &[audio], EnrollMode::Create, 30.0, &extractor)
            .unwrap();
        assert_eq!(profile.embeddings.len(), 25);

        // Fresh store bypasses the cache and reads the document back
        let reread = VoiceProfileStore::new(store.voices_dir());
        let loaded = reread.load("tester").unwrap().unwrap();
        assert_eq!(loaded.centroid, profile.centroid);
        assert_eq!(loaded.embeddings, profile.embeddings);
        assert!(reread.list().contains(&"tester".to_string()));
    }

    #[test]
    fn create_mode_refuses_existing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("enroll.wav");
        write_tone(&audio);

        let store = VoiceProfileStore::new(dir.path().join("voices"));
        let extractor = fixed_extractor(25);
        store
            .enroll("dup", &[audio.clone()], EnrollMode::Create, 30.0, &extractor)
            .unwrap();
        let err = store
            .enroll("dup", &[audio], EnrollMode::Create, 30.0, &extractor)
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn update_mode_appends_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("enroll.wav");
        write_tone(&audio);

        let store = VoiceProfileStore::new(dir.path().join("voices"));
        let extractor = fixed_extractor(25);
        store
            .enroll("upd", &[audio.clone()], EnrollMode::Create, 30.0, &extractor)
            .unwrap();
        let updated = store
            .enroll("upd", &[audio], EnrollMode::Update, 30.0, &extractor)
            .unwrap();
        assert_eq!(updated.embeddings.len(), 50);
    }

    #[test]
    fn enrollment_requires_minimum_audio() {
        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("short.wav");
        write_tone(&audio);

        let store = VoiceProfileStore::new(dir.path().join("voices"));
        let extractor = fixed_extractor(4); // 6 seconds accepted
        let err = store
            .enroll("short", &[audio], EnrollMode::Create, 30.0, &extractor)
            .unwrap_err();
        assert!(err.to_string().contains("accepted"));
    }

    #[test]
    fn similarity_subsample_is_deterministic_and_bounded() {
        let store = VoiceProfileStore::new("unused");
        let mut probe = vec![1.0, 0.0];
        l2_normalize(&mut probe);

        // 95 embeddings, only every ⌈95/10⌉ = 10th is compared
        let mut embeddings = vec![vec![0.0, 1.0]; 95];
        embeddings[0] = vec![1.0, 0.0];
        let max_sim = store.similarity_to_embeddings(&probe, &embeddings);
        assert!((max_sim - 1.0).abs() < 1e-6);

        // The best match hidden off-stride is invisible to the subsample
        let mut hidden = vec![vec![0.0, 1.0]; 95];
        hidden[5] = vec![1.0, 0.0];
        let max_sim = store.similarity_to_embeddings(&probe, &hidden);
        assert!(max_sim.abs() < 1e-6);
    }
}
