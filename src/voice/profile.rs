//! Voice profiles
//!
//! A profile is the persisted identity of one enrolled speaker: the raw
//! embeddings gathered at enrollment, their unit centroid, and a
//! per-profile recommended similarity threshold derived from the spread of
//! self-similarities.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lower and upper bounds for the derived similarity threshold.
pub const THRESHOLD_FLOOR: f32 = 0.75;
pub const THRESHOLD_CEIL: f32 = 0.95;

/// Minimum number of embeddings a usable profile must carry.
pub const MIN_PROFILE_EMBEDDINGS: usize = 3;

/// Required metadata carried by every profile document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub num_embeddings: usize,
    pub total_duration_seconds: f64,
    pub embedding_dim: usize,
    pub model: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Persisted per-speaker voice profile. Shared read-only across workers
/// once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub name: String,

    /// Unit-normalized mean of `embeddings`. Legacy documents may omit it;
    /// [`VoiceProfile::normalize`] restores the invariant at load.
    #[serde(default)]
    pub centroid: Vec<f32>,

    pub embeddings: Vec<Vec<f32>>,

    #[serde(default)]
    pub recommended_threshold: f32,

    pub created_at: String,

    #[serde(default)]
    pub audio_sources: Vec<String>,

    pub metadata: ProfileMetadata,
}

impl VoiceProfile {
    /// Build a fresh profile from enrollment embeddings.
    pub fn from_embeddings(
        name: impl Into<String>,
        embeddings: Vec<Vec<f32>>,
        total_duration_seconds: f64,
        model: impl Into<String>,
        audio_sources: Vec<String>,
    ) -> Self {
        let embedding_dim = embeddings.first().map(|e| e.len()).unwrap_or(0);
        let centroid = centroid_of(&embeddings);
        let recommended_threshold = derive_threshold(&embeddings, &centroid);
        Self {
            name: name.into(),
            centroid,
            recommended_threshold,
            created_at: Utc::now().to_rfc3339(),
            audio_sources,
            metadata: ProfileMetadata {
                num_embeddings: embeddings.len(),
                total_duration_seconds,
                embedding_dim,
                model: model.into(),
                extra: serde_json::Map::new(),
            },
            embeddings,
        }
    }

    /// Restore invariants on a loaded document: legacy list-only profiles
    /// get a computed centroid and a re-derived threshold.
    pub fn normalize(&mut self) {
        for embedding in &mut self.embeddings {
            l2_normalize(embedding);
        }
        if self.centroid.is_empty() && !self.embeddings.is_empty() {
            self.centroid = centroid_of(&self.embeddings);
        } else {
            l2_normalize(&mut self.centroid);
        }
        if !(THRESHOLD_FLOOR..=THRESHOLD_CEIL).contains(&self.recommended_threshold) {
            self.recommended_threshold = derive_threshold(&self.embeddings, &self.centroid);
        }
        self.metadata.num_embeddings = self.embeddings.len();
        if self.metadata.embedding_dim == 0 {
            self.metadata.embedding_dim = self.centroid.len();
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.centroid.len()
    }
}

/// Scale a vector to unit L2 norm in place. Zero vectors are left alone.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in vector.iter_mut() {
            *value /= norm;
        }
    }
}

/// Cosine similarity as a native float. Mismatched or zero vectors
/// compare as 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Unit-normalized mean of a set of embeddings.
pub fn centroid_of(embeddings: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = embeddings.first() else {
        return Vec::new();
    };
    let dim = first.len();
    let mut centroid = vec![0.0f32; dim];
    for embedding in embeddings {
        for (acc, value) in centroid.iter_mut().zip(embedding.iter()) {
            *acc += value;
        }
    }
    for value in centroid.iter_mut() {
        *value /= embeddings.len() as f32;
    }
    l2_normalize(&mut centroid);
    centroid
}

/// Recommended threshold: mean self-similarity minus two standard
/// deviations, clamped to the documented band.
pub fn derive_threshold(embeddings: &[Vec<f32>], centroid: &[f32]) -> f32 {
    if embeddings.is_empty() || centroid.is_empty() {
        return THRESHOLD_FLOOR;
    }
    let sims: Vec<f32> = embeddings
        .iter()
        .map(|e| cosine_similarity(e, centroid))
        .collect();
    let mean = sims.iter().sum::<f32>() / sims.len() as f32;
    let variance = sims.iter().map(|s| (s - mean).powi(2)).sum::<f32>() / sims.len() as f32;
    (mean - 2.0 * variance.sqrt()).clamp(THRESHOLD_FLOOR, THRESHOLD_CEIL)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let mut v = v;
        l2_normalize(&mut v);
        v
    }

    #[test]
    fn cosine_similarity_of_identical_vectors_is_one() {
        let v = unit(vec![0.3, -0.2, 0.9, 0.1]);
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_of_orthogonal_vectors_is_zero() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn centroid_is_unit_norm() {
        let embeddings = vec![
            unit(vec![1.0, 0.2, 0.0]),
            unit(vec![0.9, 0.1, 0.1]),
            unit(vec![1.0, 0.0, 0.2]),
        ];
        let centroid = centroid_of(&embeddings);
        let norm: f32 = centroid.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn derived_threshold_stays_in_band() {
        let tight = vec![unit(vec![1.0, 0.01]), unit(vec![1.0, -0.01]), unit(vec![1.0, 0.0])];
        let centroid = centroid_of(&tight);
        let threshold = derive_threshold(&tight, &centroid);
        assert!((THRESHOLD_FLOOR..=THRESHOLD_CEIL).contains(&threshold));

        // Highly scattered embeddings clamp to the floor
        let scattered = vec![
            unit(vec![1.0, 0.0, 0.0]),
            unit(vec![0.0, 1.0, 0.0]),
            unit(vec![0.0, 0.0, 1.0]),
        ];
        let centroid = centroid_of(&scattered);
        assert_eq!(derive_threshold(&scattered, &centroid), THRESHOLD_FLOOR);
    }

    #[test]
    fn legacy_profile_gains_centroid_on_normalize() {
        let embeddings = vec![
            unit(vec![0.5, 0.5, 0.1]),
            unit(vec![0.6, 0.4, 0.0]),
            unit(vec![0.5, 0.6, 0.05]),
        ];
        let json = serde_json::json!({
            "name": "legacy",
            "embeddings": embeddings,
            "created_at": "2025-01-01T00:00:00Z",
            "metadata": {
                "num_embeddings": 3,
                "total_duration_seconds": 12.0,
                "embedding_dim": 0,
                "model": "ecapa"
            }
        });
        let mut profile: VoiceProfile = serde_json::from_value(json).unwrap();
        assert!(profile.centroid.is_empty());

        profile.normalize();
        assert_eq!(profile.centroid.len(), 3);
        assert!(
            (THRESHOLD_FLOOR..=THRESHOLD_CEIL).contains(&profile.recommended_threshold)
        );
        assert_eq!(profile.metadata.embedding_dim, 3);
    }

    #[test]
    fn profile_round_trip_preserves_centroid_and_embeddings() {
        let embeddings = vec![
            unit(vec![0.2, 0.9, 0.1]),
            unit(vec![0.25, 0.85, 0.12]),
            unit(vec![0.22, 0.88, 0.08]),
        ];
        let profile = VoiceProfile::from_embeddings("tester", embeddings, 9.0, "ecapa", vec![]);

        let json = serde_json::to_string(&profile).unwrap();
        let reloaded: VoiceProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile.centroid, reloaded.centroid);
        assert_eq!(profile.embeddings, reloaded.embeddings);
        assert_eq!(profile.recommended_threshold, reloaded.recommended_threshold);
    }
}
