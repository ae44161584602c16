//! Speaker identification
//!
//! Maps diarizer clusters to enrolled profile names or the unknown
//! sentinel. Attribution requires both an absolute similarity threshold
//! (stricter for guests than for the primary) and a margin over the
//! second-best profile.

use crate::asr::types::SpeakerSegment;
use crate::audio::wave;
use crate::config::PipelineConfig;
use crate::diarize::DiarTurn;
use crate::error::PipelineError;
use crate::voice::embedder::{EmbeddingExtractor, WindowParams};
use crate::voice::profile::VoiceProfile;
use crate::voice::store::VoiceProfileStore;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns shorter than this never contribute to a cluster embedding.
const MIN_TURN_SECS: f64 = 0.5;

/// Stop collecting cluster audio once this much is gathered.
const TARGET_CLUSTER_SECS: f64 = 5.0;

/// Minimum collected audio for embedding a cluster at all.
const MIN_CLUSTER_SECS: f64 = 2.0;

/// At most this many turns feed one cluster embedding.
const MAX_CLUSTER_TURNS: usize = 5;

pub struct SpeakerIdentifier<'a> {
    config: &'a PipelineConfig,
    store: &'a VoiceProfileStore,
    extractor: &'a dyn EmbeddingExtractor,
}

impl<'a> SpeakerIdentifier<'a> {
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

    /// Attribute every diarizer turn to a profile or the unknown sentinel.
    pub fn identify(
        &self,
        audio_path: &Path,
        turns: &[DiarTurn],
        profiles: &[Arc<VoiceProfile>],
        scratch: &Path,
    ) -> Result<Vec<SpeakerSegment>, PipelineError> {
        if turns.is_empty() {
            return Ok(Vec::new());
        }
        if profiles.is_empty() {
            warn!("No voice profiles enrolled; skipping identification");
            return Ok(Vec::new());
        }

        let samples = wave::load_mono_16k(audio_path)
            .map_err(|e| PipelineError::identification(e.to_string()))?;

        let mut clusters: BTreeMap<usize, Vec<DiarTurn>> = BTreeMap::new();
        for turn in turns {
            clusters.entry(turn.cluster_id).or_default().push(*turn);
        }

        let mut segments = Vec::with_capacity(turns.len());
        for (cluster_id, cluster_turns) in clusters {
            let total: f64 = cluster_turns.iter().map(DiarTurn::duration).sum();

            if total < self.config.min_speaker_duration {
                debug!(
                    "Cluster {cluster_id} too short ({total:.1}s), labeling {}",
                    self.config.unknown_label
                );
                push_unknown(&mut segments, &cluster_turns, &self.config.unknown_label, cluster_id);
                continue;
            }

            let attribution = self.attribute_cluster(
                cluster_id,
                &cluster_turns,
                total,
                &samples,
                profiles,
                scratch,
            )?;

            let (speaker, confidence, margin) = match attribution {
                Some(result) => result,
                None => (self.config.unknown_label.clone(), 0.0, 0.0),
            };
            for turn in &cluster_turns {
                segments.push(SpeakerSegment {
                    start: turn.start,
                    end: turn.end,
                    speaker: speaker.clone(),
                    confidence,
                    margin,
                    cluster_id: Some(cluster_id),
                    is_overlap: false,
                });
            }
        }

        segments.sort_by(|a, b| a.start.partial_cmp(&b.start).unwrap_or(std::cmp::Ordering::Equal));
        Ok(segments)
    }

    /// Embed one cluster and gate it against every profile.
    fn attribute_cluster(
        &self,
        cluster_id: usize,
        cluster_turns: &[DiarTurn],
        total: f64,
        samples: &[f32],
        profiles: &[Arc<VoiceProfile>],
        scratch: &Path,
    ) -> Result<Option<(String, f32, f32)>, PipelineError> {
        let Some(embedding) = self.cluster_embedding(cluster_id, cluster_turns, samples, scratch)?
        else {
            return Ok(None);
        };

        let duration_bonus = if total >= 10.0 {
            1.05
        } else if total >= 5.0 {
            1.02
        } else {
            1.0
        };

        let mut sims: Vec<(usize, f32)> = profiles
            .iter()
            .enumerate()
            .map(|(idx, profile)| (idx, self.store.similarity(&embedding, profile)))
            .collect();
        sims.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let (best_idx, best_raw) = sims[0];
        let best_profile = &profiles[best_idx];
        let boosted = best_raw * duration_bonus;
        let margin = if sims.len() > 1 {
            best_raw - sims[1].1
        } else {
            best_raw
        };

        let threshold = self.config.threshold_for(&best_profile.name);
        debug!(
            "Cluster {cluster_id}: best={} raw={best_raw:.3} boosted={boosted:.3} \
             threshold={threshold:.3} margin={margin:.3}",
            best_profile.name
        );

        if boosted >= threshold && margin >= self.config.attr_margin {
            info!(
                "Cluster {cluster_id} -> {} (conf={:.3}, margin={margin:.3})",
                best_profile.name,
                best_raw.clamp(0.0, 1.0)
            );
            Ok(Some((
                best_profile.name.clone(),
                best_raw.clamp(0.0, 1.0),
                margin,
            )))
        } else {
            info!(
                "Cluster {cluster_id} -> {} (best {} at {best_raw:.3} failed the gate)",
                self.config.unknown_label, best_profile.name
            );
            Ok(None)
        }
    }

    /// Concatenate representative turns into a scratch file and average
    /// the window embeddings.
    fn cluster_embedding(
        &self,
        cluster_id: usize,
        cluster_turns: &[DiarTurn],
        samples: &[f32],
        scratch: &Path,
    ) -> Result<Option<Vec<f32>>, PipelineError> {
        let mut combined: Vec<f32> = Vec::new();
        let mut collected = 0.0f64;
        let mut used = 0usize;

        for turn in cluster_turns {
            if used >= MAX_CLUSTER_TURNS {
                break;
            }
            if turn.duration() < MIN_TURN_SECS {
                continue;
            }
            let lo = (turn.start * wave::SAMPLE_RATE as f64) as usize;
            let hi = ((turn.end * wave::SAMPLE_RATE as f64) as usize).min(samples.len());
            if hi <= lo {
                continue;
            }
            combined.extend_from_slice(&samples[lo..hi]);
            collected += turn.duration();
            used += 1;
            if collected >= TARGET_CLUSTER_SECS {
                break;
            }
        }

        if collected < MIN_CLUSTER_SECS {
            debug!("Cluster {cluster_id}: only {collected:.1}s of usable audio");
            return Ok(None);
        }

        let scratch_wav = scratch.join(format!("cluster_{cluster_id}.wav"));
        wave::write_mono_16k(&scratch_wav, &combined)
            .map_err(|e| PipelineError::identification(e.to_string()))?;
        let embeddings = self
            .extractor
            .extract(&scratch_wav, &WindowParams::default());
        let _ = std::fs::remove_file(&scratch_wav);
        let embeddings = embeddings?;

        if embeddings.is_empty() {
            debug!("Cluster {cluster_id}: no embeddings extracted");
            return Ok(None);
        }

        let dim = embeddings[0].len();
        let mut mean = vec![0.0f32; dim];
        for embedding in &embeddings {
            for (acc, value) in mean.iter_mut().zip(embedding.iter()) {
                *acc += value;
            }
        }
        for value in mean.iter_mut() {
            *value /= embeddings.len() as f32;
        }
        Ok(Some(mean))
    }
}

fn push_unknown(
    segments: &mut Vec<SpeakerSegment>,
    cluster_turns: &[DiarTurn],
    unknown_label: &str,
    cluster_id: usize,
) {
    for turn in cluster_turns {
        segments.push(SpeakerSegment {
            start: turn.start,
            end: turn.end,
            speaker: unknown_label.to_string(),
            confidence: 0.0,
            margin: 0.0,
            cluster_id: Some(cluster_id),
            is_overlap: false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::profile::l2_normalize;

    /// Extractor that answers with a fixed vector, letting tests choose
    /// cluster/profile geometry exactly.
    struct FixedExtractor {
        vector: Vec<f32>,
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
            Ok(vec![self.vector.clone()])
        }
    }

    fn unit(v: Vec<f32>) -> Vec<f32> {
        let mut v = v;
        l2_normalize(&mut v);
        v
    }

    fn profile(name: &str, direction: Vec<f32>) -> Arc<VoiceProfile> {
        let base = unit(direction);
        Arc::new(VoiceProfile::from_embeddings(
            name,
            vec![base.clone(), base.clone(), base],
            9.0,
            "ecapa",
            vec![],
        ))
    }

    fn write_audio(dir: &Path, secs: f32) -> std::path::PathBuf {
        let path = dir.join("audio.wav");
        let samples: Vec<f32> = (0..(secs * wave::SAMPLE_RATE as f32) as usize)
            .map(|i| (2.0 * std::f32::consts::PI * 200.0 * i as f32 / 16000.0).sin() * 0.5)
            .collect();
        wave::write_mono_16k(&path, &samples).unwrap();
        path
    }

    #[test]
    fn short_cluster_is_unknown_with_zero_confidence() {
        let dir = tempfile::tempdir().unwrap();
        let audio = write_audio(dir.path(), 10.0);
        let config = PipelineConfig::default();
        let store = VoiceProfileStore::new(dir.path().join("voices"));
        let extractor = FixedExtractor {
            vector: unit(vec![1.0, 0.0, 0.0]),
        };
        let identifier = SpeakerIdentifier::new(&config, &store, &extractor);

        let turns = vec![DiarTurn { start: 0.0, end: 1.0, cluster_id: 0 }];
        let profiles = vec![profile("Chaffee", vec![1.0, 0.0, 0.0])];
        let segments = identifier
            .identify(&audio, &turns, &profiles, dir.path())
            .unwrap();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker, "Unknown");
        assert_eq!(segments[0].confidence, 0.0);
        assert_eq!(segments[0].margin, 0.0);
    }

    #[test]
    fn matching_cluster_attributes_to_primary() {
        let dir = tempfile::tempdir().unwrap();
        let audio = write_audio(dir.path(), 15.0);
        let config = PipelineConfig::default();
        let store = VoiceProfileStore::new(dir.path().join("voices"));
        let extractor = FixedExtractor {
            vector: unit(vec![1.0, 0.05, 0.0]),
        };
        let identifier = SpeakerIdentifier::new(&config, &store, &extractor);

        let turns = vec![
            DiarTurn { start: 0.0, end: 6.0, cluster_id: 0 },
            DiarTurn { start: 6.5, end: 12.0, cluster_id: 0 },
        ];
        let profiles = vec![
            profile("Chaffee", vec![1.0, 0.0, 0.0]),
            profile("Guest", vec![0.0, 1.0, 0.0]),
        ];
        let segments = identifier
            .identify(&audio, &turns, &profiles, dir.path())
            .unwrap();

        assert_eq!(segments.len(), 2);
        for segment in &segments {
            assert_eq!(segment.speaker, "Chaffee");
            // The gate held: raw similarity at/above the primary threshold
            assert!(segment.confidence >= config.primary_min_sim);
            assert!(segment.margin >= config.attr_margin);
            assert_eq!(segment.cluster_id, Some(0));
        }
    }

    #[test]
    fn unenrolled_voice_falls_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let audio = write_audio(dir.path(), 15.0);
        let config = PipelineConfig::default();
        let store = VoiceProfileStore::new(dir.path().join("voices"));
        // Orthogonal to every profile
        let extractor = FixedExtractor {
            vector: unit(vec![0.0, 0.0, 1.0]),
        };
        let identifier = SpeakerIdentifier::new(&config, &store, &extractor);

        let turns = vec![DiarTurn { start: 0.0, end: 12.0, cluster_id: 0 }];
        let profiles = vec![
            profile("Chaffee", vec![1.0, 0.0, 0.0]),
            profile("Guest", vec![0.0, 1.0, 0.0]),
        ];
        let segments = identifier
            .identify(&audio, &turns, &profiles, dir.path())
            .unwrap();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speaker, "Unknown");
    }

    #[test]
    fn single_profile_margin_is_the_raw_similarity() {
        let dir = tempfile::tempdir().unwrap();
        let audio = write_audio(dir.path(), 15.0);
        let config = PipelineConfig::default();
        let store = VoiceProfileStore::new(dir.path().join("voices"));
        let direction = unit(vec![1.0, 0.0, 0.0]);
        let extractor = FixedExtractor {
            vector: direction.clone(),
        };
        let identifier = SpeakerIdentifier::new(&config, &store, &extractor);

        let turns = vec![DiarTurn { start: 0.0, end: 12.0, cluster_id: 0 }];
        let profiles = vec![profile("Chaffee", vec![1.0, 0.0, 0.0])];
        let segments = identifier
            .identify(&audio, &turns, &profiles, dir.path())
            .unwrap();

        assert_eq!(segments[0].speaker, "Chaffee");
        assert!((segments[0].margin - segments[0].confidence).abs() < 1e-6);
    }

    #[test]
    fn empty_turns_identify_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let audio = write_audio(dir.path(), 2.0);
        let config = PipelineConfig::default();
        let store = VoiceProfileStore::new(dir.path().join("voices"));
        let extractor = FixedExtractor {
            vector: unit(vec![1.0, 0.0]),
        };
        let identifier = SpeakerIdentifier::new(&config, &store, &extractor);
        let profiles = vec![profile("Chaffee", vec![1.0, 0.0])];

        let segments = identifier
            .identify(&audio, &[], &profiles, dir.path())
            .unwrap();
        assert!(segments.is_empty());
    }
}
