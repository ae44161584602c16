//! Voice enrollment, profiles, and speaker embeddings

pub mod embedder;
pub mod mel;
pub mod profile;
pub mod store;

pub use embedder::{EmbeddingExtractor, OnnxSpeakerEmbedder, WindowParams};
pub use profile::VoiceProfile;
pub use store::{EnrollMode, VoiceProfileStore};
