//! Audio acquisition and sample-level processing

pub mod acquirer;
pub mod probe;
pub mod wave;

pub use acquirer::{AudioAcquirer, AudioArtifact, Transcoder};
pub use probe::{AccessibilityProbe, ProbeOutcome};
