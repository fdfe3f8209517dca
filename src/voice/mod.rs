//! Voice artifacts and the registry of loaded voices.

mod metadata;
mod registry;

pub use metadata::{BOS, EOS, InferenceDefaults, PAD, Speaker, VoiceMetadata};
pub use registry::{Voice, VoiceDescriptor, VoiceLease, VoiceRegistry};
