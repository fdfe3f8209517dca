//! Neural inference engine contract.
//!
//! The scheduler only sees `synthesize(phoneme ids, params) -> PCM blocks`. Engines
//! that decode incrementally emit several blocks per call; single-shot engines
//! emit one block marked `last`.

mod silence;
#[cfg(feature = "onnx")]
mod synthesizer;

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::voice::VoiceMetadata;

pub use silence::SilenceEngine;
#[cfg(feature = "onnx")]
pub use synthesizer::PiperOnnxEngine;

/// Per-call inference parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SynthesisParams {
    pub length_scale: f32,
    pub noise_scale: f32,
    pub noise_w: f32,
    pub speaker_id: Option<u32>,
    /// Pitch multiplier; engines without pitch control ignore it.
    pub pitch: f32,
}

/// A block of mono PCM samples in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBlock {
    pub samples: Vec<f32>,
    /// Set on the final block of one `synthesize` call.
    pub last: bool,
}

/// A loaded, inference-ready voice model.
pub trait VoiceModel: Send + Sync {
    /// Number of input symbols the model accepts, if the engine can tell.
    fn symbol_count(&self) -> Option<usize> {
        None
    }

    /// Output sample rate reported by the model, if the engine can tell.
    fn sample_rate(&self) -> Option<u32> {
        None
    }

    /// Run inference on one phoneme-id sequence.
    ///
    /// Blocks are handed to `emit` in playback order. Returning `ControlFlow::Break`
    /// from `emit` asks the engine to stop early; that is not an error.
    ///
    /// # Errors
    /// Returns `Inference` if the model fails.
    fn synthesize(&self, phoneme_ids: &[i64], params: &SynthesisParams, emit: &mut dyn FnMut(PcmBlock) -> ControlFlow<()>) -> Result<()>;
}

/// Loads voice models from disk.
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Load a model into an inference-ready handle.
    ///
    /// # Errors
    /// Returns `VoiceLoad` if the model cannot be loaded.
    fn load(&self, voice_id: &str, model_path: &Path, metadata: &VoiceMetadata) -> Result<Arc<dyn VoiceModel>>;
}
