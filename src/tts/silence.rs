//! Model-free engine that renders silence.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use super::{InferenceEngine, PcmBlock, SynthesisParams, VoiceModel};
use crate::error::Result;
use crate::voice::VoiceMetadata;

/// Renders silence whose length follows the input and the length scale.
///
/// Lets hosts and sinks be exercised end to end without an ONNX runtime.
pub struct SilenceEngine {
    samples_per_id: usize,
    block_size: usize,
}

impl SilenceEngine {
    /// # Arguments
    /// * `samples_per_id` - Samples rendered per phoneme id at length scale 1.0
    /// * `block_size` - Maximum samples per emitted block (0 = single block)
    pub fn new(samples_per_id: usize, block_size: usize) -> Self {
        Self { samples_per_id, block_size }
    }
}

impl Default for SilenceEngine {
    fn default() -> Self {
        Self::new(256, 0)
    }
}

impl InferenceEngine for SilenceEngine {
    fn name(&self) -> &'static str {
        "silence"
    }

    fn load(&self, _voice_id: &str, _model_path: &Path, metadata: &VoiceMetadata) -> Result<Arc<dyn VoiceModel>> {
        Ok(Arc::new(SilenceModel { samples_per_id: self.samples_per_id, block_size: self.block_size, sample_rate: metadata.audio.sample_rate }))
    }
}

struct SilenceModel {
    samples_per_id: usize,
    block_size: usize,
    sample_rate: u32,
}

impl VoiceModel for SilenceModel {
    fn sample_rate(&self) -> Option<u32> {
        Some(self.sample_rate)
    }

    fn synthesize(&self, phoneme_ids: &[i64], params: &SynthesisParams, emit: &mut dyn FnMut(PcmBlock) -> ControlFlow<()>) -> Result<()> {
        let total = (phoneme_ids.len() as f32 * self.samples_per_id as f32 * params.length_scale).round() as usize;
        let block_size = if self.block_size == 0 { total.max(1) } else { self.block_size };

        let mut remaining = total;
        loop {
            let len = remaining.min(block_size);
            remaining -= len;
            if emit(PcmBlock { samples: vec![0.0; len], last: remaining == 0 }).is_break() || remaining == 0 {
                return Ok(());
            }
        }
    }
}
