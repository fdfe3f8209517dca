//! Piper VITS inference through ONNX Runtime.

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use ndarray::Array;
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{InferenceEngine, PcmBlock, SynthesisParams, VoiceModel};
use crate::error::{Result, SynthError};
use crate::voice::VoiceMetadata;

/// Peak floor used when normalizing quiet output.
const MIN_PEAK: f32 = 0.01;

/// Engine that loads Piper `.onnx` voices.
pub struct PiperOnnxEngine {
    threads: usize,
}

impl PiperOnnxEngine {
    /// Create an engine using `threads` intra-op threads per session.
    pub fn new(threads: usize) -> Self {
        Self { threads: threads.max(1) }
    }
}

impl InferenceEngine for PiperOnnxEngine {
    fn name(&self) -> &'static str {
        "piper-onnx"
    }

    fn load(&self, voice_id: &str, model_path: &Path, metadata: &VoiceMetadata) -> Result<Arc<dyn VoiceModel>> {
        let start = Instant::now();
        let err = |stage: &str, e: String| SynthError::voice_load(voice_id, format!("{}: {}", stage, e));

        if let Err(e) = ort::init().commit() {
            debug!("ONNX runtime environment not committed, using the existing one: {}", e);
        }

        let builder = Session::builder()
            .map_err(|e| err("session builder", e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| err("optimization level", e.to_string()))?
            .with_intra_threads(self.threads)
            .map_err(|e| err("thread count", e.to_string()))?;

        #[cfg(feature = "cuda")]
        let builder = builder.with_execution_providers([ort::ep::CUDA::default().build()]).map_err(|e| err("cuda provider", e.to_string()))?;

        let session = builder.commit_from_file(model_path).map_err(|e| err("model", e.to_string()))?;

        info!("🗣️  Loaded voice '{}' in {:?} ({} threads)", voice_id, start.elapsed(), self.threads);

        Ok(Arc::new(PiperModel { session: Mutex::new(session), multi_speaker: metadata.num_speakers > 1 }))
    }
}

struct PiperModel {
    session: Mutex<Session>,
    multi_speaker: bool,
}

impl VoiceModel for PiperModel {
    fn synthesize(&self, phoneme_ids: &[i64], params: &SynthesisParams, emit: &mut dyn FnMut(PcmBlock) -> ControlFlow<()>) -> Result<()> {
        if phoneme_ids.is_empty() {
            let _ = emit(PcmBlock { samples: Vec::new(), last: true });
            return Ok(());
        }

        let start = Instant::now();
        let inference = |e: String| SynthError::Inference(e);

        let input = Array::from_shape_vec((1, phoneme_ids.len()), phoneme_ids.to_vec()).map_err(|e| inference(e.to_string()))?;
        let lengths = Array::from_shape_vec((1,), vec![phoneme_ids.len() as i64]).map_err(|e| inference(e.to_string()))?;
        let scales = Array::from_shape_vec((3,), vec![params.noise_scale, params.length_scale, params.noise_w]).map_err(|e| inference(e.to_string()))?;

        let input = Tensor::from_array(input).map_err(|e| inference(e.to_string()))?;
        let lengths = Tensor::from_array(lengths).map_err(|e| inference(e.to_string()))?;
        let scales = Tensor::from_array(scales).map_err(|e| inference(e.to_string()))?;

        let samples = {
            let mut session = self.session.lock();
            let run = if self.multi_speaker {
                let sid = Array::from_shape_vec((1,), vec![i64::from(params.speaker_id.unwrap_or(0))]).map_err(|e| inference(e.to_string()))?;
                let sid = Tensor::from_array(sid).map_err(|e| inference(e.to_string()))?;
                session.run(ort::inputs!["input" => input, "input_lengths" => lengths, "scales" => scales, "sid" => sid])
            } else {
                session.run(ort::inputs!["input" => input, "input_lengths" => lengths, "scales" => scales])
            };
            let outputs = run.map_err(|e| inference(e.to_string()))?;

            let (_, audio) = outputs["output"].try_extract_tensor::<f32>().map_err(|e| inference(e.to_string()))?;
            normalize_peak(audio)
        };

        debug!(phonemes = phoneme_ids.len(), samples = samples.len(), elapsed_ms = start.elapsed().as_millis() as u64, "Piper inference finished");

        let _ = emit(PcmBlock { samples, last: true });
        Ok(())
    }
}

/// Scale audio so its peak sits at full scale, as Piper does before int16 conversion.
fn normalize_peak(audio: &[f32]) -> Vec<f32> {
    let peak = audio.iter().fold(0.0f32, |acc, s| acc.max(s.abs())).max(MIN_PEAK);
    audio.iter().map(|s| (s / peak).clamp(-1.0, 1.0)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_peak_scales_to_full_range() {
        let out = normalize_peak(&[0.25, -0.5, 0.1]);
        assert_eq!(out, vec![0.5, -1.0, 0.2]);
    }

    #[test]
    fn test_normalize_peak_keeps_silence_quiet() {
        let out = normalize_peak(&[0.0, 0.001]);
        assert!(out.iter().all(|s| s.abs() <= 0.1));
    }
}
