//! Per-utterance preprocessing from text to phonemes.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::utterance::Utterance;
use crate::error::{Result, SynthError};
use crate::text::{PhonemeSequence, ResourceManager, phonemize, tokenize};
use crate::tts::SynthesisParams;
use crate::voice::Voice;

/// Runs normalization, the linguistic stages and phonemization in a fixed order.
#[derive(Clone)]
pub struct SynthesisPipeline {
    resources: Arc<ResourceManager>,
}

fn check(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() { Err(SynthError::Cancelled) } else { Ok(()) }
}

impl SynthesisPipeline {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    /// Turn `text` into phonemes for `voice`.
    ///
    /// `cancel` is checked after every stage.
    ///
    /// # Errors
    /// Returns `Cancelled` if the token fires, or `UnsupportedGrapheme` if the voice
    /// cannot express even its fallback symbol.
    pub fn prepare(&self, text: &str, voice: &Voice, cancel: &CancellationToken) -> Result<PhonemeSequence> {
        let start = Instant::now();
        let resources = self.resources.snapshot();
        let language = voice.language_code();

        let mut tokens = tokenize(text, &language);
        check(cancel)?;

        for stage in resources.stages_for(&language) {
            tokens = stage.process(tokens);
            check(cancel)?;
        }

        let phonemes = phonemize(&tokens, voice.metadata())?;
        check(cancel)?;

        debug!(
            voice = voice.id(),
            tokens = tokens.len(),
            phonemes = phonemes.len(),
            degraded = phonemes.degraded_tokens(),
            elapsed_us = start.elapsed().as_micros() as u64,
            "Preprocessed: {}",
            phonemes.to_symbol_string()
        );

        Ok(phonemes)
    }

    /// Inference parameters for an utterance on a voice.
    pub fn params(voice: &Voice, utterance: &Utterance) -> SynthesisParams {
        let defaults = voice.inference_defaults();
        let speakers = voice.metadata().num_speakers;
        SynthesisParams {
            length_scale: defaults.length_scale / utterance.prosody.rate,
            noise_scale: defaults.noise_scale,
            noise_w: defaults.noise_w,
            speaker_id: utterance.speaker.filter(|id| speakers > 1 && *id < speakers),
            pitch: utterance.prosody.pitch,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::synth::{Prosody, SpeakRequest, UtteranceId};
    use crate::text::{EzafeModel, GrammaticalMarkerInserter, HomographDictionary, HomographResolver, LinguisticResources, ResourcePaths};
    use crate::tts::SilenceEngine;
    use crate::voice::{VoiceDescriptor, VoiceRegistry};

    const PERSIAN_VOICE: &str = r#"{
        "audio": {"sample_rate": 22050},
        "espeak": {"voice": "fa"},
        "num_speakers": 2,
        "inference": {"noise_scale": 0.5, "length_scale": 1.2, "noise_w": 0.7},
        "phoneme_id_map": {
            "_": [0], "^": [1], "$": [2], " ": [3], ".": [4],
            "a": [5], "e": [6], "i": [7], "o": [8], "u": [9], "ɒ": [10],
            "b": [11], "k": [12], "t": [13], "m": [14], "n": [15], "ʃ": [16], "ɾ": [17], "j": [18]
        }
    }"#;

    fn voice(dir: &Path) -> Arc<Voice> {
        let model_path = dir.join("fa_IR-test.onnx");
        std::fs::write(&model_path, b"onnx").unwrap();
        std::fs::write(dir.join("fa_IR-test.onnx.json"), PERSIAN_VOICE).unwrap();
        let registry = VoiceRegistry::new(Arc::new(SilenceEngine::default()));
        registry.register(&VoiceDescriptor::from_model_path(&model_path).unwrap()).unwrap()
    }

    fn pipeline(persian: bool) -> SynthesisPipeline {
        let homographs = HomographResolver::from_dictionary(HomographDictionary::from_json(r#"{"شیر": [{"pronunciation": "ʃiɾ"}]}"#).unwrap());
        let ezafe = GrammaticalMarkerInserter::from_model(EzafeModel::from_json(r#"{"weights": {"w=کتاب": 1.0}}"#).unwrap());
        let resources = LinguisticResources::new(homographs, ezafe, persian);
        SynthesisPipeline::new(Arc::new(ResourceManager::with_resources(ResourcePaths::default(), resources)))
    }

    fn symbols(seq: &PhonemeSequence) -> String {
        seq.to_symbol_string()
    }

    #[test]
    fn test_stages_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let voice = voice(dir.path());
        let seq = pipeline(true).prepare("کتاب شیر.", &voice, &CancellationToken::new()).unwrap();
        assert_eq!(symbols(&seq), "ktɒbe ʃiɾ.");
    }

    #[test]
    fn test_persian_stages_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let voice = voice(dir.path());
        let seq = pipeline(false).prepare("کتاب شیر.", &voice, &CancellationToken::new()).unwrap();
        // Rule-based: ش -> ʃ, ی -> i, ر -> ɾ; no Ezafe.
        assert_eq!(symbols(&seq), "ktɒb ʃiɾ.");
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let voice = voice(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(pipeline(true).prepare("کتاب", &voice, &cancel), Err(SynthError::Cancelled)));
    }

    #[test]
    fn test_prepare_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let voice = voice(dir.path());
        let pipeline = pipeline(true);
        let text = "کتاب من را به او بده، شیر بخور.";
        let first = pipeline.prepare(text, &voice, &CancellationToken::new()).unwrap();
        let second = pipeline.prepare(text, &voice, &CancellationToken::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_params_scale_length_and_validate_speaker() {
        let dir = tempfile::tempdir().unwrap();
        let voice = voice(dir.path());

        let request = SpeakRequest::new("x", "fa_IR-test").with_prosody(Prosody { rate: 2.0, pitch: 1.0, volume: 1.0 }).with_speaker(Some(1));
        let params = SynthesisPipeline::params(&voice, &Utterance::new(UtteranceId(1), request));
        assert!((params.length_scale - 0.6).abs() < 1e-6);
        assert_eq!(params.noise_scale, 0.5);
        assert_eq!(params.speaker_id, Some(1));

        let request = SpeakRequest::new("x", "fa_IR-test").with_speaker(Some(9));
        let params = SynthesisPipeline::params(&voice, &Utterance::new(UtteranceId(2), request));
        assert_eq!(params.speaker_id, None);
    }
}
