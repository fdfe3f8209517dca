//! Piper voice metadata (`<voice>.onnx.json`).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SynthError};

/// Padding symbol inserted between phonemes.
pub const PAD: &str = "_";
/// Beginning-of-sentence symbol.
pub const BOS: &str = "^";
/// End-of-sentence symbol.
pub const EOS: &str = "$";

const DEFAULT_SAMPLE_RATE: u32 = 22050;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSection {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default)]
    pub quality: Option<String>,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self { sample_rate: DEFAULT_SAMPLE_RATE, quality: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EspeakSection {
    pub voice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageSection {
    pub code: String,
}

/// Inference scales the voice was trained with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceDefaults {
    #[serde(default = "default_noise_scale")]
    pub noise_scale: f32,
    #[serde(default = "default_length_scale")]
    pub length_scale: f32,
    #[serde(default = "default_noise_w")]
    pub noise_w: f32,
}

impl Default for InferenceDefaults {
    fn default() -> Self {
        Self { noise_scale: default_noise_scale(), length_scale: default_length_scale(), noise_w: default_noise_w() }
    }
}

/// A selectable speaker of a multi-speaker voice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Speaker {
    pub id: u32,
    pub name: String,
}

/// Parsed contents of a Piper voice config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceMetadata {
    #[serde(default)]
    pub audio: AudioSection,
    #[serde(default)]
    pub espeak: Option<EspeakSection>,
    #[serde(default)]
    pub language: Option<LanguageSection>,
    #[serde(default)]
    pub inference: InferenceDefaults,
    pub phoneme_id_map: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    pub num_symbols: Option<usize>,
    #[serde(default = "default_num_speakers")]
    pub num_speakers: u32,
    #[serde(default)]
    pub speaker_id_map: BTreeMap<String, u32>,
    #[serde(default)]
    pub fallback_phoneme: Option<String>,
}

impl VoiceMetadata {
    /// Read and parse a metadata file.
    ///
    /// # Errors
    /// Returns `VoiceLoad` if the file cannot be read or is not valid voice metadata.
    pub fn from_file(voice_id: &str, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SynthError::voice_load(voice_id, format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&content).map_err(|e| SynthError::voice_load(voice_id, format!("invalid metadata {}: {}", path.display(), e)))
    }

    /// BCP-47-ish language tag, e.g. `fa` or `en-us`.
    pub fn language_tag(&self) -> String {
        if let Some(ref language) = self.language {
            return language.code.replace('_', "-");
        }
        self.espeak.as_ref().map(|e| e.voice.clone()).unwrap_or_else(|| "und".to_string())
    }

    /// Primary language subtag in lowercase (`fa` for `fa-IR`).
    pub fn language_code(&self) -> String {
        let tag = self.language_tag();
        tag.split(['-', '_']).next().unwrap_or_default().to_lowercase()
    }

    /// Symbol substituted for tokens the voice cannot pronounce.
    pub fn fallback_phoneme(&self) -> &str {
        self.fallback_phoneme.as_deref().unwrap_or(PAD)
    }

    /// Speakers exposed as selectable variants.
    ///
    /// Named speakers come from `speaker_id_map`; otherwise multi-speaker voices get
    /// numbered entries. Single-speaker voices have none.
    pub fn speakers(&self) -> Vec<Speaker> {
        if !self.speaker_id_map.is_empty() {
            let mut speakers: Vec<Speaker> = self.speaker_id_map.iter().map(|(name, id)| Speaker { id: *id, name: name.clone() }).collect();
            speakers.sort_by_key(|s| s.id);
            return speakers;
        }
        if self.num_speakers > 1 {
            return (0..self.num_speakers).map(|id| Speaker { id, name: format!("speaker {}", id) }).collect();
        }
        Vec::new()
    }

    /// Largest model input id referenced by the phoneme map.
    pub fn max_symbol_id(&self) -> Option<i64> {
        self.phoneme_id_map.values().flatten().copied().max()
    }

    /// Check that the metadata is internally consistent.
    ///
    /// # Errors
    /// Returns `VoiceLoad` describing the first inconsistency found.
    pub fn validate(&self, voice_id: &str) -> Result<()> {
        if self.audio.sample_rate == 0 {
            return Err(SynthError::voice_load(voice_id, "sample rate must be positive"));
        }
        for symbol in [PAD, BOS, EOS] {
            if !self.phoneme_id_map.contains_key(symbol) {
                return Err(SynthError::voice_load(voice_id, format!("phoneme map lacks control symbol '{}'", symbol)));
            }
        }
        if let Some((phoneme, _)) = self.phoneme_id_map.iter().find(|(_, ids)| ids.is_empty() || ids.iter().any(|id| *id < 0)) {
            return Err(SynthError::voice_load(voice_id, format!("phoneme '{}' has no valid ids", phoneme)));
        }
        if let (Some(num_symbols), Some(max_id)) = (self.num_symbols, self.max_symbol_id())
            && max_id as usize >= num_symbols
        {
            return Err(SynthError::voice_load(voice_id, format!("phoneme id {} exceeds num_symbols {}", max_id, num_symbols)));
        }
        if !self.phoneme_id_map.contains_key(self.fallback_phoneme()) {
            return Err(SynthError::voice_load(voice_id, format!("fallback phoneme '{}' is not in the phoneme set", self.fallback_phoneme())));
        }
        if self.num_speakers == 0 {
            return Err(SynthError::voice_load(voice_id, "num_speakers must be at least 1"));
        }
        Ok(())
    }
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_noise_scale() -> f32 {
    0.667
}

fn default_length_scale() -> f32 {
    1.0
}

fn default_noise_w() -> f32 {
    0.8
}

fn default_num_speakers() -> u32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> VoiceMetadata {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let meta = parse(r#"{"phoneme_id_map": {"_": [0], "^": [1], "$": [2]}}"#);
        assert_eq!(meta.audio.sample_rate, 22050);
        assert_eq!(meta.inference, InferenceDefaults { noise_scale: 0.667, length_scale: 1.0, noise_w: 0.8 });
        assert_eq!(meta.num_speakers, 1);
        assert_eq!(meta.fallback_phoneme(), "_");
        assert!(meta.validate("v").is_ok());
    }

    #[test]
    fn test_language_from_espeak_voice() {
        let meta = parse(r#"{"espeak": {"voice": "fa"}, "phoneme_id_map": {"_": [0], "^": [1], "$": [2]}}"#);
        assert_eq!(meta.language_tag(), "fa");
        assert_eq!(meta.language_code(), "fa");

        let meta = parse(r#"{"language": {"code": "en_US"}, "espeak": {"voice": "en-us"}, "phoneme_id_map": {"_": [0], "^": [1], "$": [2]}}"#);
        assert_eq!(meta.language_tag(), "en-US");
        assert_eq!(meta.language_code(), "en");
    }

    #[test]
    fn test_validate_rejects_missing_control_symbols() {
        let meta = parse(r#"{"phoneme_id_map": {"a": [4]}}"#);
        let err = meta.validate("v").unwrap_err();
        assert!(err.to_string().contains("control symbol"));
    }

    #[test]
    fn test_validate_rejects_ids_beyond_symbol_count() {
        let meta = parse(r#"{"num_symbols": 3, "phoneme_id_map": {"_": [0], "^": [1], "$": [2], "a": [7]}}"#);
        assert!(meta.validate("v").is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_fallback() {
        let meta = parse(r#"{"fallback_phoneme": "?", "phoneme_id_map": {"_": [0], "^": [1], "$": [2]}}"#);
        assert!(meta.validate("v").is_err());
    }

    #[test]
    fn test_speakers_from_map_sorted_by_id() {
        let meta = parse(r#"{"num_speakers": 2, "speaker_id_map": {"b": 1, "a": 0}, "phoneme_id_map": {"_": [0], "^": [1], "$": [2]}}"#);
        let speakers = meta.speakers();
        assert_eq!(speakers, vec![Speaker { id: 0, name: "a".into() }, Speaker { id: 1, name: "b".into() }]);
    }

    #[test]
    fn test_speakers_numbered_without_map() {
        let meta = parse(r#"{"num_speakers": 3, "phoneme_id_map": {"_": [0], "^": [1], "$": [2]}}"#);
        assert_eq!(meta.speakers().len(), 3);
        assert_eq!(meta.speakers()[2].name, "speaker 2");
    }
}
