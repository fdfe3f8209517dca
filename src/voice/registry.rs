//! Voice discovery, validation and lifetime tracking.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::metadata::{InferenceDefaults, Speaker, VoiceMetadata};
use crate::error::{Result, SynthError};
use crate::tts::{InferenceEngine, VoiceModel};

/// Location of a voice's artifacts on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceDescriptor {
    pub id: String,
    pub model_path: PathBuf,
    pub metadata_path: PathBuf,
}

impl VoiceDescriptor {
    /// Descriptor for `<dir>/<id>.onnx` with its `<id>.onnx.json` companion.
    pub fn from_model_path(model_path: &Path) -> Option<Self> {
        let id = model_path.file_stem()?.to_str()?.to_string();
        Some(Self { id, model_path: model_path.to_path_buf(), metadata_path: model_path.with_extension("onnx.json") })
    }
}

/// A loaded voice. Immutable after registration except for its lease count.
pub struct Voice {
    id: String,
    model_path: PathBuf,
    metadata: VoiceMetadata,
    model: Arc<dyn VoiceModel>,
    leases: AtomicUsize,
}

impl Voice {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn sample_rate(&self) -> u32 {
        self.metadata.audio.sample_rate
    }

    pub fn language_tag(&self) -> String {
        self.metadata.language_tag()
    }

    pub fn language_code(&self) -> String {
        self.metadata.language_code()
    }

    /// Whether `phoneme` belongs to this voice's phoneme set.
    pub fn supports(&self, phoneme: &str) -> bool {
        self.metadata.phoneme_id_map.contains_key(phoneme)
    }

    /// Model input ids for `phoneme`.
    pub fn phoneme_ids(&self, phoneme: &str) -> Option<&[i64]> {
        self.metadata.phoneme_id_map.get(phoneme).map(Vec::as_slice)
    }

    pub fn fallback_phoneme(&self) -> &str {
        self.metadata.fallback_phoneme()
    }

    pub fn speakers(&self) -> Vec<Speaker> {
        self.metadata.speakers()
    }

    pub fn inference_defaults(&self) -> InferenceDefaults {
        self.metadata.inference
    }

    pub fn metadata(&self) -> &VoiceMetadata {
        &self.metadata
    }

    pub fn model(&self) -> &Arc<dyn VoiceModel> {
        &self.model
    }

    /// Number of in-flight utterances holding this voice.
    pub fn active_leases(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Voice")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate())
            .field("language", &self.language_tag())
            .field("phonemes", &self.metadata.phoneme_id_map.len())
            .field("leases", &self.active_leases())
            .finish()
    }
}

/// Reference to a voice held by an in-flight utterance.
///
/// While any lease is alive the registry refuses to unload the voice.
pub struct VoiceLease {
    voice: Arc<Voice>,
}

impl VoiceLease {
    fn new(voice: Arc<Voice>) -> Self {
        voice.leases.fetch_add(1, Ordering::SeqCst);
        Self { voice }
    }
}

impl Deref for VoiceLease {
    type Target = Voice;

    fn deref(&self) -> &Voice {
        &self.voice
    }
}

impl Drop for VoiceLease {
    fn drop(&mut self) {
        self.voice.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Registry of loaded voices keyed by id.
pub struct VoiceRegistry {
    engine: Arc<dyn InferenceEngine>,
    /// Where [`ensure`](Self::ensure) looks for voices that are not loaded yet.
    voice_dir: Option<PathBuf>,
    voices: RwLock<HashMap<String, Arc<Voice>>>,
    /// Serializes register/unload so model loading happens outside the map lock.
    registration: Mutex<()>,
}

impl VoiceRegistry {
    pub fn new(engine: Arc<dyn InferenceEngine>) -> Self {
        Self { engine, voice_dir: None, voices: RwLock::new(HashMap::new()), registration: Mutex::new(()) }
    }

    /// Registry that loads voices from `dir` on first use.
    pub fn with_voice_dir(engine: Arc<dyn InferenceEngine>, dir: impl Into<PathBuf>) -> Self {
        Self { voice_dir: Some(dir.into()), ..Self::new(engine) }
    }

    pub fn voice_dir(&self) -> Option<&Path> {
        self.voice_dir.as_deref()
    }

    /// Find voices in `dir`: every `*.onnx` with an `.onnx.json` companion, sorted by id.
    pub fn scan(dir: &Path) -> Vec<VoiceDescriptor> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Voice directory {} is not readable: {}", dir.display(), e);
                return Vec::new();
            }
        };

        let mut found: Vec<VoiceDescriptor> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "onnx"))
            .filter_map(|path| VoiceDescriptor::from_model_path(&path))
            .filter(|descriptor| {
                let paired = descriptor.metadata_path.is_file();
                if !paired {
                    debug!("Skipping {} without metadata", descriptor.model_path.display());
                }
                paired
            })
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Validate and load a voice.
    ///
    /// Registering an id that is already loaded returns the existing voice.
    ///
    /// # Errors
    /// Returns `VoiceLoad` if either artifact is missing, the metadata is
    /// inconsistent, or the model disagrees with its metadata.
    pub fn register(&self, descriptor: &VoiceDescriptor) -> Result<Arc<Voice>> {
        let _guard = self.registration.lock();

        if let Some(existing) = self.voices.read().get(&descriptor.id) {
            return Ok(existing.clone());
        }

        let id = descriptor.id.as_str();
        if !descriptor.model_path.is_file() {
            return Err(SynthError::voice_load(id, format!("model file not found: {}", descriptor.model_path.display())));
        }
        if !descriptor.metadata_path.is_file() {
            return Err(SynthError::voice_load(id, format!("metadata file not found: {}", descriptor.metadata_path.display())));
        }

        let metadata = VoiceMetadata::from_file(id, &descriptor.metadata_path)?;
        metadata.validate(id)?;

        let start = Instant::now();
        let model = self.engine.load(id, &descriptor.model_path, &metadata)?;
        check_model_consistency(id, &metadata, model.as_ref())?;

        let voice = Arc::new(Voice { id: id.to_string(), model_path: descriptor.model_path.clone(), metadata, model, leases: AtomicUsize::new(0) });

        info!(
            voice = id,
            engine = self.engine.name(),
            sample_rate = voice.sample_rate(),
            phonemes = voice.metadata.phoneme_id_map.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Voice registered"
        );

        self.voices.write().insert(voice.id.clone(), voice.clone());
        Ok(voice)
    }

    /// Register every voice found in `dir`. Failures are logged and skipped.
    pub fn register_dir(&self, dir: &Path) -> Vec<Arc<Voice>> {
        Self::scan(dir)
            .iter()
            .filter_map(|descriptor| match self.register(descriptor) {
                Ok(voice) => Some(voice),
                Err(e) => {
                    warn!("❌ {}", e);
                    None
                }
            })
            .collect()
    }

    /// Return a loaded voice, registering it from the voice directory first if needed.
    ///
    /// Model loading is blocking; async callers run this on the blocking pool.
    ///
    /// # Errors
    /// Returns `VoiceNotFound` if the voice is neither loaded nor present in the
    /// voice directory, or `VoiceLoad` if it fails validation.
    pub fn ensure(&self, voice_id: &str) -> Result<Arc<Voice>> {
        if let Ok(voice) = self.resolve(voice_id) {
            return Ok(voice);
        }
        let dir = self.voice_dir.as_deref().ok_or_else(|| SynthError::VoiceNotFound(voice_id.to_string()))?;
        let descriptor = Self::scan(dir).into_iter().find(|d| d.id == voice_id).ok_or_else(|| SynthError::VoiceNotFound(voice_id.to_string()))?;
        self.register(&descriptor)
    }

    /// Look up a loaded voice.
    ///
    /// # Errors
    /// Returns `VoiceNotFound` if no voice with that id is loaded.
    pub fn resolve(&self, voice_id: &str) -> Result<Arc<Voice>> {
        self.voices.read().get(voice_id).cloned().ok_or_else(|| SynthError::VoiceNotFound(voice_id.to_string()))
    }

    /// Look up a loaded voice and hold it for the duration of an utterance.
    ///
    /// # Errors
    /// Returns `VoiceNotFound` if no voice with that id is loaded.
    pub fn acquire(&self, voice_id: &str) -> Result<VoiceLease> {
        let voices = self.voices.read();
        let voice = voices.get(voice_id).ok_or_else(|| SynthError::VoiceNotFound(voice_id.to_string()))?;
        Ok(VoiceLease::new(voice.clone()))
    }

    /// Release a loaded voice.
    ///
    /// Returns `false` if the voice was not loaded.
    ///
    /// # Errors
    /// Returns `VoiceInUse` while an utterance still holds a lease on the voice.
    pub fn unload(&self, voice_id: &str) -> Result<bool> {
        let _guard = self.registration.lock();
        let mut voices = self.voices.write();

        let Some(voice) = voices.get(voice_id) else {
            return Ok(false);
        };
        if voice.active_leases() > 0 {
            return Err(SynthError::VoiceInUse(voice_id.to_string()));
        }

        voices.remove(voice_id);
        info!(voice = voice_id, "Voice unloaded");
        Ok(true)
    }

    /// Ids of the loaded voices, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.voices.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_loaded(&self, voice_id: &str) -> bool {
        self.voices.read().contains_key(voice_id)
    }
}

fn check_model_consistency(voice_id: &str, metadata: &VoiceMetadata, model: &dyn VoiceModel) -> Result<()> {
    if let Some(rate) = model.sample_rate()
        && rate != metadata.audio.sample_rate
    {
        return Err(SynthError::voice_load(voice_id, format!("model outputs {} Hz but metadata declares {} Hz", rate, metadata.audio.sample_rate)));
    }

    if let Some(symbols) = model.symbol_count() {
        if let Some(declared) = metadata.num_symbols
            && declared != symbols
        {
            return Err(SynthError::voice_load(voice_id, format!("model has {} symbols but metadata declares {}", symbols, declared)));
        }
        if let Some(max_id) = metadata.max_symbol_id()
            && max_id as usize >= symbols
        {
            return Err(SynthError::voice_load(voice_id, format!("phoneme id {} is outside the model's {} symbols", max_id, symbols)));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use super::*;
    use crate::tts::{PcmBlock, SynthesisParams};

    struct StubModel {
        symbols: Option<usize>,
    }

    impl VoiceModel for StubModel {
        fn symbol_count(&self) -> Option<usize> {
            self.symbols
        }

        fn synthesize(&self, _ids: &[i64], _params: &SynthesisParams, emit: &mut dyn FnMut(PcmBlock) -> ControlFlow<()>) -> Result<()> {
            let _ = emit(PcmBlock { samples: vec![0.0; 4], last: true });
            Ok(())
        }
    }

    struct StubEngine {
        symbols: Option<usize>,
    }

    impl InferenceEngine for StubEngine {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn load(&self, _voice_id: &str, _model_path: &Path, _metadata: &VoiceMetadata) -> Result<Arc<dyn VoiceModel>> {
            Ok(Arc::new(StubModel { symbols: self.symbols }))
        }
    }

    const VOICE_A: &str = r#"{
        "audio": {"sample_rate": 22050},
        "espeak": {"voice": "fa"},
        "phoneme_id_map": {"_": [0], "^": [1], "$": [2], " ": [3], "a": [4], "b": [5], "c": [6]}
    }"#;

    fn write_voice(dir: &Path, id: &str, metadata: Option<&str>) -> VoiceDescriptor {
        let model_path = dir.join(format!("{}.onnx", id));
        std::fs::write(&model_path, b"onnx").unwrap();
        if let Some(json) = metadata {
            std::fs::write(dir.join(format!("{}.onnx.json", id)), json).unwrap();
        }
        VoiceDescriptor::from_model_path(&model_path).unwrap()
    }

    fn registry(symbols: Option<usize>) -> VoiceRegistry {
        VoiceRegistry::new(Arc::new(StubEngine { symbols }))
    }

    #[test]
    fn test_register_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = write_voice(dir.path(), "voiceA", Some(VOICE_A));
        let registry = registry(None);

        let voice = registry.register(&descriptor).unwrap();
        assert_eq!(voice.sample_rate(), 22050);
        assert!(voice.supports("a") && voice.supports("c"));
        assert!(!voice.supports("z"));

        let resolved = registry.resolve("voiceA").unwrap();
        assert_eq!(resolved.sample_rate(), 22050);
        assert_eq!(resolved.language_code(), "fa");
    }

    #[test]
    fn test_register_twice_returns_existing() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = write_voice(dir.path(), "voiceA", Some(VOICE_A));
        let registry = registry(None);

        let first = registry.register(&descriptor).unwrap();
        let second = registry.register(&descriptor).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_register_missing_metadata_fails() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = write_voice(dir.path(), "voiceB", None);
        let err = registry(None).register(&descriptor).unwrap_err();
        assert!(matches!(err, SynthError::VoiceLoad { .. }));
    }

    #[test]
    fn test_register_rejects_symbol_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = write_voice(dir.path(), "voiceA", Some(VOICE_A));
        let err = registry(Some(5)).register(&descriptor).unwrap_err();
        assert!(err.to_string().contains("outside the model"));
    }

    #[test]
    fn test_resolve_unknown_voice() {
        let err = registry(None).resolve("nope").unwrap_err();
        assert!(matches!(err, SynthError::VoiceNotFound(_)));
    }

    #[test]
    fn test_unload_rejects_while_leased() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = write_voice(dir.path(), "voiceA", Some(VOICE_A));
        let registry = registry(None);
        registry.register(&descriptor).unwrap();

        let lease = registry.acquire("voiceA").unwrap();
        assert_eq!(lease.active_leases(), 1);
        assert!(matches!(registry.unload("voiceA"), Err(SynthError::VoiceInUse(_))));

        drop(lease);
        assert!(registry.unload("voiceA").unwrap());
        assert!(!registry.unload("voiceA").unwrap());
        assert!(registry.resolve("voiceA").is_err());
    }

    #[test]
    fn test_scan_pairs_models_with_metadata() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(dir.path(), "b-voice", Some(VOICE_A));
        write_voice(dir.path(), "a-voice", Some(VOICE_A));
        write_voice(dir.path(), "orphan", None);
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let found = VoiceRegistry::scan(dir.path());
        let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a-voice", "b-voice"]);
    }

    #[test]
    fn test_ensure_loads_from_voice_dir_once() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(dir.path(), "voiceA", Some(VOICE_A));
        let registry = VoiceRegistry::with_voice_dir(Arc::new(StubEngine { symbols: None }), dir.path());

        assert!(!registry.is_loaded("voiceA"));
        let first = registry.ensure("voiceA").unwrap();
        let second = registry.ensure("voiceA").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(matches!(registry.ensure("nope"), Err(SynthError::VoiceNotFound(_))));
    }

    #[test]
    fn test_ensure_without_voice_dir_only_resolves() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(dir.path(), "voiceA", Some(VOICE_A));
        assert!(matches!(registry(None).ensure("voiceA"), Err(SynthError::VoiceNotFound(_))));
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        assert!(VoiceRegistry::scan(Path::new("/definitely/not/here")).is_empty());
    }

    #[test]
    fn test_register_dir_skips_broken_voices() {
        let dir = tempfile::tempdir().unwrap();
        write_voice(dir.path(), "good", Some(VOICE_A));
        write_voice(dir.path(), "broken", Some("{not json"));

        let registry = registry(None);
        let loaded = registry.register_dir(dir.path());
        assert_eq!(loaded.len(), 1);
        assert_eq!(registry.list(), vec!["good".to_string()]);
    }
}
