//! Host-facing driver.
//!
//! [`SynthDriver`] is what a screen reader talks to. It keeps the current voice,
//! speaker variant and prosody settings, turns host calls into [`SpeakRequest`]s
//! and forwards control calls to the [`UtteranceScheduler`].

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::audio::AudioStreamSink;
use crate::error::{Result, SynthError};
use crate::synth::{Bookmark, DriverEvent, PipelineState, Prosody, SchedulerOptions, SpeakRequest, SynthesisPipeline, UtteranceId, UtteranceScheduler};
use crate::text::{ResourceManager, ResourcePaths};
use crate::tts::InferenceEngine;
use crate::voice::{Speaker, Voice, VoiceDescriptor, VoiceMetadata, VoiceRegistry};

/// Everything the driver reads once at initialization.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub voice_dir: PathBuf,
    /// Voice to select at startup; the first voice found is used when unset.
    pub default_voice: Option<String>,
    pub speaker: Option<u32>,
    pub resources: ResourcePaths,
    pub scheduler: SchedulerOptions,
    /// Rate, pitch and volume on the host's 0-100 scale.
    pub rate: u8,
    pub pitch: u8,
    pub volume: u8,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            voice_dir: PathBuf::from("voices"),
            default_voice: None,
            speaker: None,
            resources: ResourcePaths::default(),
            scheduler: SchedulerOptions::default(),
            rate: 50,
            pitch: 50,
            volume: 100,
        }
    }
}

/// One item of a screen reader speech sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechItem {
    Text(String),
    /// Report `IndexReached` once the preceding text has been played.
    Index(u32),
    /// New rate for following text; `None` restores the driver setting.
    Rate(Option<u8>),
    /// New volume for following text; `None` restores the driver setting.
    Volume(Option<u8>),
    Break,
}

/// A voice found in the voice directory.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceInfo {
    pub id: String,
    pub language: String,
    pub sample_rate: u32,
    pub speakers: Vec<Speaker>,
    pub loaded: bool,
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    rate: u8,
    pitch: u8,
    volume: u8,
}

#[derive(Debug, Default)]
struct Selection {
    voice: Option<String>,
    speaker: Option<u32>,
}

/// Speech synthesis driver for a screen reader host.
pub struct SynthDriver {
    registry: Arc<VoiceRegistry>,
    resources: Arc<ResourceManager>,
    scheduler: UtteranceScheduler,
    voice_dir: PathBuf,
    selection: RwLock<Selection>,
    settings: RwLock<Settings>,
}

impl SynthDriver {
    /// Initialize the driver and select the startup voice.
    ///
    /// Missing linguistic resources degrade but never fail initialization.
    ///
    /// # Arguments
    /// * `engine` - Inference engine used to load voice models
    /// * `sink` - Destination of the synthesized audio
    /// * `options` - Voice directory, resource paths and initial settings
    ///
    /// # Returns
    /// The driver and the receiver of its [`DriverEvent`]s.
    ///
    /// # Errors
    /// Returns an error if the configured default voice cannot be loaded.
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        sink: Arc<dyn AudioStreamSink>,
        options: DriverOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<DriverEvent>)> {
        let registry = Arc::new(VoiceRegistry::with_voice_dir(engine, options.voice_dir.clone()));
        let resources = Arc::new(ResourceManager::init(options.resources.clone()));
        let pipeline = SynthesisPipeline::new(resources.clone());
        let (scheduler, events) = UtteranceScheduler::new(registry.clone(), pipeline, sink, options.scheduler);

        let driver = Self {
            registry,
            resources,
            scheduler,
            voice_dir: options.voice_dir.clone(),
            selection: RwLock::new(Selection::default()),
            settings: RwLock::new(Settings { rate: options.rate, pitch: options.pitch, volume: options.volume }),
        };

        let startup_voice = options.default_voice.clone().or_else(|| VoiceRegistry::scan(&options.voice_dir).into_iter().next().map(|d| d.id));
        match startup_voice {
            Some(voice_id) => {
                driver.set_voice(&voice_id)?;
                if let Some(speaker) = options.speaker {
                    driver.set_variant(speaker)?;
                }
            }
            None => warn!("No voices found in {}", options.voice_dir.display()),
        }

        Ok((driver, events))
    }

    /// Speak `text` with explicit settings on the host's 0-100 scale.
    ///
    /// Uses the current voice when `voice_id` is `None`. Returns immediately;
    /// progress arrives as events.
    pub fn speak(&self, text: &str, voice_id: Option<&str>, rate: u8, pitch: u8, volume: u8) -> UtteranceId {
        let request = self.request(text, voice_id).with_prosody(Prosody::from_percent(rate, pitch, volume));
        self.speak_request(request)
    }

    /// Speak a fully specified request.
    ///
    /// A voice that is not loaded yet is loaded by the synthesis worker, so this
    /// never waits on model loading.
    pub fn speak_request(&self, request: SpeakRequest) -> UtteranceId {
        self.scheduler.speak(request)
    }

    /// Speak a screen reader command sequence as one utterance.
    ///
    /// Text runs are concatenated, breaks become spaces and index commands become
    /// bookmarks at the current text offset. The prosody in effect when the first
    /// non-blank text arrives applies to the whole utterance.
    ///
    /// Returns `None` for a sequence with neither text nor index commands.
    pub fn speak_sequence(&self, items: Vec<SpeechItem>) -> Option<UtteranceId> {
        let settings = *self.settings.read();
        let (mut rate, mut volume) = (settings.rate, settings.volume);
        let mut prosody = None;
        let mut text = String::new();
        let mut bookmarks = Vec::new();

        for item in items {
            match item {
                SpeechItem::Text(part) => {
                    if prosody.is_none() && !part.trim().is_empty() {
                        prosody = Some(Prosody::from_percent(rate, settings.pitch, volume));
                    }
                    text.push_str(&part);
                }
                SpeechItem::Index(index) => bookmarks.push(Bookmark { text_offset: text.len(), index }),
                SpeechItem::Rate(value) => rate = value.map_or(settings.rate, |v| v.min(100)),
                SpeechItem::Volume(value) => volume = value.map_or(settings.volume, |v| v.min(100)),
                SpeechItem::Break => text.push(' '),
            }
        }

        if text.trim().is_empty() && bookmarks.is_empty() {
            return None;
        }

        let prosody = prosody.unwrap_or_else(|| Prosody::from_percent(rate, settings.pitch, volume));
        let request = self.request(&text, None).with_prosody(prosody).with_bookmarks(bookmarks);
        Some(self.speak_request(request))
    }

    /// Stop the current utterance and drop its buffered audio.
    pub fn cancel(&self) {
        if let Some(id) = self.scheduler.cancel_current() {
            debug!(utterance = %id, "Host cancel");
        }
    }

    pub fn pause(&self) {
        self.scheduler.pause();
    }

    pub fn resume(&self) {
        self.scheduler.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.scheduler.is_paused()
    }

    /// The active utterance and its state.
    pub fn current(&self) -> Option<(UtteranceId, PipelineState)> {
        self.scheduler.current()
    }

    /// Select the voice for subsequent utterances, loading it on first use.
    ///
    /// The previous voice is unloaded unless an utterance still holds it.
    ///
    /// # Errors
    /// Returns `VoiceNotFound` if no such voice exists in the voice directory, or
    /// `VoiceLoad` if it fails validation.
    pub fn set_voice(&self, voice_id: &str) -> Result<()> {
        let voice = self.registry.ensure(voice_id)?;

        let previous = {
            let mut selection = self.selection.write();
            selection.speaker = None;
            selection.voice.replace(voice_id.to_string())
        };

        if let Some(previous) = previous.filter(|p| p != voice_id)
            && let Err(e) = self.registry.unload(&previous)
        {
            debug!("Keeping voice {} loaded: {}", previous, e);
        }

        info!("🗣️  Voice: {} ({}, {} Hz)", voice.id(), voice.language_tag(), voice.sample_rate());
        Ok(())
    }

    pub fn voice(&self) -> Option<String> {
        self.selection.read().voice.clone()
    }

    /// Voices available in the voice directory, with language and speakers.
    pub fn available_voices(&self) -> Vec<VoiceInfo> {
        list_voices(&self.voice_dir)
            .into_iter()
            .map(|mut info| {
                info.loaded = self.registry.is_loaded(&info.id);
                info
            })
            .collect()
    }

    /// Speakers of the current voice. Empty for single-speaker voices.
    pub fn variants(&self) -> Vec<Speaker> {
        self.current_voice().map(|voice| voice.speakers()).unwrap_or_default()
    }

    pub fn variant(&self) -> Option<u32> {
        self.selection.read().speaker
    }

    /// Select a speaker of the current voice.
    ///
    /// # Errors
    /// Returns `VoiceNotFound` if no voice is selected, or `UnknownSpeaker` if the
    /// voice has no such speaker.
    pub fn set_variant(&self, speaker: u32) -> Result<()> {
        let voice = self.current_voice().ok_or_else(|| SynthError::VoiceNotFound("<none selected>".to_string()))?;
        if speaker >= voice.metadata().num_speakers {
            return Err(SynthError::UnknownSpeaker { voice: voice.id().to_string(), speaker });
        }
        self.selection.write().speaker = Some(speaker);
        debug!(voice = voice.id(), speaker, "Variant selected");
        Ok(())
    }

    /// Settings used by [`speak_sequence`](Self::speak_sequence), on the 0-100 scale.
    pub fn set_prosody(&self, rate: u8, pitch: u8, volume: u8) {
        *self.settings.write() = Settings { rate: rate.min(100), pitch: pitch.min(100), volume: volume.min(100) };
    }

    /// Current rate, pitch and volume on the 0-100 scale.
    pub fn prosody(&self) -> (u8, u8, u8) {
        let settings = self.settings.read();
        (settings.rate, settings.pitch, settings.volume)
    }

    /// Enable or disable the homograph and Ezafe stages.
    ///
    /// The utterance in flight is cancelled so nothing straddles the switch.
    pub fn set_persian_phonemizer(&self, enabled: bool) {
        self.cancel();
        self.resources.set_persian_enabled(enabled);
        info!("🔤 Persian phonemizer {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn persian_phonemizer(&self) -> bool {
        self.resources.paths().persian_enabled
    }

    /// Re-read the homograph dictionary and Ezafe model from disk.
    pub fn reload_resources(&self) {
        self.cancel();
        self.resources.reload();
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn registry(&self) -> &Arc<VoiceRegistry> {
        &self.registry
    }

    /// Cancel everything, stop the worker and release all voices.
    pub async fn terminate(&self) {
        self.scheduler.shutdown().await;
        for voice_id in self.registry.list() {
            if let Err(e) = self.registry.unload(&voice_id) {
                warn!("Failed to unload voice {}: {}", voice_id, e);
            }
        }
        info!("✅ Driver terminated");
    }

    fn request(&self, text: &str, voice_id: Option<&str>) -> SpeakRequest {
        let selection = self.selection.read();
        let voice = voice_id.map(str::to_string).or_else(|| selection.voice.clone()).unwrap_or_default();
        let speaker = if voice_id.is_none_or(|v| selection.voice.as_deref() == Some(v)) { selection.speaker } else { None };
        SpeakRequest::new(text, voice).with_speaker(speaker)
    }

    fn current_voice(&self) -> Option<Arc<Voice>> {
        let voice_id = self.selection.read().voice.clone()?;
        self.registry.resolve(&voice_id).ok()
    }
}

/// Describe the voices in `dir` without loading their models.
pub fn list_voices(dir: &std::path::Path) -> Vec<VoiceInfo> {
    VoiceRegistry::scan(dir).iter().filter_map(describe).collect()
}

fn describe(descriptor: &VoiceDescriptor) -> Option<VoiceInfo> {
    match VoiceMetadata::from_file(&descriptor.id, &descriptor.metadata_path) {
        Ok(metadata) => Some(VoiceInfo {
            id: descriptor.id.clone(),
            language: metadata.language_tag(),
            sample_rate: metadata.audio.sample_rate,
            speakers: metadata.speakers(),
            loaded: false,
        }),
        Err(e) => {
            warn!("Skipping voice: {}", e);
            None
        }
    }
}
