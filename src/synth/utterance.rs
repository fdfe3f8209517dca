//! Utterance requests, lifecycle states and host-facing events.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// Monotonic utterance identifier, unique per scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UtteranceId(pub u64);

impl std::fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Speaking rate, pitch and volume as multipliers (1.0 = voice default).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prosody {
    pub rate: f32,
    pub pitch: f32,
    pub volume: f32,
}

impl Default for Prosody {
    fn default() -> Self {
        Self { rate: 1.0, pitch: 1.0, volume: 1.0 }
    }
}

impl Prosody {
    /// Convert screen reader settings on a 0-100 scale.
    ///
    /// Rate maps linearly onto a length scale from 2.0 (slowest) to 0.5 (fastest),
    /// pitch 50 is neutral, volume is a straight percentage.
    pub fn from_percent(rate: u8, pitch: u8, volume: u8) -> Self {
        let rate = f32::from(rate.min(100));
        let length_scale = 2.0 - rate / 100.0 * 1.5;
        Self { rate: 1.0 / length_scale, pitch: f32::from(pitch.min(100)) / 50.0, volume: f32::from(volume.min(100)) / 100.0 }
    }

    /// Inverse of `from_percent` for reporting current settings to the host.
    pub fn to_percent(&self) -> (u8, u8, u8) {
        let rate = ((2.0 - 1.0 / self.rate) / 1.5 * 100.0).round().clamp(0.0, 100.0) as u8;
        let pitch = (self.pitch * 50.0).round().clamp(0.0, 100.0) as u8;
        let volume = (self.volume * 100.0).round().clamp(0.0, 100.0) as u8;
        (rate, pitch, volume)
    }

    /// Clamp to ranges the engine can honor.
    pub fn clamped(self) -> Self {
        Self { rate: self.rate.clamp(0.25, 4.0), pitch: self.pitch.clamp(0.5, 2.0), volume: self.volume.clamp(0.0, 1.0) }
    }
}

/// Host index marker placed at a text offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub text_offset: usize,
    pub index: u32,
}

/// What the host asks to speak.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeakRequest {
    pub text: String,
    pub voice_id: String,
    pub prosody: Prosody,
    pub speaker: Option<u32>,
    pub bookmarks: Vec<Bookmark>,
}

impl SpeakRequest {
    pub fn new(text: impl Into<String>, voice_id: impl Into<String>) -> Self {
        Self { text: text.into(), voice_id: voice_id.into(), prosody: Prosody::default(), speaker: None, bookmarks: Vec::new() }
    }

    pub fn with_prosody(mut self, prosody: Prosody) -> Self {
        self.prosody = prosody;
        self
    }

    pub fn with_speaker(mut self, speaker: Option<u32>) -> Self {
        self.speaker = speaker;
        self
    }

    pub fn with_bookmarks(mut self, bookmarks: Vec<Bookmark>) -> Self {
        self.bookmarks = bookmarks;
        self
    }
}

/// An admitted request. Owned by the scheduler until it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: UtteranceId,
    pub text: String,
    pub voice_id: String,
    pub prosody: Prosody,
    pub speaker: Option<u32>,
    pub bookmarks: Vec<Bookmark>,
    pub requested_at: Instant,
}

impl Utterance {
    pub fn new(id: UtteranceId, request: SpeakRequest) -> Self {
        let mut bookmarks = request.bookmarks;
        bookmarks.sort_by_key(|b| b.text_offset);
        Self {
            id,
            text: request.text,
            voice_id: request.voice_id,
            prosody: request.prosody.clamped(),
            speaker: request.speaker,
            bookmarks,
            requested_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Preprocessing,
    Synthesizing,
    Streaming,
    Completed,
    Cancelling,
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Preprocessing => "preprocessing",
            PipelineState::Synthesizing => "synthesizing",
            PipelineState::Streaming => "streaming",
            PipelineState::Completed => "completed",
            PipelineState::Cancelling => "cancelling",
        };
        write!(f, "{}", name)
    }
}

/// How an utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    Cancelled,
    Failed(ErrorKind),
}

/// Notifications for the host. Audio itself goes to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverEvent {
    StateChanged { utterance_id: UtteranceId, state: PipelineState },
    IndexReached { utterance_id: UtteranceId, text_offset: usize, bookmark: Option<u32> },
    UtteranceDone { utterance_id: UtteranceId, outcome: Outcome },
    Error { utterance_id: UtteranceId, kind: ErrorKind, message: String },
}

impl DriverEvent {
    pub fn utterance_id(&self) -> UtteranceId {
        match self {
            DriverEvent::StateChanged { utterance_id, .. }
            | DriverEvent::IndexReached { utterance_id, .. }
            | DriverEvent::UtteranceDone { utterance_id, .. }
            | DriverEvent::Error { utterance_id, .. } => *utterance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_mapping_matches_length_scale_curve() {
        let slowest = Prosody::from_percent(0, 50, 100);
        assert!((slowest.rate - 0.5).abs() < 1e-6);
        assert!((slowest.pitch - 1.0).abs() < 1e-6);
        assert!((slowest.volume - 1.0).abs() < 1e-6);

        let fastest = Prosody::from_percent(100, 0, 0);
        assert!((fastest.rate - 2.0).abs() < 1e-6);
        assert_eq!(fastest.volume, 0.0);

        let default = Prosody::from_percent(50, 50, 100);
        assert!((default.rate - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_percent_round_trip() {
        assert_eq!(Prosody::from_percent(30, 70, 45).to_percent(), (30, 70, 45));
    }

    #[test]
    fn test_percent_input_clamped() {
        assert_eq!(Prosody::from_percent(250, 250, 250), Prosody::from_percent(100, 100, 100));
    }

    #[test]
    fn test_utterance_sorts_bookmarks() {
        let request = SpeakRequest::new("a b", "v").with_bookmarks(vec![Bookmark { text_offset: 2, index: 7 }, Bookmark { text_offset: 0, index: 3 }]);
        let utterance = Utterance::new(UtteranceId(1), request);
        assert_eq!(utterance.bookmarks[0].index, 3);
    }
}
