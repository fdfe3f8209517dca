//! Error types for the synthesis driver.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading voices or synthesizing an utterance.
#[derive(Debug, Error)]
pub enum SynthError {
    #[error("Failed to load voice '{voice}': {reason}")]
    VoiceLoad { voice: String, reason: String },

    #[error("Voice not found: {0}")]
    VoiceNotFound(String),

    #[error("Voice '{0}' is still referenced by an in-flight utterance")]
    VoiceInUse(String),

    #[error("Voice '{voice}' has no speaker {speaker}")]
    UnknownSpeaker { voice: String, speaker: u32 },

    #[error("Token '{token}' contains unsupported grapheme '{grapheme}'")]
    UnsupportedGrapheme { token: String, grapheme: char },

    #[error("{resource} unavailable: {reason}")]
    ResourceUnavailable { resource: &'static str, reason: String },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Audio sink did not accept a chunk within {0:?}")]
    SinkBackpressureTimeout(Duration),

    #[error("Audio sink error: {0}")]
    Sink(String),

    #[error("Utterance cancelled")]
    Cancelled,

    #[error("Synthesis worker is shut down")]
    ShutDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl SynthError {
    /// Shorthand for a voice load failure.
    pub fn voice_load(voice: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VoiceLoad { voice: voice.into(), reason: reason.into() }
    }

    /// The category reported to the host in error events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::VoiceLoad { .. } => ErrorKind::VoiceLoad,
            Self::VoiceNotFound(_) => ErrorKind::VoiceNotFound,
            Self::VoiceInUse(_) => ErrorKind::VoiceInUse,
            Self::UnknownSpeaker { .. } => ErrorKind::UnknownSpeaker,
            Self::UnsupportedGrapheme { .. } => ErrorKind::UnsupportedGrapheme,
            Self::ResourceUnavailable { .. } => ErrorKind::ResourceUnavailable,
            Self::Inference(_) => ErrorKind::Inference,
            Self::SinkBackpressureTimeout(_) => ErrorKind::SinkBackpressureTimeout,
            Self::Sink(_) => ErrorKind::Sink,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::ShutDown => ErrorKind::ShutDown,
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
        }
    }
}

/// Error category carried by driver events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    VoiceLoad,
    VoiceNotFound,
    VoiceInUse,
    UnknownSpeaker,
    UnsupportedGrapheme,
    ResourceUnavailable,
    Inference,
    SinkBackpressureTimeout,
    Sink,
    Cancelled,
    ShutDown,
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::VoiceLoad => "voice_load",
            ErrorKind::VoiceNotFound => "voice_not_found",
            ErrorKind::VoiceInUse => "voice_in_use",
            ErrorKind::UnknownSpeaker => "unknown_speaker",
            ErrorKind::UnsupportedGrapheme => "unsupported_grapheme",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::Inference => "inference",
            ErrorKind::SinkBackpressureTimeout => "sink_backpressure_timeout",
            ErrorKind::Sink => "sink",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ShutDown => "shut_down",
            ErrorKind::Io => "io",
        };
        write!(f, "{}", name)
    }
}

pub type Result<T> = std::result::Result<T, SynthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_projection() {
        assert_eq!(SynthError::VoiceNotFound("fa_IR".into()).kind(), ErrorKind::VoiceNotFound);
        assert_eq!(SynthError::SinkBackpressureTimeout(Duration::from_millis(5)).kind(), ErrorKind::SinkBackpressureTimeout);
        assert_eq!(SynthError::voice_load("a", "b").kind(), ErrorKind::VoiceLoad);
    }

    #[test]
    fn test_error_messages() {
        let err = SynthError::voice_load("fa_IR-amir", "missing metadata");
        assert_eq!(err.to_string(), "Failed to load voice 'fa_IR-amir': missing metadata");
        assert_eq!(ErrorKind::SinkBackpressureTimeout.to_string(), "sink_backpressure_timeout");

        let err = SynthError::ResourceUnavailable { resource: "Ezafe model", reason: "ezafe.json: not found".into() };
        assert_eq!(err.to_string(), "Ezafe model unavailable: ezafe.json: not found");
        assert_eq!(err.kind(), ErrorKind::ResourceUnavailable);
    }
}
