//! Piper speech synthesis driver for screen readers.
//!
//! Text goes through normalization, Persian homograph resolution, Ezafe
//! insertion and phonemization, then a Piper voice renders it sentence by
//! sentence. Audio is streamed in order to an [`audio::AudioStreamSink`]; a
//! newer utterance preempts an older one at the next stage boundary.

pub mod audio;
pub mod config;
pub mod driver;
pub mod error;
pub mod synth;
pub mod text;
pub mod tts;
pub mod voice;

pub use driver::{DriverOptions, SpeechItem, SynthDriver, VoiceInfo};
pub use error::{ErrorKind, Result, SynthError};
