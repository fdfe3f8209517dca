//! Audio chunks and the sinks that consume them.
//!
//! Device playback uses cpal with rubato resampling and is only built with the
//! `playback` feature.

mod chunk;
#[cfg(feature = "playback")]
mod playback;
#[cfg(feature = "playback")]
mod resampler;
mod sink;

pub use chunk::{AudioChunk, TextMarker};
#[cfg(feature = "playback")]
pub use playback::DevicePlayer;
#[cfg(feature = "playback")]
pub use resampler::ChunkResampler;
pub use sink::{AudioStreamSink, ChannelSink, SinkMessage, SinkReceiver};
