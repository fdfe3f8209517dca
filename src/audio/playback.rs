//! Audio playback sink using cpal.
//!
//! Plays chunks through the default output device. Samples are queued in a
//! lock-free ring buffer read by the audio callback, so the callback never
//! waits on a mutex. Chunks at a different rate than the device are resampled.
//!
//! Shared counters track how many samples were queued and played, so the end of
//! an utterance is reported once the device has played it, and a cancel drops
//! only what was queued before it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig, SupportedStreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use tracing::{debug, info};

use super::chunk::AudioChunk;
use super::resampler::ChunkResampler;
use super::sink::AudioStreamSink;
use crate::error::SynthError;
use crate::synth::UtteranceId;

/// Seconds of audio the ring buffer holds before `accept` waits.
/// Draining a full ring must fit in the scheduler's sink timeout.
const PLAYBACK_RING_SECONDS: usize = 1;

/// How long `accept` and `end_of_utterance` sleep between checks.
const RING_POLL: Duration = Duration::from_millis(10);

/// Rate requested when the device reports no default configuration.
const FALLBACK_RATE: u32 = 48000;

/// Speaker output implementing [`AudioStreamSink`].
pub struct DevicePlayer {
    /// Kept alive to maintain the audio stream
    _stream: Stream,
    device_sample_rate: u32,
    /// Ring buffer producer (mutex protects multi-threaded queue access)
    producer: Mutex<ringbuf::HeapProd<f32>>,
    /// Converter for the voice currently playing
    resampler: Mutex<Option<ChunkResampler>>,
    cursor: Arc<Cursor>,
}

/// Sample positions shared between the producer side and the audio callback.
#[derive(Debug, Default)]
struct Cursor {
    /// Samples pushed into the ring since the stream opened.
    pushed: AtomicU64,
    /// Samples the callback has taken out of the ring.
    played: AtomicU64,
    /// Samples before this position are skipped instead of played.
    discard_until: AtomicU64,
}

impl Cursor {
    fn queued(&self, samples: usize) {
        self.pushed.fetch_add(samples as u64, Ordering::AcqRel);
    }

    /// Mark everything pushed so far as discarded.
    fn discard_queued(&self) {
        self.discard_until.fetch_max(self.pushed.load(Ordering::Acquire), Ordering::AcqRel);
    }

    /// Whether every sample up to `position` has been played or discarded.
    fn reached(&self, position: u64) -> bool {
        self.played.load(Ordering::Acquire) >= position || self.discard_until.load(Ordering::Acquire) >= position
    }
}

/// Audio callback body: skip discarded samples, then fill `data` one frame per sample.
fn fill_frames(consumer: &mut HeapCons<f32>, cursor: &Cursor, data: &mut [f32], channels: usize) {
    let mut played = cursor.played.load(Ordering::Acquire);
    let discard_until = cursor.discard_until.load(Ordering::Acquire);
    if discard_until > played {
        played += consumer.skip((discard_until - played) as usize) as u64;
    }

    for frame in data.chunks_mut(channels.max(1)) {
        let sample = match consumer.try_pop() {
            Some(sample) => {
                played += 1;
                sample
            }
            None => 0.0,
        };
        // Duplicate mono sample to all channels
        frame.fill(sample);
    }
    cursor.played.store(played, Ordering::Release);
}

impl DevicePlayer {
    /// Open the default output device.
    ///
    /// # Errors
    /// Returns an error if:
    /// - No output device is available
    /// - The device offers no f32 mono or stereo configuration
    /// - Failed to build output stream
    pub fn new() -> Result<Self> {
        let host = cpal::default_host();
        let device = host.default_output_device().context("No output device available")?;

        let name = device.description().ok().map(|desc| desc.name().to_string()).unwrap_or_else(|| "Unknown".to_string());
        info!("Using output device: {}", name);

        let preferred_rate = device.default_output_config().map(|c| c.sample_rate()).unwrap_or(FALLBACK_RATE);
        let ranges = device.supported_output_configs().context("Failed to get supported output configs")?;
        let config = select_config(ranges, preferred_rate)?;
        let device_sample_rate = config.sample_rate();

        debug!("Audio playback config: {} Hz, {} channels, {:?}", device_sample_rate, config.channels(), config.sample_format());

        let ring = HeapRb::<f32>::new(device_sample_rate as usize * PLAYBACK_RING_SECONDS);
        let (producer, mut consumer) = ring.split();

        let cursor = Arc::new(Cursor::default());
        let callback_cursor = cursor.clone();

        let channels = config.channels() as usize;
        let stream_config: StreamConfig = config.config();

        let stream = device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| fill_frames(&mut consumer, &callback_cursor, data, channels),
            |err| tracing::error!("Audio playback error: {}", err),
            None,
        )?;

        stream.play().context("Failed to start playback stream")?;

        info!("🔈 Audio playback ready at {} Hz", device_sample_rate);

        Ok(Self { _stream: stream, device_sample_rate, producer: Mutex::new(producer), resampler: Mutex::new(None), cursor })
    }

    /// Bring `chunk` to the device rate, reusing the converter while the voice rate stays the same.
    fn convert(&self, chunk: &AudioChunk) -> Result<Vec<f32>> {
        let samples = chunk.samples_f32();
        if chunk.sample_rate == self.device_sample_rate {
            return Ok(samples);
        }

        let mut slot = self.resampler.lock();
        if slot.as_ref().is_none_or(|r| r.from_rate() != chunk.sample_rate) {
            *slot = Some(ChunkResampler::new(chunk.sample_rate, self.device_sample_rate)?);
        }
        let Some(resampler) = slot.as_mut() else {
            return Ok(samples);
        };

        let mut out = resampler.process(&samples)?;
        if chunk.is_final {
            out.extend(resampler.finish()?);
        }
        Ok(out)
    }
}

#[async_trait]
impl AudioStreamSink for DevicePlayer {
    async fn accept(&self, chunk: AudioChunk) -> crate::error::Result<()> {
        let samples = self.convert(&chunk).map_err(|e| SynthError::Sink(format!("resampling failed: {}", e)))?;

        let mut offset = 0;
        while offset < samples.len() {
            {
                let mut producer = self.producer.lock();
                let pushed = producer.push_slice(&samples[offset..]);
                self.cursor.queued(pushed);
                offset += pushed;
            }
            if offset < samples.len() {
                tokio::time::sleep(RING_POLL).await;
            }
        }

        debug!(utterance = %chunk.utterance_id, seq = chunk.sequence_number, samples = samples.len(), "Queued chunk for playback");
        Ok(())
    }

    fn cancel(&self, utterance_id: UtteranceId) {
        debug!(utterance = %utterance_id, "Flushing playback buffer");
        let mut slot = self.resampler.lock();
        if let Some(resampler) = slot.as_mut()
            && let Err(e) = resampler.reset()
        {
            debug!("Dropping resampler: {}", e);
            *slot = None;
        }
        drop(slot);

        // Holding the producer keeps `accept` from queueing between the snapshot and the mark.
        let _producer = self.producer.lock();
        self.cursor.discard_queued();
    }

    /// Wait until the device has played everything queued so far.
    async fn end_of_utterance(&self, utterance_id: UtteranceId) -> crate::error::Result<()> {
        let target = self.cursor.pushed.load(Ordering::Acquire);
        while !self.cursor.reached(target) {
            tokio::time::sleep(RING_POLL).await;
        }
        debug!(utterance = %utterance_id, "Playback drained");
        Ok(())
    }
}

/// Pick an f32 mono or stereo configuration at `rate`, or at the nearest rate
/// the first usable range offers.
fn select_config(ranges: impl IntoIterator<Item = SupportedStreamConfigRange>, rate: u32) -> Result<SupportedStreamConfig> {
    let usable: Vec<SupportedStreamConfigRange> = ranges.into_iter().filter(|c| c.channels() <= 2 && c.sample_format() == SampleFormat::F32).collect();

    let range = usable
        .iter()
        .find(|c| (c.min_sample_rate()..=c.max_sample_rate()).contains(&rate))
        .or_else(|| usable.first())
        .context("No f32 mono or stereo output configuration")?;

    let rate = rate.clamp(range.min_sample_rate(), range.max_sample_rate());
    Ok(range.clone().with_sample_rate(rate))
}
