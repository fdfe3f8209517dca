//! Audio sink contract and a channel-backed implementation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::chunk::AudioChunk;
use crate::error::{Result, SynthError};
use crate::synth::UtteranceId;

/// Consumer of synthesized audio.
///
/// Chunks of one utterance arrive in sequence order. `cancel` must discard any
/// audio of that utterance the sink still buffers.
#[async_trait]
pub trait AudioStreamSink: Send + Sync {
    /// Take ownership of a chunk. Resolving `Ok` means the chunk was delivered.
    ///
    /// Must be cancel-safe: a dropped future counts as not delivered.
    async fn accept(&self, chunk: AudioChunk) -> Result<()>;

    /// Drop buffered audio of `utterance_id`. Called at most once per utterance.
    fn cancel(&self, utterance_id: UtteranceId);

    /// All chunks of `utterance_id` have been delivered. Device sinks return once
    /// the audio has been played.
    async fn end_of_utterance(&self, utterance_id: UtteranceId) -> Result<()>;
}

/// Messages read from a [`SinkReceiver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    Chunk(AudioChunk),
    EndOfUtterance(UtteranceId),
    Cancelled(UtteranceId),
}

/// Sink that forwards audio over a bounded channel.
///
/// The channel capacity is the backpressure limit. Cancellation notices take a
/// separate lane so they overtake queued audio.
#[derive(Clone)]
pub struct ChannelSink {
    data_tx: mpsc::Sender<SinkMessage>,
    control_tx: mpsc::UnboundedSender<UtteranceId>,
    /// Utterances with ids below this are cancelled.
    watermark: Arc<AtomicU64>,
}

pub struct SinkReceiver {
    data_rx: mpsc::Receiver<SinkMessage>,
    control_rx: mpsc::UnboundedReceiver<UtteranceId>,
    watermark: Arc<AtomicU64>,
}

impl ChannelSink {
    /// Create a sink buffering at most `capacity` messages.
    pub fn new(capacity: usize) -> (Self, SinkReceiver) {
        let (data_tx, data_rx) = mpsc::channel(capacity.max(1));
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let watermark = Arc::new(AtomicU64::new(0));
        (Self { data_tx, control_tx, watermark: watermark.clone() }, SinkReceiver { data_rx, control_rx, watermark })
    }
}

#[async_trait]
impl AudioStreamSink for ChannelSink {
    async fn accept(&self, chunk: AudioChunk) -> Result<()> {
        self.data_tx.send(SinkMessage::Chunk(chunk)).await.map_err(|_| SynthError::Sink("audio receiver dropped".to_string()))
    }

    fn cancel(&self, utterance_id: UtteranceId) {
        self.watermark.fetch_max(utterance_id.0 + 1, Ordering::SeqCst);
        let _ = self.control_tx.send(utterance_id);
    }

    async fn end_of_utterance(&self, utterance_id: UtteranceId) -> Result<()> {
        self.data_tx.send(SinkMessage::EndOfUtterance(utterance_id)).await.map_err(|_| SynthError::Sink("audio receiver dropped".to_string()))
    }
}

impl SinkReceiver {
    /// Next message. Cancellation notices come first; audio of cancelled
    /// utterances still in the queue is dropped here.
    pub async fn recv(&mut self) -> Option<SinkMessage> {
        loop {
            tokio::select! {
                biased;
                Some(id) = self.control_rx.recv() => return Some(SinkMessage::Cancelled(id)),
                message = self.data_rx.recv() => {
                    let message = message?;
                    if self.is_stale(&message) {
                        debug!(?message, "Dropping audio of cancelled utterance");
                        continue;
                    }
                    return Some(message);
                }
            }
        }
    }

    fn is_stale(&self, message: &SinkMessage) -> bool {
        let id = match message {
            SinkMessage::Chunk(chunk) => chunk.utterance_id,
            SinkMessage::EndOfUtterance(id) => *id,
            SinkMessage::Cancelled(_) => return false,
        };
        id.0 < self.watermark.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: u64, seq: u64) -> AudioChunk {
        AudioChunk::from_samples(UtteranceId(id), seq, &[0.0; 8], 1.0, 22050)
    }

    #[tokio::test]
    async fn test_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.accept(chunk(1, 0)).await.unwrap();
        sink.accept(chunk(1, 1)).await.unwrap();
        sink.end_of_utterance(UtteranceId(1)).await.unwrap();

        assert!(matches!(rx.recv().await, Some(SinkMessage::Chunk(c)) if c.sequence_number == 0));
        assert!(matches!(rx.recv().await, Some(SinkMessage::Chunk(c)) if c.sequence_number == 1));
        assert_eq!(rx.recv().await, Some(SinkMessage::EndOfUtterance(UtteranceId(1))));
    }

    #[tokio::test]
    async fn test_cancel_overtakes_and_discards_buffered_audio() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.accept(chunk(1, 0)).await.unwrap();
        sink.accept(chunk(1, 1)).await.unwrap();
        sink.cancel(UtteranceId(1));
        sink.accept(chunk(2, 0)).await.unwrap();

        assert_eq!(rx.recv().await, Some(SinkMessage::Cancelled(UtteranceId(1))));
        assert!(matches!(rx.recv().await, Some(SinkMessage::Chunk(c)) if c.utterance_id == UtteranceId(2)));
    }

    #[tokio::test]
    async fn test_accept_fails_when_receiver_dropped() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        assert!(matches!(sink.accept(chunk(1, 0)).await, Err(SynthError::Sink(_))));
    }
}
