//! Audio chunks delivered to sinks.

use std::time::Duration;

use crate::synth::UtteranceId;

/// Text position attached to a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextMarker {
    /// Byte offset into the utterance text.
    pub text_offset: usize,
    /// Host index marker, if this position came from one.
    pub bookmark: Option<u32>,
}

/// A slice of synthesized audio: mono, signed 16-bit little-endian PCM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub utterance_id: UtteranceId,
    /// Position within the utterance, starting at 0 with no gaps.
    pub sequence_number: u64,
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    /// Set on exactly one chunk, the last of a completed utterance.
    pub is_final: bool,
    pub text_markers: Vec<TextMarker>,
}

impl AudioChunk {
    /// Encode float samples with `volume` applied.
    pub fn from_samples(utterance_id: UtteranceId, sequence_number: u64, samples: &[f32], volume: f32, sample_rate: u32) -> Self {
        let mut pcm = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            let value = (sample * volume).clamp(-1.0, 1.0) * f32::from(i16::MAX);
            pcm.extend_from_slice(&(value as i16).to_le_bytes());
        }
        Self { utterance_id, sequence_number, pcm, sample_rate, is_final: false, text_markers: Vec::new() }
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.sample_count() as f64 / f64::from(self.sample_rate))
    }

    /// Decode to float samples for playback.
    pub fn samples_f32(&self) -> Vec<f32> {
        self.pcm.chunks_exact(2).map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / f32::from(i16::MAX)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_and_clipping() {
        let chunk = AudioChunk::from_samples(UtteranceId(1), 0, &[0.5, 2.0, -2.0], 0.5, 22050);
        assert_eq!(chunk.sample_count(), 3);
        let pcm: Vec<i16> = chunk.pcm.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
        assert_eq!(pcm, vec![8191, 32767, -32767]);
    }

    #[test]
    fn test_duration() {
        let chunk = AudioChunk::from_samples(UtteranceId(1), 0, &[0.0; 11025], 1.0, 22050);
        assert_eq!(chunk.duration(), Duration::from_millis(500));
    }
}
