//! Streaming sample-rate conversion from a voice's rate to the device rate.

use anyhow::{Context, Result};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{Fft, FixedSync, Resampler};

/// Input frames per FFT block.
const BLOCK_FRAMES: usize = 1024;

const SUB_CHUNKS: usize = 2;

/// Converts consecutive chunks of one utterance to the device rate.
///
/// Input that does not fill a whole FFT block is held back for the next chunk,
/// so only the tail of an utterance is padded.
pub struct ChunkResampler {
    from_rate: u32,
    to_rate: u32,
    /// `None` when the rates already match.
    fft: Option<Fft<f32>>,
    pending: Vec<f32>,
    scratch: Vec<f32>,
}

impl ChunkResampler {
    /// # Errors
    /// Returns an error if rubato rejects the rate pair.
    pub fn new(from_rate: u32, to_rate: u32) -> Result<Self> {
        let fft = if from_rate == to_rate { None } else { Some(build(from_rate, to_rate)?) };
        let scratch = vec![0.0; fft.as_ref().map_or(0, |f| f.output_frames_max())];
        Ok(Self { from_rate, to_rate, fft, pending: Vec::with_capacity(BLOCK_FRAMES * 2), scratch })
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    /// Convert `samples`, returning every whole block that is now available.
    pub fn process(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        let Some(fft) = self.fft.as_mut() else {
            return Ok(samples.to_vec());
        };

        self.pending.extend_from_slice(samples);
        let blocks = self.pending.len() / BLOCK_FRAMES;
        let mut out = Vec::with_capacity(blocks * self.scratch.len());
        for block in self.pending.chunks_exact(BLOCK_FRAMES) {
            convert(fft, block, &mut self.scratch, &mut out)?;
        }
        self.pending.drain(..blocks * BLOCK_FRAMES);
        Ok(out)
    }

    /// Pad and convert the held-back tail, then start over for the next utterance.
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        let mut out = Vec::new();
        if let Some(fft) = self.fft.as_mut()
            && !self.pending.is_empty()
        {
            let mut block = std::mem::take(&mut self.pending);
            block.resize(BLOCK_FRAMES, 0.0);
            convert(fft, &block, &mut self.scratch, &mut out)?;
        }
        self.reset()?;
        Ok(out)
    }

    /// Drop held-back input and filter state.
    pub fn reset(&mut self) -> Result<()> {
        self.pending.clear();
        if self.fft.is_some() {
            self.fft = Some(build(self.from_rate, self.to_rate)?);
        }
        Ok(())
    }
}

fn build(from_rate: u32, to_rate: u32) -> Result<Fft<f32>> {
    Fft::<f32>::new(from_rate as usize, to_rate as usize, BLOCK_FRAMES, SUB_CHUNKS, 1, FixedSync::Input).context("Failed to create resampler")
}

fn convert(fft: &mut Fft<f32>, block: &[f32], scratch: &mut [f32], out: &mut Vec<f32>) -> Result<()> {
    let frames = scratch.len();
    let input = InterleavedSlice::new(block, 1, BLOCK_FRAMES).context("Failed to create input adapter")?;
    let mut output = InterleavedSlice::new_mut(scratch, 1, frames).context("Failed to create output adapter")?;
    let (_, written) = fft.process_into_buffer(&input, &mut output, None).map_err(|e| anyhow::anyhow!("Resampling error: {}", e))?;
    out.extend_from_slice(&scratch[..written]);
    Ok(())
}
