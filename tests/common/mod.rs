//! Shared fixtures for the integration tests: a scriptable mock engine, voice
//! files on disk and event/audio collectors.

#![allow(dead_code)]

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use piper_driver::audio::{ChannelSink, SinkMessage, SinkReceiver};
use piper_driver::synth::{DriverEvent, Outcome, PipelineState, SchedulerOptions, SynthesisPipeline, UtteranceId, UtteranceScheduler};
use piper_driver::text::{ResourceManager, ResourcePaths};
use piper_driver::tts::{InferenceEngine, PcmBlock, SynthesisParams, VoiceModel};
use piper_driver::voice::{VoiceMetadata, VoiceRegistry};
use piper_driver::{Result, SynthError};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

pub const LATIN_VOICE: &str = "en_US-test";
pub const LATIN: &[&str] = &["a", "b", "c", "."];

const WAIT: Duration = Duration::from_secs(5);

// ── Mock engine ────────────────────────────────────────────────────

/// Blocks inference until opened. Gives up after a few seconds so a forgotten
/// gate cannot hang the runtime on shutdown.
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { open: Mutex::new(false), cond: Condvar::new() })
    }

    pub fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self) {
        let deadline = Instant::now() + WAIT;
        let mut open = self.open.lock();
        while !*open {
            if self.cond.wait_until(&mut open, deadline).timed_out() {
                break;
            }
        }
    }
}

/// Engine emitting a fixed number of constant blocks per sentence.
#[derive(Clone)]
pub struct MockEngine {
    blocks: usize,
    block_len: usize,
    block_delay: Duration,
    fail_after: Option<usize>,
    gate: Option<Arc<Gate>>,
    emitted: Arc<AtomicUsize>,
}

impl MockEngine {
    pub fn new(blocks: usize, block_len: usize) -> Self {
        Self { blocks, block_len, block_delay: Duration::ZERO, fail_after: None, gate: None, emitted: Arc::new(AtomicUsize::new(0)) }
    }

    /// Fail once this many blocks have been emitted in total.
    pub fn failing_after(mut self, blocks: usize) -> Self {
        self.fail_after = Some(blocks);
        self
    }

    /// Wait for `gate` before rendering each sentence.
    pub fn gated(mut self, gate: Arc<Gate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_block_delay(mut self, delay: Duration) -> Self {
        self.block_delay = delay;
        self
    }
}

impl InferenceEngine for MockEngine {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn load(&self, _voice_id: &str, _model_path: &Path, _metadata: &VoiceMetadata) -> Result<Arc<dyn VoiceModel>> {
        Ok(Arc::new(self.clone()))
    }
}

impl VoiceModel for MockEngine {
    fn synthesize(&self, _phoneme_ids: &[i64], _params: &SynthesisParams, emit: &mut dyn FnMut(PcmBlock) -> ControlFlow<()>) -> Result<()> {
        if let Some(ref gate) = self.gate {
            gate.wait();
        }

        for block in 0..self.blocks {
            if let Some(limit) = self.fail_after
                && self.emitted.load(Ordering::SeqCst) >= limit
            {
                return Err(SynthError::Inference("mock model failure".to_string()));
            }
            if !self.block_delay.is_zero() {
                std::thread::sleep(self.block_delay);
            }
            self.emitted.fetch_add(1, Ordering::SeqCst);

            let samples = vec![0.25; self.block_len];
            if emit(PcmBlock { samples, last: block + 1 == self.blocks }).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }
}

// ── Voice fixtures ─────────────────────────────────────────────────

/// Write `<id>.onnx` and `<id>.onnx.json` into `dir`.
///
/// The phoneme set is the Piper control symbols, a word separator and `symbols`.
pub fn write_voice(dir: &Path, id: &str, language: &str, symbols: &[&str], num_speakers: u32) -> PathBuf {
    let mut map = serde_json::Map::new();
    for (index, symbol) in ["_", "^", "$", " "].iter().chain(symbols.iter()).enumerate() {
        map.insert(symbol.to_string(), serde_json::json!([index]));
    }
    let metadata = serde_json::json!({
        "audio": { "sample_rate": 22050, "quality": "low" },
        "espeak": { "voice": language },
        "num_speakers": num_speakers,
        "phoneme_id_map": map,
    });

    let model_path = dir.join(format!("{}.onnx", id));
    std::fs::write(&model_path, b"mock model").unwrap();
    std::fs::write(dir.join(format!("{}.onnx.json", id)), metadata.to_string()).unwrap();
    model_path
}

// ── Scheduler harness ──────────────────────────────────────────────

pub struct Harness {
    pub scheduler: UtteranceScheduler,
    pub events: UnboundedReceiver<DriverEvent>,
    pub audio: SinkReceiver,
    pub registry: Arc<VoiceRegistry>,
    _dir: TempDir,
}

/// Scheduler over a single Latin voice and a channel sink of `capacity`.
pub fn harness(engine: MockEngine, capacity: usize, options: SchedulerOptions) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    write_voice(dir.path(), LATIN_VOICE, "en-us", LATIN, 1);

    let registry = Arc::new(VoiceRegistry::new(Arc::new(engine)));
    assert_eq!(registry.register_dir(dir.path()).len(), 1);

    let resources = Arc::new(ResourceManager::init(ResourcePaths::default()));
    let (sink, audio) = ChannelSink::new(capacity);
    let (scheduler, events) = UtteranceScheduler::new(registry.clone(), SynthesisPipeline::new(resources), Arc::new(sink), options);

    Harness { scheduler, events, audio, registry, _dir: dir }
}

// ── Collectors ─────────────────────────────────────────────────────

/// Receive events until `id` finishes. Returns everything received and the outcome.
pub async fn wait_done(events: &mut UnboundedReceiver<DriverEvent>, id: UtteranceId) -> (Vec<DriverEvent>, Outcome) {
    let mut received = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv()).await.expect("timed out waiting for events").expect("event channel closed");
        let done = match event {
            DriverEvent::UtteranceDone { utterance_id, outcome } if utterance_id == id => Some(outcome),
            _ => None,
        };
        received.push(event);
        if let Some(outcome) = done {
            return (received, outcome);
        }
    }
}

/// Receive events until `id` reaches `state`.
pub async fn wait_state(events: &mut UnboundedReceiver<DriverEvent>, id: UtteranceId, state: PipelineState) -> Vec<DriverEvent> {
    let mut received = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv()).await.expect("timed out waiting for state").expect("event channel closed");
        let reached = event == DriverEvent::StateChanged { utterance_id: id, state };
        received.push(event);
        if reached {
            return received;
        }
    }
}

/// States `id` went through, in order.
pub fn states_of(events: &[DriverEvent], id: UtteranceId) -> Vec<PipelineState> {
    events
        .iter()
        .filter_map(|e| match e {
            DriverEvent::StateChanged { utterance_id, state } if *utterance_id == id => Some(*state),
            _ => None,
        })
        .collect()
}

/// Host bookmarks reported for `id`, in order.
pub fn bookmarks_of(events: &[DriverEvent], id: UtteranceId) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            DriverEvent::IndexReached { utterance_id, bookmark: Some(index), .. } if *utterance_id == id => Some(*index),
            _ => None,
        })
        .collect()
}

/// Read sink messages until `id` ends or is cancelled.
pub async fn audio_until_end(audio: &mut SinkReceiver, id: UtteranceId) -> Vec<SinkMessage> {
    let mut received = Vec::new();
    loop {
        let message = tokio::time::timeout(WAIT, audio.recv()).await.expect("timed out waiting for audio").expect("sink closed");
        let end = matches!(message, SinkMessage::EndOfUtterance(end) if end == id);
        received.push(message);
        if end {
            return received;
        }
    }
}

/// Read sink messages until none arrives for `quiet`.
pub async fn drain_audio(audio: &mut SinkReceiver, quiet: Duration) -> Vec<SinkMessage> {
    let mut received = Vec::new();
    while let Ok(Some(message)) = tokio::time::timeout(quiet, audio.recv()).await {
        received.push(message);
    }
    received
}

/// Sequence numbers of the chunks of `id`.
pub fn sequence_of(messages: &[SinkMessage], id: UtteranceId) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|m| match m {
            SinkMessage::Chunk(chunk) if chunk.utterance_id == id => Some(chunk.sequence_number),
            _ => None,
        })
        .collect()
}
