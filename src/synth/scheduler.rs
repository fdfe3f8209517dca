//! Single-slot utterance scheduler.
//!
//! One background task runs the active utterance through preprocessing,
//! inference and delivery. A new `speak` preempts whatever is still in flight:
//! the old utterance moves to `Cancelling`, its token fires, and every await in
//! the worker observes it at the next stage boundary or inference block.
//!
//! Inference runs on the blocking pool and pushes blocks into a bounded channel,
//! so at most `chunk_buffer` blocks are rendered ahead of the sink. Pause gates
//! delivery only.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipeline::SynthesisPipeline;
use super::utterance::{DriverEvent, Outcome, PipelineState, SpeakRequest, Utterance, UtteranceId};
use crate::audio::{AudioChunk, AudioStreamSink, TextMarker};
use crate::error::{Result, SynthError};
use crate::text::{PhonemeSequence, sentence_ids};
use crate::tts::SynthesisParams;
use crate::voice::{VoiceLease, VoiceRegistry};

/// How long `shutdown` waits for the worker to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Buffering and timeout knobs.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    /// Inference blocks rendered ahead of delivery.
    pub chunk_buffer: usize,
    /// Longest a single `accept` or `end_of_utterance` may take.
    pub sink_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self { chunk_buffer: 4, sink_timeout: Duration::from_millis(2000) }
    }
}

enum Command {
    Speak { utterance: Utterance, cancel: CancellationToken },
    Shutdown,
}

struct Slot {
    state: PipelineState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Slots {
    active: Option<UtteranceId>,
    inflight: HashMap<UtteranceId, Slot>,
}

/// One rendered inference block.
struct Rendered {
    samples: Vec<f32>,
    sentence: usize,
    /// First block of its sentence.
    first: bool,
    /// Last block of its sentence.
    sentence_end: bool,
    /// Last block of the utterance.
    last: bool,
}

/// Byte range of the source text a sentence covers.
#[derive(Debug, Clone, Copy)]
struct SentenceSpan {
    start: usize,
    end: usize,
}

struct Shared {
    registry: Arc<VoiceRegistry>,
    pipeline: SynthesisPipeline,
    sink: Arc<dyn AudioStreamSink>,
    events: mpsc::UnboundedSender<DriverEvent>,
    slots: Mutex<Slots>,
    paused: watch::Sender<bool>,
    options: SchedulerOptions,
}

/// Owns the active utterance slot and sequences chunk delivery.
pub struct UtteranceScheduler {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl UtteranceScheduler {
    /// Start the scheduler and its worker task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Returns
    /// The scheduler and the receiver of [`DriverEvent`]s.
    pub fn new(
        registry: Arc<VoiceRegistry>,
        pipeline: SynthesisPipeline,
        sink: Arc<dyn AudioStreamSink>,
        options: SchedulerOptions,
    ) -> (Self, mpsc::UnboundedReceiver<DriverEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (paused, _) = watch::channel(false);

        let shared = Arc::new(Shared { registry, pipeline, sink, events, slots: Mutex::new(Slots::default()), paused, options });
        let worker = tokio::spawn(run_worker(shared.clone(), command_rx));

        let scheduler = Self { shared, commands, next_id: AtomicU64::new(1), worker: Mutex::new(Some(worker)) };
        (scheduler, event_rx)
    }

    /// Admit a request, preempting any utterance still in flight. Never blocks.
    pub fn speak(&self, request: SpeakRequest) -> UtteranceId {
        let id = UtteranceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let utterance = Utterance::new(id, request);
        let cancel = CancellationToken::new();

        debug!(utterance = %id, voice = %utterance.voice_id, chars = utterance.text.chars().count(), "Utterance admitted");

        {
            let mut slots = self.shared.slots.lock();
            let superseded: Vec<UtteranceId> = slots.inflight.keys().copied().collect();
            for old in superseded {
                self.shared.begin_cancel(&mut slots, old);
            }
            slots.inflight.insert(id, Slot { state: PipelineState::Idle, cancel: cancel.clone() });
            slots.active = Some(id);
        }

        if self.commands.send(Command::Speak { utterance, cancel }).is_err() {
            self.shared.finish(id, Err(SynthError::ShutDown));
        }
        id
    }

    /// Cancel one utterance. Idempotent; returns `false` for terminal or unknown ids.
    pub fn cancel(&self, id: UtteranceId) -> bool {
        let mut slots = self.shared.slots.lock();
        self.shared.begin_cancel(&mut slots, id)
    }

    /// Cancel the active utterance, if any.
    pub fn cancel_current(&self) -> Option<UtteranceId> {
        let mut slots = self.shared.slots.lock();
        let id = slots.active?;
        self.shared.begin_cancel(&mut slots, id).then_some(id)
    }

    /// Hold delivery to the sink. Inference keeps filling the chunk buffer.
    pub fn pause(&self) {
        if !self.shared.paused.send_replace(true) {
            debug!("Delivery paused");
        }
    }

    pub fn resume(&self) {
        if self.shared.paused.send_replace(false) {
            debug!("Delivery resumed");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.shared.paused.borrow()
    }

    /// The active utterance and its state.
    pub fn current(&self) -> Option<(UtteranceId, PipelineState)> {
        let slots = self.shared.slots.lock();
        let id = slots.active?;
        slots.inflight.get(&id).map(|slot| (id, slot.state))
    }

    /// State of a non-terminal utterance.
    pub fn state(&self, id: UtteranceId) -> Option<PipelineState> {
        self.shared.slots.lock().inflight.get(&id).map(|slot| slot.state)
    }

    /// Cancel everything in flight and stop the worker.
    pub async fn shutdown(&self) {
        self.shared.cancel_all();
        let _ = self.commands.send(Command::Shutdown);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && tokio::time::timeout(SHUTDOWN_GRACE, worker).await.is_err()
        {
            warn!("Synthesis worker did not stop within {:?}", SHUTDOWN_GRACE);
        }
    }
}

impl Drop for UtteranceScheduler {
    fn drop(&mut self) {
        self.shared.cancel_all();
        let _ = self.commands.send(Command::Shutdown);
    }
}

async fn run_worker(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Speak { utterance, cancel } => {
                let result = shared.run(&utterance, &cancel).await;
                shared.finish(utterance.id, result);
            }
            Command::Shutdown => break,
        }
    }

    commands.close();
    while let Ok(command) = commands.try_recv() {
        if let Command::Speak { utterance, .. } = command {
            shared.finish(utterance.id, Err(SynthError::ShutDown));
        }
    }
    debug!("Synthesis worker stopped");
}

impl Shared {
    fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, utterance_id: UtteranceId, state: PipelineState) {
        self.emit(DriverEvent::StateChanged { utterance_id, state });
    }

    /// Move a non-terminal utterance to `Cancelling` and fire its token.
    fn begin_cancel(&self, slots: &mut Slots, id: UtteranceId) -> bool {
        let Some(slot) = slots.inflight.get_mut(&id) else {
            return false;
        };
        if slot.state != PipelineState::Cancelling {
            debug!(utterance = %id, from = %slot.state, "Cancelling utterance");
            slot.state = PipelineState::Cancelling;
            slot.cancel.cancel();
            self.emit_state(id, PipelineState::Cancelling);
        }
        true
    }

    fn cancel_all(&self) {
        let mut slots = self.slots.lock();
        let ids: Vec<UtteranceId> = slots.inflight.keys().copied().collect();
        for id in ids {
            self.begin_cancel(&mut slots, id);
        }
    }

    /// Advance an utterance unless it is being cancelled.
    fn transition(&self, id: UtteranceId, state: PipelineState) -> Result<()> {
        let mut slots = self.slots.lock();
        match slots.inflight.get_mut(&id) {
            Some(slot) if slot.state != PipelineState::Cancelling => {
                slot.state = state;
                self.emit_state(id, state);
                Ok(())
            }
            _ => Err(SynthError::Cancelled),
        }
    }

    async fn run(&self, utterance: &Utterance, cancel: &CancellationToken) -> Result<()> {
        self.transition(utterance.id, PipelineState::Preprocessing)?;
        self.load_voice(&utterance.voice_id, cancel).await?;
        let voice = self.registry.acquire(&utterance.voice_id)?;
        let phonemes = self.pipeline.prepare(&utterance.text, &voice, cancel)?;

        self.transition(utterance.id, PipelineState::Synthesizing)?;
        self.stream(utterance, voice, phonemes, cancel).await
    }

    /// Register a voice that is not loaded yet, off the async threads.
    async fn load_voice(&self, voice_id: &str, cancel: &CancellationToken) -> Result<()> {
        if self.registry.is_loaded(voice_id) {
            return Ok(());
        }

        debug!(voice = voice_id, "Loading voice on first use");
        let registry = self.registry.clone();
        let id = voice_id.to_string();
        let loading = tokio::task::spawn_blocking(move || registry.ensure(&id));
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SynthError::Cancelled),
            loaded = loading => match loaded {
                Ok(voice) => voice.map(|_| ()),
                Err(e) => Err(SynthError::voice_load(voice_id, format!("loader task failed: {}", e))),
            },
        }
    }

    /// Render sentence by sentence and forward the blocks as chunks.
    async fn stream(&self, utterance: &Utterance, voice: VoiceLease, phonemes: PhonemeSequence, cancel: &CancellationToken) -> Result<()> {
        let sentences = phonemes.sentences();
        let spans: Vec<SentenceSpan> = sentences
            .iter()
            .map(|s| SentenceSpan { start: s.first().map_or(0, |p| p.span.start), end: s.last().map_or(0, |p| p.span.end) })
            .collect();
        let plan: Vec<Vec<i64>> = sentences.iter().map(|s| sentence_ids(s, voice.metadata())).collect();

        let params = SynthesisPipeline::params(&voice, utterance);
        let sample_rate = voice.sample_rate();
        let volume = utterance.prosody.volume;

        debug!(utterance = %utterance.id, sentences = plan.len(), length_scale = params.length_scale, "Starting inference");

        let (tx, mut rx) = mpsc::channel(self.options.chunk_buffer.max(1));
        let producer_cancel = cancel.clone();
        let producer = tokio::task::spawn_blocking(move || render(voice, plan, params, tx, producer_cancel));

        let mut bookmarks = utterance.bookmarks.iter().peekable();
        let mut sequence = 0u64;
        let mut final_sent = false;

        loop {
            let rendered = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                rendered = rx.recv() => match rendered {
                    Some(rendered) => rendered,
                    None => break,
                },
            };

            if sequence == 0 {
                self.transition(utterance.id, PipelineState::Streaming)?;
            }

            let span = spans[rendered.sentence];
            let mut markers = Vec::new();
            if rendered.first {
                markers.push(TextMarker { text_offset: span.start, bookmark: None });
            }
            if rendered.sentence_end {
                while let Some(bookmark) = bookmarks.next_if(|b| rendered.last || b.text_offset <= span.end) {
                    markers.push(TextMarker { text_offset: bookmark.text_offset, bookmark: Some(bookmark.index) });
                }
            }

            let mut chunk = AudioChunk::from_samples(utterance.id, sequence, &rendered.samples, volume, sample_rate);
            chunk.is_final = rendered.last;
            chunk.text_markers = markers;
            self.deliver(chunk, cancel).await?;

            if sequence == 0 {
                info!("⚡ First audio for {} after {} ms", utterance.id, utterance.requested_at.elapsed().as_millis());
            }
            sequence += 1;
            final_sent = rendered.last;
        }

        if cancel.is_cancelled() {
            return Err(SynthError::Cancelled);
        }

        drop(rx);
        producer.await.map_err(|e| SynthError::Inference(format!("inference task failed: {}", e)))??;

        if !final_sent {
            if sequence == 0 {
                self.transition(utterance.id, PipelineState::Streaming)?;
            }
            let mut chunk = AudioChunk::from_samples(utterance.id, sequence, &[], volume, sample_rate);
            chunk.is_final = true;
            chunk.text_markers = bookmarks.map(|b| TextMarker { text_offset: b.text_offset, bookmark: Some(b.index) }).collect();
            self.deliver(chunk, cancel).await?;
            sequence += 1;
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SynthError::Cancelled),
            drained = tokio::time::timeout(self.options.sink_timeout, self.sink.end_of_utterance(utterance.id)) => match drained {
                Ok(result) => result?,
                Err(_) => return Err(SynthError::SinkBackpressureTimeout(self.options.sink_timeout)),
            },
        }

        debug!(utterance = %utterance.id, chunks = sequence, "All chunks delivered");
        Ok(())
    }

    /// Hand one chunk to the sink, honoring pause, cancellation and the timeout.
    /// Index events for the chunk's markers follow a successful accept.
    async fn deliver(&self, chunk: AudioChunk, cancel: &CancellationToken) -> Result<()> {
        let mut paused = self.paused.subscribe();
        while *paused.borrow_and_update() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SynthError::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Err(SynthError::ShutDown);
                    }
                }
            }
        }

        let utterance_id = chunk.utterance_id;
        let markers = chunk.text_markers.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SynthError::Cancelled),
            accepted = tokio::time::timeout(self.options.sink_timeout, self.sink.accept(chunk)) => match accepted {
                Ok(result) => result?,
                Err(_) => return Err(SynthError::SinkBackpressureTimeout(self.options.sink_timeout)),
            },
        }

        for marker in markers {
            self.emit(DriverEvent::IndexReached { utterance_id, text_offset: marker.text_offset, bookmark: marker.bookmark });
        }
        Ok(())
    }

    /// Publish the terminal events of an utterance and release its slot.
    fn finish(&self, id: UtteranceId, result: Result<()>) {
        let mut slots = self.slots.lock();
        let cancelling = slots.inflight.get(&id).is_some_and(|slot| slot.state == PipelineState::Cancelling);

        match result {
            _ if cancelling => {
                self.sink.cancel(id);
                self.emit_state(id, PipelineState::Idle);
                self.emit(DriverEvent::UtteranceDone { utterance_id: id, outcome: Outcome::Cancelled });
                debug!(utterance = %id, "Utterance cancelled");
            }
            Err(SynthError::Cancelled) => {
                self.begin_cancel(&mut slots, id);
                self.sink.cancel(id);
                self.emit_state(id, PipelineState::Idle);
                self.emit(DriverEvent::UtteranceDone { utterance_id: id, outcome: Outcome::Cancelled });
            }
            Ok(()) => {
                self.emit_state(id, PipelineState::Completed);
                self.emit(DriverEvent::UtteranceDone { utterance_id: id, outcome: Outcome::Completed });
                debug!(utterance = %id, "Utterance completed");
            }
            Err(e) => {
                let kind = e.kind();
                warn!("❌ Utterance {} failed: {}", id, e);
                self.emit(DriverEvent::Error { utterance_id: id, kind, message: e.to_string() });

                if matches!(e, SynthError::SinkBackpressureTimeout(_)) {
                    self.begin_cancel(&mut slots, id);
                    self.sink.cancel(id);
                    self.emit_state(id, PipelineState::Idle);
                } else {
                    self.emit_state(id, PipelineState::Completed);
                }
                self.emit(DriverEvent::UtteranceDone { utterance_id: id, outcome: Outcome::Failed(kind) });
            }
        }

        slots.inflight.remove(&id);
        if slots.active == Some(id) {
            slots.active = None;
        }
    }
}

/// Run inference on the blocking pool, one call per sentence.
///
/// Stops early when `cancel` fires or the receiver is gone.
fn render(
    voice: VoiceLease,
    plan: Vec<Vec<i64>>,
    params: SynthesisParams,
    tx: mpsc::Sender<Rendered>,
    cancel: CancellationToken,
) -> Result<()> {
    let count = plan.len();
    for (sentence, ids) in plan.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(SynthError::Cancelled);
        }

        let mut first = true;
        let mut closed = false;
        voice.model().synthesize(ids, &params, &mut |block| {
            if cancel.is_cancelled() {
                return ControlFlow::Break(());
            }
            let rendered = Rendered { sentence, first, sentence_end: block.last, last: block.last && sentence + 1 == count, samples: block.samples };
            first = false;
            if tx.blocking_send(rendered).is_err() {
                closed = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        })?;

        if closed {
            break;
        }
    }
    Ok(())
}
