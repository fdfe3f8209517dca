//! Piper Driver - speaks text through a Piper voice.
//!
//! Stands in for the screen reader: text comes from the command line or from
//! stdin (one utterance per line), audio goes to the speakers or to a raw PCM
//! file, and driver events are logged as they arrive.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::LocalTime;

use piper_driver::SynthDriver;
use piper_driver::audio::{AudioStreamSink, ChannelSink, SinkMessage, SinkReceiver};
use piper_driver::config::DriverConfig;
use piper_driver::synth::{DriverEvent, Outcome, UtteranceId};
use piper_driver::tts::InferenceEngine;

/// Create the inference engine for the enabled features.
fn create_engine(config: &DriverConfig) -> Arc<dyn InferenceEngine> {
    #[cfg(feature = "onnx")]
    {
        Arc::new(piper_driver::tts::PiperOnnxEngine::new(config.inference_threads))
    }

    #[cfg(not(feature = "onnx"))]
    {
        let _ = config;
        warn!("Built without the 'onnx' feature, rendering silence");
        Arc::new(piper_driver::tts::SilenceEngine::default())
    }
}

/// Create the audio sink: the output device, or a channel drained to a file.
///
/// # Returns
/// The sink and, for the channel sink, the join handle of its writer task
fn create_sink(config: &DriverConfig) -> Result<(Arc<dyn AudioStreamSink>, Option<JoinHandle<()>>)> {
    #[cfg(feature = "playback")]
    {
        if config.output.is_none() {
            let player = piper_driver::audio::DevicePlayer::new()?;
            return Ok((Arc::new(player), None));
        }
    }

    if config.output.is_none() {
        warn!("No output file and no playback device support, audio is discarded");
    }

    let (sink, receiver) = ChannelSink::new(config.chunk_buffer);
    let writer = spawn_writer_task(receiver, config.output.clone());
    Ok((Arc::new(sink), Some(writer)))
}

/// Spawn the task that drains the channel sink into the output file.
///
/// # Arguments
/// * `receiver` - Receiving end of the channel sink
/// * `output` - File to append raw PCM to (discarded when `None`)
///
/// # Returns
/// Join handle for the spawned task
fn spawn_writer_task(mut receiver: SinkReceiver, output: Option<PathBuf>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut file = match output {
            Some(ref path) => match tokio::fs::File::create(path).await {
                Ok(file) => Some(file),
                Err(e) => {
                    error!("❌ Cannot create {}: {}", path.display(), e);
                    None
                }
            },
            None => None,
        };

        let mut written = 0usize;
        while let Some(message) = receiver.recv().await {
            match message {
                SinkMessage::Chunk(chunk) => {
                    if let Some(ref mut file) = file
                        && let Err(e) = file.write_all(&chunk.pcm).await
                    {
                        error!("❌ Failed to write audio: {}", e);
                        break;
                    }
                    written += chunk.pcm.len();
                    debug!("Chunk {} of {}: {} samples at {} Hz", chunk.sequence_number, chunk.utterance_id, chunk.sample_count(), chunk.sample_rate);
                }
                SinkMessage::EndOfUtterance(id) => debug!("End of {}", id),
                SinkMessage::Cancelled(id) => debug!("Discarded audio of {}", id),
            }
        }

        if let Some(ref mut file) = file
            && let Err(e) = file.flush().await
        {
            error!("❌ Failed to flush audio: {}", e);
        }
        debug!("Audio writer finished ({} bytes)", written);
    })
}

/// Spawn the task that logs driver events and forwards utterance outcomes.
///
/// # Arguments
/// * `events` - Driver event receiver
/// * `done_tx` - Channel to send finished utterances
///
/// # Returns
/// Join handle for the spawned task
fn spawn_event_task(mut events: mpsc::UnboundedReceiver<DriverEvent>, done_tx: mpsc::UnboundedSender<(UtteranceId, Outcome)>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::StateChanged { utterance_id, state } => debug!("{} → {}", utterance_id, state),
                DriverEvent::IndexReached { utterance_id, text_offset, bookmark } => match bookmark {
                    Some(index) => info!("📍 {} reached index {} (offset {})", utterance_id, index, text_offset),
                    None => debug!("{} at offset {}", utterance_id, text_offset),
                },
                DriverEvent::Error { utterance_id, kind, message } => error!("❌ {} failed ({}): {}", utterance_id, kind, message),
                DriverEvent::UtteranceDone { utterance_id, outcome } => {
                    match outcome {
                        Outcome::Completed => info!("✅ {} done", utterance_id),
                        Outcome::Cancelled => info!("⏹️  {} cancelled", utterance_id),
                        Outcome::Failed(kind) => warn!("⚠️  {} failed: {}", utterance_id, kind),
                    }
                    if done_tx.send((utterance_id, outcome)).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

/// Speak every input line in turn, waiting for each to finish.
async fn speak_all(driver: &SynthDriver, config: &DriverConfig, done_rx: &mut mpsc::UnboundedReceiver<(UtteranceId, Outcome)>, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut lines = if config.text.is_empty() { None } else { Some(vec![config.text.join(" ")].into_iter()) };
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    while !shutdown.load(Ordering::Relaxed) {
        let text = match lines {
            Some(ref mut lines) => match lines.next() {
                Some(text) => text,
                None => break,
            },
            None => match stdin.next_line().await.context("Failed to read stdin")? {
                Some(text) => text,
                None => break,
            },
        };

        if text.trim().is_empty() {
            continue;
        }

        let id = driver.speak(&text, None, config.rate, config.pitch, config.volume);
        info!("🗣️  Speaking {}: \"{}\"", id, text);

        while let Some((done, _)) = done_rx.recv().await {
            if done == id {
                break;
            }
        }
    }

    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn wait_for_shutdown(shutdown: Arc<AtomicBool>) {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("🛑 Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        warn!("Failed to register SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("🛑 Received SIGTERM, shutting down...");
        }
    }

    shutdown.store(true, Ordering::SeqCst);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let config = DriverConfig::from_args();

    // Respect RUST_LOG env var, fallback to verbose flag, default to info
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| if config.verbose { EnvFilter::try_new("debug") } else { EnvFilter::try_new("info") })
        .context("Invalid log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(LocalTime::new(time::macros::format_description!("[hour]:[minute]:[second]")))
        .with_writer(std::io::stderr)
        .init();

    info!("🔊 Piper Driver v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("❌ Configuration error: {}", e);
        error!("Put Piper voices (<id>.onnx + <id>.onnx.json) in the voice directory or pass --voice-dir.");
        std::process::exit(1);
    }
    config.log_config();

    let engine = create_engine(&config);
    let (sink, writer_handle) = create_sink(&config)?;
    let (driver, events) = SynthDriver::new(engine, sink, config.driver_options())?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let event_handle = spawn_event_task(events, done_tx);

    let shutdown = Arc::new(AtomicBool::new(false));

    tokio::select! {
        result = speak_all(&driver, &config, &mut done_rx, shutdown.clone()) => {
            if let Err(e) = result {
                error!("❌ {}", e);
            }
        }
        _ = wait_for_shutdown(shutdown.clone()) => {
            driver.cancel();
        }
    }

    driver.terminate().await;
    drop(driver);

    // Give tasks a moment to drain before exiting
    let graceful_timeout = tokio::time::Duration::from_millis(500);

    tokio::select! {
        _ = event_handle => {
            debug!("Event task finished gracefully");
        }
        _ = tokio::time::sleep(graceful_timeout) => {
            debug!("Event task didn't finish in time");
        }
    }

    if let Some(writer_handle) = writer_handle {
        tokio::select! {
            _ = writer_handle => {
                debug!("Audio writer finished gracefully");
            }
            _ = tokio::time::sleep(graceful_timeout) => {
                debug!("Audio writer didn't finish in time");
            }
        }
    }

    info!("✅ Piper driver stopped");
    Ok(())
}
