//! Driver configuration and CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::voices;
use crate::driver::DriverOptions;
use crate::synth::SchedulerOptions;
use crate::text::ResourcePaths;

/// Piper driver configuration.
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "piper-driver")]
#[command(author, version, about = "Piper speech synthesis driver with Persian text processing", long_about = None)]
pub struct DriverConfig {
    /// List the voices in the voice directory and exit
    #[arg(long)]
    pub list_voices: bool,

    /// Show detailed information about a specific voice and exit
    #[arg(long)]
    pub voice_info: Option<String>,

    /// Directory containing Piper voices (<id>.onnx + <id>.onnx.json)
    #[arg(long, short = 'd', env = "PIPER_VOICE_DIR", default_value_os_t = default_voice_dir())]
    pub voice_dir: PathBuf,

    /// Voice to use (defaults to the first voice found)
    #[arg(long)]
    pub voice: Option<String>,

    /// Speaker of a multi-speaker voice
    #[arg(long)]
    pub speaker: Option<u32>,

    /// Persian homograph dictionary (JSON)
    #[arg(long, env = "PIPER_HOMOGRAPH_DICT")]
    pub homograph_dict: Option<PathBuf>,

    /// Ezafe tagger model (JSON)
    #[arg(long, env = "PIPER_EZAFE_MODEL_PATH")]
    pub ezafe_model: Option<PathBuf>,

    /// Run homograph resolution and Ezafe insertion for Persian voices
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub persian_phonemizer: bool,

    /// Speaking rate (0-100, 50 = voice default speed)
    #[arg(long, default_value = "50", value_parser = parse_percent)]
    pub rate: u8,

    /// Pitch (0-100, 50 = neutral)
    #[arg(long, default_value = "50", value_parser = parse_percent)]
    pub pitch: u8,

    /// Volume (0-100)
    #[arg(long, default_value = "100", value_parser = parse_percent)]
    pub volume: u8,

    /// Inference blocks rendered ahead of playback
    #[arg(long, default_value = "4")]
    pub chunk_buffer: usize,

    /// Longest the audio sink may block a single chunk before the utterance fails (ms)
    #[arg(long, default_value = "2000")]
    pub sink_timeout_ms: u64,

    /// Number of inference threads (0 = auto-detect based on CPU cores)
    #[arg(long, default_value = "0")]
    pub inference_threads: usize,

    /// Write raw 16-bit PCM to this file instead of playing it
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Text to speak (read from stdin, one utterance per line, when omitted)
    pub text: Vec<String>,
}

impl DriverConfig {
    /// Parse configuration from command line arguments.
    pub fn from_args() -> Self {
        let mut config = Self::parse();

        if config.list_voices {
            voices::print_voices(&config.voice_dir);
            std::process::exit(0);
        }

        if let Some(ref voice_id) = config.voice_info {
            match voices::print_voice_info(&config.voice_dir, voice_id) {
                Ok(_) => std::process::exit(0),
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }

        config.normalize_thread_counts();
        config
    }

    /// Pick an inference thread count when none was given.
    ///
    /// On CPU this is cores/3, which leaves headroom for the screen reader and the
    /// audio callback. With CUDA a single thread feeds the GPU.
    pub fn normalize_thread_counts(&mut self) {
        let cpu_cores = num_cpus::get();

        if self.inference_threads == 0 {
            self.inference_threads = if cfg!(feature = "cuda") { 1 } else { (cpu_cores / 3).max(1) };
        }

        if self.verbose {
            info!("CPU cores: {}, inference threads: {}", cpu_cores, self.inference_threads);
        }
    }

    /// Paths of the linguistic resources.
    pub fn resource_paths(&self) -> ResourcePaths {
        ResourcePaths { homograph_dict: self.homograph_dict.clone(), ezafe_model: self.ezafe_model.clone(), persian_enabled: self.persian_phonemizer }
    }

    /// Options for [`SynthDriver::new`](crate::driver::SynthDriver::new).
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            voice_dir: self.voice_dir.clone(),
            default_voice: self.voice.clone(),
            speaker: self.speaker,
            resources: self.resource_paths(),
            scheduler: SchedulerOptions { chunk_buffer: self.chunk_buffer, sink_timeout: Duration::from_millis(self.sink_timeout_ms) },
            rate: self.rate,
            pitch: self.pitch,
            volume: self.volume,
        }
    }

    /// Validate the configuration.
    ///
    /// Missing linguistic resources are not errors; the driver degrades instead.
    pub fn validate(&self) -> Result<()> {
        if !self.voice_dir.is_dir() {
            anyhow::bail!("Voice directory does not exist: {}", self.voice_dir.display());
        }

        if let Some(ref voice) = self.voice {
            let model = self.voice_dir.join(format!("{}.onnx", voice));
            if !model.is_file() {
                anyhow::bail!("Voice model not found: {}", model.display());
            }
        }

        if self.chunk_buffer == 0 {
            anyhow::bail!("Chunk buffer must hold at least one block");
        }

        if self.sink_timeout_ms == 0 {
            anyhow::bail!("Sink timeout must be positive");
        }

        if let Some(ref output) = self.output
            && let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty())
            && !parent.is_dir()
        {
            anyhow::bail!("Output directory does not exist: {}", parent.display());
        }

        Ok(())
    }

    /// Log the current configuration.
    pub fn log_config(&self) {
        info!("Configuration:");
        info!("  Voice directory: {}", self.voice_dir.display());
        info!("  Voice: {}", self.voice.as_deref().unwrap_or("(first available)"));
        if let Some(speaker) = self.speaker {
            info!("  Speaker: {}", speaker);
        }
        info!("  Persian phonemizer: {}", self.persian_phonemizer);
        info!("  Homograph dictionary: {}", display_optional(&self.homograph_dict));
        info!("  Ezafe model: {}", display_optional(&self.ezafe_model));
        info!("  Rate/pitch/volume: {}/{}/{}", self.rate, self.pitch, self.volume);
        info!("  Chunk buffer: {} blocks", self.chunk_buffer);
        info!("  Sink timeout: {}ms", self.sink_timeout_ms);
        info!("  Inference threads: {}", self.inference_threads);
        if let Some(ref output) = self.output {
            info!("  Output file: {}", output.display());
        }
    }
}

fn display_optional(path: &Option<PathBuf>) -> String {
    path.as_ref().map_or_else(|| "(none)".to_string(), |p| p.display().to_string())
}

/// Get the default voice directory (~/.piper-driver/voices).
pub fn default_voice_dir() -> PathBuf {
    if let Some(home_dir) = dirs::home_dir() {
        home_dir.join(".piper-driver").join("voices")
    } else {
        PathBuf::from("voices")
    }
}

/// Parse and validate a host setting (0-100).
fn parse_percent(s: &str) -> Result<u8, String> {
    let value: u8 = s.parse().map_err(|_| format!("'{}' is not a valid integer", s))?;
    if value <= 100 { Ok(value) } else { Err(format!("value must be between 0 and 100, got {}", value)) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DriverConfig::parse_from(["piper-driver", "--voice-dir", "/tmp"]);
        assert!(config.persian_phonemizer);
        assert_eq!((config.rate, config.pitch, config.volume), (50, 50, 100));
        assert_eq!(config.chunk_buffer, 4);
        assert_eq!(config.sink_timeout_ms, 2000);
        assert!(config.text.is_empty());
    }

    #[test]
    fn test_persian_phonemizer_can_be_disabled() {
        let config = DriverConfig::parse_from(["piper-driver", "--voice-dir", "/tmp", "--persian-phonemizer", "false", "سلام"]);
        assert!(!config.persian_phonemizer);
        assert!(!config.resource_paths().persian_enabled);
        assert_eq!(config.text, vec!["سلام".to_string()]);
    }

    #[test]
    fn test_percent_out_of_range_rejected() {
        assert!(DriverConfig::try_parse_from(["piper-driver", "--rate", "101"]).is_err());
        assert_eq!(parse_percent("0"), Ok(0));
        assert!(parse_percent("abc").is_err());
    }

    #[test]
    fn test_thread_count_auto() {
        let mut config = DriverConfig::parse_from(["piper-driver", "--voice-dir", "/tmp"]);
        config.normalize_thread_counts();
        assert!(config.inference_threads >= 1);
    }

    #[test]
    fn test_driver_options() {
        let config = DriverConfig::parse_from(["piper-driver", "--voice-dir", "/tmp", "--chunk-buffer", "2", "--sink-timeout-ms", "150", "--voice", "fa_IR-amir"]);
        let options = config.driver_options();
        assert_eq!(options.scheduler.chunk_buffer, 2);
        assert_eq!(options.scheduler.sink_timeout, Duration::from_millis(150));
        assert_eq!(options.default_voice.as_deref(), Some("fa_IR-amir"));
    }

    #[test]
    fn test_validate_rejects_missing_dir() {
        let config = DriverConfig::parse_from(["piper-driver", "--voice-dir", "/definitely/not/here"]);
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let config = DriverConfig::parse_from(["piper-driver", "--voice-dir", dir.path().to_str().unwrap()]);
        assert!(config.validate().is_ok());
    }
}
