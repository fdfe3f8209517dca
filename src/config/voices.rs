//! Voice listing for the command line.

use std::path::Path;

use crate::driver::{VoiceInfo, list_voices};
use crate::voice::{VoiceMetadata, VoiceRegistry};

/// Print all voices found in `dir`, grouped by language.
pub fn print_voices(dir: &Path) {
    let voices = list_voices(dir);

    println!("═══════════════════════════════════════════════════════════════════");
    println!("  Piper voices in {}", dir.display());
    println!("═══════════════════════════════════════════════════════════════════");

    if voices.is_empty() {
        println!();
        println!("No voices found. A voice is a <id>.onnx model with its <id>.onnx.json config.");
        return;
    }

    let mut languages: Vec<&str> = voices.iter().map(|v| v.language.as_str()).collect();
    languages.sort_unstable();
    languages.dedup();

    for lang in languages {
        let lang_voices: Vec<&VoiceInfo> = voices.iter().filter(|v| v.language == lang).collect();

        println!("\n── {} ({} voices) ──", lang, lang_voices.len());
        println!("{:<30} {:<8} SPEAKERS", "VOICE", "RATE");
        println!("{}", "─".repeat(50));

        for voice in lang_voices {
            println!("{:<30} {:<8} {}", voice.id, voice.sample_rate, voice.speakers.len().max(1));
        }
    }

    println!("\n{}\n", "─".repeat(70));
    println!("Usage:");
    println!("  ./piper-driver --voice <id> \"text to speak\"");
    println!("  ./piper-driver --voice <id> --speaker <n> \"text to speak\"");
}

/// Print detailed information about a specific voice.
pub fn print_voice_info(dir: &Path, voice_id: &str) -> anyhow::Result<()> {
    let descriptor = VoiceRegistry::scan(dir)
        .into_iter()
        .find(|d| d.id == voice_id)
        .ok_or_else(|| anyhow::anyhow!("Voice '{}' not found. Run with --list-voices to see available voices", voice_id))?;
    let metadata = VoiceMetadata::from_file(voice_id, &descriptor.metadata_path)?;
    let validation = metadata.validate(voice_id);

    println!();
    println!("Voice: {}", voice_id);
    println!("{}", "─".repeat(40));
    println!("Model:         {}", descriptor.model_path.display());
    println!("Language:      {}", metadata.language_tag());
    println!("Sample rate:   {} Hz", metadata.audio.sample_rate);
    println!("Phonemes:      {}", metadata.phoneme_id_map.len());
    println!("Fallback:      {}", metadata.fallback_phoneme());
    println!(
        "Inference:     noise {} / length {} / noise_w {}",
        metadata.inference.noise_scale, metadata.inference.length_scale, metadata.inference.noise_w
    );
    for speaker in metadata.speakers() {
        println!("Speaker {:<5} {}", speaker.id, speaker.name);
    }
    if let Err(e) = validation {
        println!("Invalid:       {}", e);
    }
    println!();
    println!("Usage:");
    println!("  ./piper-driver --voice {}", voice_id);
    println!();

    Ok(())
}
