//! Voice-note transcoding via ffmpeg.
//!
//! Telegram delivers voice notes as OGG Opus. The analysis pipeline wants
//! mono 16 kHz PCM: f32 samples for feature extraction and a WAV container
//! for the audio LLM endpoint.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

pub const TARGET_SAMPLE_RATE: u32 = 16_000;

static SPOOL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Spool file for one transcode call. Voice turns from different users run
/// concurrently, so the name must be unique per call, not per process.
fn spool_path() -> PathBuf {
    let n = SPOOL_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("gini_voice_{}_{}.oga", std::process::id(), n))
}

/// A voice note after conversion to mono 16 kHz PCM.
pub struct DecodedVoice {
    /// Samples normalized to [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// The same PCM wrapped in a WAV container, ready for base64 submission.
    pub wav: Vec<u8>,
}

#[derive(Debug)]
pub enum TranscodeError {
    Io(std::io::Error),
    Ffmpeg(String),
    EmptyOutput,
}

impl std::fmt::Display for TranscodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error during transcode: {e}"),
            Self::Ffmpeg(stderr) => write!(f, "ffmpeg failed: {stderr}"),
            Self::EmptyOutput => write!(f, "ffmpeg produced no audio"),
        }
    }
}

impl std::error::Error for TranscodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Convert OGG Opus voice data to mono 16 kHz PCM.
pub fn transcode_voice(ogg_data: &[u8]) -> Result<DecodedVoice, TranscodeError> {
    debug!("Transcoding {} bytes of voice audio", ogg_data.len());

    // ffmpeg needs a seekable input for OGG, so spool to a temp file.
    let input_path = spool_path();
    std::fs::write(&input_path, ogg_data).map_err(TranscodeError::Io)?;

    let output = Command::new("ffmpeg")
        .args([
            "-i",
            input_path.to_str().unwrap_or_default(),
            "-ar",
            "16000",
            "-ac",
            "1",
            "-f",
            "s16le",
            "-acodec",
            "pcm_s16le",
            "-y",
            "pipe:1",
        ])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .output();

    let _ = std::fs::remove_file(&input_path);
    let output = output.map_err(TranscodeError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TranscodeError::Ffmpeg(stderr.into_owned()));
    }
    if output.stdout.is_empty() {
        return Err(TranscodeError::EmptyOutput);
    }

    let samples: Vec<f32> = output
        .stdout
        .chunks_exact(2)
        .map(|chunk| {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            sample as f32 / 32768.0
        })
        .collect();

    let wav = wrap_wav(&output.stdout, TARGET_SAMPLE_RATE);
    debug!("Transcoded to {} samples", samples.len());

    Ok(DecodedVoice { samples, sample_rate: TARGET_SAMPLE_RATE, wav })
}

/// Wrap raw mono s16le PCM in a minimal WAV container.
fn wrap_wav(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
    let byte_rate = sample_rate * 2;
    let data_len = pcm.len() as u32;

    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spool_paths_are_unique_per_call() {
        // Concurrent transcodes must never share an input file, or one
        // user's audio could be overwritten or unlinked by another's turn.
        let a = spool_path();
        let b = spool_path();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wav_header_layout() {
        let pcm = vec![0u8; 320];
        let wav = wrap_wav(&pcm, 16_000);

        assert_eq!(wav.len(), 44 + 320);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(u32::from_le_bytes(wav[40..44].try_into().unwrap()), 320);
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 16_000);
        // mono, 16-bit
        assert_eq!(u16::from_le_bytes(wav[22..24].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(wav[34..36].try_into().unwrap()), 16);
    }
}
