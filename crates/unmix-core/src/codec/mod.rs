//! Audio container handling
//!
//! Decoding goes through Symphonia, which sniffs the actual container; the
//! declared format is only used as a probe hint and to enforce the allowed
//! upload set. Encoding writes output stems as WAV (hound) or FLAC (flacenc).

mod decode;
mod encode;

pub use decode::{decode, probe, AudioInfo, DecodeLimits};
pub use encode::{encode, BitDepth, OutputContainer, OutputFormat};

use serde::{Deserialize, Serialize};

use crate::error::{AudioError, Result};

/// Upload containers accepted by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Mp3,
    Wav,
    M4a,
    Flac,
}

impl AudioFormat {
    /// All supported upload formats
    pub const ALL: [AudioFormat; 4] = [
        AudioFormat::Mp3,
        AudioFormat::Wav,
        AudioFormat::M4a,
        AudioFormat::Flac,
    ];

    /// Canonical file extension (also used as the Symphonia probe hint)
    pub fn extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Wav => "wav",
            AudioFormat::M4a => "m4a",
            AudioFormat::Flac => "flac",
        }
    }

    /// Parse a file extension (case-insensitive, with or without leading dot)
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "mp3" => Some(AudioFormat::Mp3),
            "wav" | "wave" => Some(AudioFormat::Wav),
            "m4a" | "mp4" | "aac" => Some(AudioFormat::M4a),
            "flac" => Some(AudioFormat::Flac),
            _ => None,
        }
    }

    /// Determine the format from a declared upload filename
    pub fn from_filename(filename: &str) -> Result<Self> {
        let ext = std::path::Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .ok_or_else(|| {
                AudioError::UnsupportedFormat(format!("'{}' has no file extension", filename))
            })?;
        Self::from_extension(ext)
            .ok_or_else(|| AudioError::UnsupportedFormat(format!("'.{}' files are not supported", ext)))
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}
