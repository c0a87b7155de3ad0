//! Audio error types

use thiserror::Error;

/// Errors produced while decoding, converting, transforming or encoding audio
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt audio stream: {0}")]
    Corrupt(String),

    #[error("No audio track found")]
    NoAudioTrack,

    #[error("Audio duration {actual_secs:.1}s exceeds maximum of {max_secs:.1}s")]
    DurationExceeded { actual_secs: f64, max_secs: f64 },

    #[error("Invalid audio buffer: {0}")]
    InvalidBuffer(String),

    #[error("Resampling failed: {0}")]
    Resample(String),

    #[error("Encoding failed: {0}")]
    Encode(String),

    #[error("Invalid transform parameters: {0}")]
    InvalidTransform(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;
