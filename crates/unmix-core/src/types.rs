//! Common types for Unmix
//!
//! The fundamental audio container passed between pipeline stages.

use serde::{Deserialize, Serialize};

use crate::error::{AudioError, Result};

/// Sample rate the separation model expects by default
pub const MODEL_SAMPLE_RATE: u32 = 44100;

/// Audio sample type (32-bit float for processing)
pub type Sample = f32;

/// Channel layout required by a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelLayout {
    Mono,
    #[default]
    Stereo,
}

impl ChannelLayout {
    /// Number of channels in this layout
    pub fn count(&self) -> u16 {
        match self {
            ChannelLayout::Mono => 1,
            ChannelLayout::Stereo => 2,
        }
    }

    /// Layout matching a channel count, if there is one
    pub fn from_count(channels: u16) -> Option<Self> {
        match channels {
            1 => Some(ChannelLayout::Mono),
            2 => Some(ChannelLayout::Stereo),
            _ => None,
        }
    }
}

/// Interleaved floating-point audio
///
/// Sample rate and channel count are fixed at construction; there are no
/// setters, so a buffer never changes format during its lifetime. Conversions
/// (resampling, up/downmixing) always produce a new buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    samples: Vec<Sample>,
    sample_rate: u32,
    channels: u16,
}

impl AudioBuffer {
    /// Create a buffer from interleaved samples
    ///
    /// Fails if the format is degenerate or the sample count is not a whole
    /// number of frames.
    pub fn from_interleaved(samples: Vec<Sample>, sample_rate: u32, channels: u16) -> Result<Self> {
        if sample_rate == 0 {
            return Err(AudioError::InvalidBuffer("sample rate must be non-zero".to_string()));
        }
        if channels == 0 {
            return Err(AudioError::InvalidBuffer("channel count must be non-zero".to_string()));
        }
        if samples.len() % channels as usize != 0 {
            return Err(AudioError::InvalidBuffer(format!(
                "{} samples is not a multiple of {} channels",
                samples.len(),
                channels
            )));
        }
        Ok(Self {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Create a buffer from one sample vector per channel
    pub fn from_planar(planes: Vec<Vec<Sample>>, sample_rate: u32) -> Result<Self> {
        let channels = planes.len();
        if channels == 0 {
            return Err(AudioError::InvalidBuffer("no channels given".to_string()));
        }
        let frames = planes[0].len();
        if planes.iter().any(|p| p.len() != frames) {
            return Err(AudioError::InvalidBuffer(
                "planar channels have different lengths".to_string(),
            ));
        }

        let mut samples = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            for plane in &planes {
                samples.push(plane[i]);
            }
        }
        Self::from_interleaved(samples, sample_rate, channels as u16)
    }

    /// Create a silent buffer
    pub fn silence(frames: usize, sample_rate: u32, channels: u16) -> Result<Self> {
        Self::from_interleaved(vec![0.0; frames * channels as usize], sample_rate, channels)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Channel layout, if the channel count maps to one
    pub fn layout(&self) -> Option<ChannelLayout> {
        ChannelLayout::from_count(self.channels)
    }

    /// Interleaved samples
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Consume the buffer, returning the interleaved samples
    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    /// Number of sample frames (samples per channel)
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Total sample count (all channels)
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds
    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Extract one channel as a contiguous vector
    pub fn channel(&self, index: usize) -> Vec<Sample> {
        let channels = self.channels as usize;
        if index >= channels {
            return Vec::new();
        }
        self.samples
            .iter()
            .skip(index)
            .step_by(channels)
            .copied()
            .collect()
    }

    /// De-interleave into one vector per channel
    pub fn to_planar(&self) -> Vec<Vec<Sample>> {
        (0..self.channels as usize).map(|ch| self.channel(ch)).collect()
    }

    /// Largest absolute sample value
    pub fn peak(&self) -> Sample {
        self.samples.iter().fold(0.0, |acc, s| acc.max(s.abs()))
    }
}
