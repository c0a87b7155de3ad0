//! Complex spectrogram container

use std::ops::Range;

use ndarray::{s, Array3, ArrayView3};
use realfft::num_complex::Complex32;

use crate::error::{AudioError, Result};

/// Multi-channel complex spectrogram
///
/// Indexed `[channel, frame, bin]`. Carries the transform parameters and the
/// original sample count so the inverse transform can trim edge padding back
/// to the exact input length.
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    data: Array3<Complex32>,
    window_size: usize,
    hop_size: usize,
    sample_rate: u32,
    sample_count: usize,
}

impl Spectrogram {
    /// Number of frames produced for `sample_count` input frames
    ///
    /// Input is padded by `window / 2` zeros on both sides before framing, so
    /// this equals `ceil((padded - window) / hop) + 1` with
    /// `padded = sample_count + window`.
    pub fn frame_count(sample_count: usize, window_size: usize, hop_size: usize) -> usize {
        let padded = sample_count + window_size;
        (padded - window_size).div_ceil(hop_size) + 1
    }

    /// Number of frequency bins for a real-input transform
    pub fn bin_count(window_size: usize) -> usize {
        window_size / 2 + 1
    }

    /// Wrap raw spectral data, checking the grid matches the parameters
    pub fn from_parts(
        data: Array3<Complex32>,
        window_size: usize,
        hop_size: usize,
        sample_rate: u32,
        sample_count: usize,
    ) -> Result<Self> {
        let (_, frames, bins) = data.dim();
        let expected_frames = Self::frame_count(sample_count, window_size, hop_size);
        let expected_bins = Self::bin_count(window_size);
        if frames != expected_frames || bins != expected_bins {
            return Err(AudioError::InvalidTransform(format!(
                "spectrogram is {}x{} but {} samples at window {} / hop {} need {}x{}",
                frames, bins, sample_count, window_size, hop_size, expected_frames, expected_bins
            )));
        }
        Ok(Self {
            data,
            window_size,
            hop_size,
            sample_rate,
            sample_count,
        })
    }

    /// Same parameters with a different grid of identical shape
    pub fn with_data(&self, data: Array3<Complex32>) -> Result<Self> {
        if data.dim() != self.data.dim() {
            return Err(AudioError::InvalidTransform(format!(
                "replacement grid {:?} does not match {:?}",
                data.dim(),
                self.data.dim()
            )));
        }
        Ok(Self {
            data,
            window_size: self.window_size,
            hop_size: self.hop_size,
            sample_rate: self.sample_rate,
            sample_count: self.sample_count,
        })
    }

    pub fn data(&self) -> &Array3<Complex32> {
        &self.data
    }

    /// `(channels, frames, bins)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn channels(&self) -> usize {
        self.data.dim().0
    }

    pub fn num_frames(&self) -> usize {
        self.data.dim().1
    }

    pub fn num_bins(&self) -> usize {
        self.data.dim().2
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Original input length in sample frames
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Centre frequency of a bin in Hz
    pub fn bin_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.sample_rate as f32 / self.window_size as f32
    }

    /// View of a frame range across all channels and bins
    pub fn frames(&self, range: Range<usize>) -> ArrayView3<'_, Complex32> {
        self.data.slice(s![.., range, ..])
    }

    /// Magnitude grid
    pub fn magnitudes(&self) -> Array3<f32> {
        self.data.mapv(|c| c.norm())
    }
}
