//! Short-time Fourier transform
//!
//! ## Framing
//!
//! ```text
//! padded:  [ w/2 zeros | input (n samples) | zeros up to last frame end ]
//! frame 0: [=====w=====]
//! frame 1:    [=====w=====]          hop h between frame starts
//! ...
//! frames = ceil(n / h) + 1
//! ```
//!
//! ## Reconstruction
//!
//! Weighted overlap-add with the same window for analysis and synthesis:
//!
//! ```text
//! x[n] = Σ_k w[n - kh] · ifft(X_k)[n - kh] / Σ_k w²[n - kh]
//! ```
//!
//! The leading half-window of padding guarantees every input sample sits
//! within half a hop of some frame centre, so the denominator never
//! collapses and an untouched spectrogram reconstructs to floating-point
//! precision.

mod spectrogram;
mod window;

pub use spectrogram::Spectrogram;
pub use window::{hann, WindowKind};

use std::sync::Arc;

use ndarray::{Array3, ArrayView3};
use realfft::num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::error::{AudioError, Result};
use crate::types::AudioBuffer;

/// Denominator floor for overlap-add normalization
const WINDOW_SUM_EPSILON: f32 = 1e-8;

/// Reusable forward/inverse transform for one (window, hop) pair
///
/// Holds the FFT plans and window coefficients so repeated transforms do not
/// re-plan. Plans are immutable; a processor can be shared across threads.
pub struct StftProcessor {
    window_size: usize,
    hop_size: usize,
    window: Vec<f32>,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
}

impl std::fmt::Debug for StftProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StftProcessor")
            .field("window_size", &self.window_size)
            .field("hop_size", &self.hop_size)
            .finish()
    }
}

impl StftProcessor {
    /// Create a processor
    ///
    /// The window must be even and at least 4 samples; the hop must lie in
    /// `1..=window`.
    pub fn new(window_size: usize, hop_size: usize) -> Result<Self> {
        validate_params(window_size, hop_size)?;

        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(window_size);
        let inverse = planner.plan_fft_inverse(window_size);
        let window = WindowKind::for_hop(window_size, hop_size).coefficients(window_size);

        Ok(Self {
            window_size,
            hop_size,
            window,
            forward,
            inverse,
        })
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Analyse a buffer into a complex spectrogram (one grid per channel)
    pub fn forward(&self, buffer: &AudioBuffer) -> Result<Spectrogram> {
        let n = self.window_size;
        let hop = self.hop_size;
        let pad = n / 2;
        let sample_count = buffer.frames();
        let num_frames = Spectrogram::frame_count(sample_count, n, hop);
        let num_bins = Spectrogram::bin_count(n);
        let padded_len = (num_frames - 1) * hop + n;
        let channels = buffer.channels() as usize;

        let mut data = Array3::from_elem((channels, num_frames, num_bins), Complex32::new(0.0, 0.0));

        let mut padded = vec![0.0f32; padded_len];
        let mut frame_buf = self.forward.make_input_vec();
        let mut spectrum = self.forward.make_output_vec();
        let mut scratch = self.forward.make_scratch_vec();

        for ch in 0..channels {
            padded.iter_mut().for_each(|s| *s = 0.0);
            for (dst, src) in padded[pad..pad + sample_count]
                .iter_mut()
                .zip(buffer.samples().iter().skip(ch).step_by(channels))
            {
                *dst = *src;
            }

            for frame in 0..num_frames {
                let start = frame * hop;
                for (i, sample) in frame_buf.iter_mut().enumerate() {
                    *sample = padded[start + i] * self.window[i];
                }

                self.forward
                    .process_with_scratch(&mut frame_buf, &mut spectrum, &mut scratch)
                    .map_err(|e| AudioError::InvalidTransform(format!("FFT failed: {:?}", e)))?;

                for (bin, value) in spectrum.iter().enumerate() {
                    data[[ch, frame, bin]] = *value;
                }
            }
        }

        Spectrogram::from_parts(data, n, hop, buffer.sample_rate(), sample_count)
    }

    /// Reconstruct audio from a spectrogram produced with the same parameters
    ///
    /// The result has exactly `spectrogram.sample_count()` frames.
    pub fn inverse(&self, spectrogram: &Spectrogram) -> Result<AudioBuffer> {
        self.synthesize(spectrogram, None)
    }

    /// Reconstruct audio from a spectrogram weighted by a real mask
    ///
    /// Equivalent to masking a copy of the spectrogram and inverting it, but
    /// the mask is applied one frame at a time so no second full-length
    /// grid is allocated. `mask` must have the spectrogram's shape.
    pub fn inverse_masked(&self, spectrogram: &Spectrogram, mask: ArrayView3<'_, f32>) -> Result<AudioBuffer> {
        if mask.dim() != spectrogram.shape() {
            return Err(AudioError::InvalidTransform(format!(
                "mask {:?} does not match spectrogram {:?}",
                mask.dim(),
                spectrogram.shape()
            )));
        }
        self.synthesize(spectrogram, Some(mask))
    }

    fn synthesize(&self, spectrogram: &Spectrogram, mask: Option<ArrayView3<'_, f32>>) -> Result<AudioBuffer> {
        if spectrogram.window_size() != self.window_size || spectrogram.hop_size() != self.hop_size {
            return Err(AudioError::InvalidTransform(format!(
                "spectrogram uses window {} / hop {}, processor uses {} / {}",
                spectrogram.window_size(),
                spectrogram.hop_size(),
                self.window_size,
                self.hop_size
            )));
        }

        let n = self.window_size;
        let hop = self.hop_size;
        let pad = n / 2;
        let (channels, num_frames, _) = spectrogram.shape();
        let sample_count = spectrogram.sample_count();
        let padded_len = (num_frames - 1) * hop + n;
        let scale = 1.0 / n as f32;

        // Window normalization is identical for every channel
        let mut window_sum = vec![0.0f32; padded_len];
        for frame in 0..num_frames {
            let start = frame * hop;
            for (i, w) in self.window.iter().enumerate() {
                window_sum[start + i] += w * w;
            }
        }

        let mut spectrum = self.inverse.make_input_vec();
        let mut time_frame = self.inverse.make_output_vec();
        let mut scratch = self.inverse.make_scratch_vec();
        let mut output = vec![0.0f32; padded_len];
        let mut planes = Vec::with_capacity(channels);

        for ch in 0..channels {
            output.iter_mut().for_each(|s| *s = 0.0);

            for frame in 0..num_frames {
                for (bin, value) in spectrum.iter_mut().enumerate() {
                    *value = spectrogram.data()[[ch, frame, bin]];
                }
                if let Some(mask) = &mask {
                    for (bin, value) in spectrum.iter_mut().enumerate() {
                        *value *= mask[[ch, frame, bin]];
                    }
                }
                // DC and Nyquist must be purely real for a real-valued output
                let last = spectrum.len() - 1;
                spectrum[0].im = 0.0;
                spectrum[last].im = 0.0;

                self.inverse
                    .process_with_scratch(&mut spectrum, &mut time_frame, &mut scratch)
                    .map_err(|e| AudioError::InvalidTransform(format!("IFFT failed: {:?}", e)))?;

                let start = frame * hop;
                for (i, (sample, w)) in time_frame.iter().zip(&self.window).enumerate() {
                    output[start + i] += sample * scale * w;
                }
            }

            let plane: Vec<f32> = (pad..pad + sample_count)
                .map(|i| {
                    if window_sum[i] > WINDOW_SUM_EPSILON {
                        output[i] / window_sum[i]
                    } else {
                        0.0
                    }
                })
                .collect();
            planes.push(plane);
        }

        AudioBuffer::from_planar(planes, spectrogram.sample_rate())
    }
}

fn validate_params(window_size: usize, hop_size: usize) -> Result<()> {
    if window_size < 4 || window_size % 2 != 0 {
        return Err(AudioError::InvalidTransform(format!(
            "window size must be even and at least 4, got {}",
            window_size
        )));
    }
    if hop_size == 0 || hop_size > window_size {
        return Err(AudioError::InvalidTransform(format!(
            "hop size must be in 1..={}, got {}",
            window_size, hop_size
        )));
    }
    Ok(())
}

/// Forward transform with a one-off processor
pub fn forward(buffer: &AudioBuffer, window_size: usize, hop_size: usize) -> Result<Spectrogram> {
    StftProcessor::new(window_size, hop_size)?.forward(buffer)
}

/// Inverse transform using the parameters carried by the spectrogram
pub fn inverse(spectrogram: &Spectrogram) -> Result<AudioBuffer> {
    StftProcessor::new(spectrogram.window_size(), spectrogram.hop_size())?.inverse(spectrogram)
}

/// Inverse transform with explicit parameters
///
/// `window_size` and `hop_size` must match the ones the spectrogram was
/// produced with.
pub fn inverse_with(spectrogram: &Spectrogram, window_size: usize, hop_size: usize) -> Result<AudioBuffer> {
    StftProcessor::new(window_size, hop_size)?.inverse(spectrogram)
}
