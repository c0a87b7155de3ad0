//! Mask estimation backends
//!
//! The `SeparationBackend` trait abstracts over mask estimators so the runner
//! and orchestrator never depend on a concrete model.
//!
//! ## Available Backends
//!
//! - **SpectralBackend**: built-in estimator (harmonic/percussive median
//!   filtering, vocal band weighting, stereo centre similarity). Needs no
//!   model file and is fully deterministic.
//! - **OrtBackend**: a mask network run through ONNX Runtime.
//!
//! The backend is selected at runtime via `ModelConfig::backend`.

mod onnx;
mod spectral;

pub use self::onnx::OrtBackend;
pub use self::spectral::{SpectralBackend, SpectralParams};

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use ndarray::{Array3, ArrayView3};
use realfft::num_complex::Complex32;
use unmix_core::stft::Spectrogram;

use crate::config::{BackendType, ModelConfig};
use crate::error::Result;
use crate::model::ModelManager;
use crate::stem::{Stem, StemSet};

/// Raw per-stem masks for one chunk, shaped `[channel, frame, bin]`
pub type ChunkMasks = BTreeMap<Stem, Array3<f32>>;

/// A frame range of a spectrogram handed to a backend
///
/// Covers the chunk's core frames plus its context on both sides.
#[derive(Debug, Clone)]
pub struct SpectrogramChunk<'a> {
    data: ArrayView3<'a, Complex32>,
    frames: Range<usize>,
    sample_rate: u32,
    window_size: usize,
}

impl<'a> SpectrogramChunk<'a> {
    /// Borrow `frames` of `spectrogram`
    pub fn new(spectrogram: &'a Spectrogram, frames: Range<usize>) -> Self {
        Self {
            data: spectrogram.frames(frames.clone()),
            frames,
            sample_rate: spectrogram.sample_rate(),
            window_size: spectrogram.window_size(),
        }
    }

    /// Complex bins, indexed `[channel, frame, bin]`
    pub fn data(&self) -> &ArrayView3<'a, Complex32> {
        &self.data
    }

    /// Position of this chunk in the full spectrogram
    pub fn frame_range(&self) -> Range<usize> {
        self.frames.clone()
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

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Centre frequency of a bin in Hz
    pub fn bin_frequency(&self, bin: usize) -> f32 {
        bin as f32 * self.sample_rate as f32 / self.window_size as f32
    }

    /// Magnitude grid
    pub fn magnitudes(&self) -> Array3<f32> {
        self.data.mapv(|c| c.norm())
    }
}

/// Trait for mask estimation backends
///
/// Implementations must be deterministic for a given chunk and hold only
/// read-only state, since one instance is shared by every concurrent job.
///
/// ## Implementing a New Backend
///
/// ```ignore
/// struct MyBackend;
///
/// impl SeparationBackend for MyBackend {
///     fn estimate(&self, chunk: &SpectrogramChunk<'_>, stems: &StemSet) -> Result<ChunkMasks> {
///         // One [channel, frame, bin] grid per requested stem, values in [0, 1]
///     }
///     fn name(&self) -> &'static str { "Mine" }
/// }
/// ```
pub trait SeparationBackend: Send + Sync {
    /// Estimate masks for the requested stems over one chunk
    ///
    /// Must return exactly the requested stems, each shaped like the chunk,
    /// with every value finite and in `[0, 1]`.
    fn estimate(&self, chunk: &SpectrogramChunk<'_>, stems: &StemSet) -> Result<ChunkMasks>;

    /// Frames of context needed on each side of a chunk
    fn context_frames(&self) -> usize {
        0
    }

    /// Get backend name for logging
    fn name(&self) -> &'static str;

    /// Check if this backend can run
    fn is_available(&self) -> bool {
        true
    }

    /// Get reason why backend is unavailable (if is_available() returns false)
    fn unavailable_reason(&self) -> Option<String> {
        None
    }
}

/// Build the configured backend
///
/// The ONNX backend resolves its model through the [`ModelManager`],
/// downloading it on first use when a URL is configured.
pub fn create_backend(config: &ModelConfig) -> Result<Arc<dyn SeparationBackend>> {
    match config.backend {
        BackendType::Spectral => Ok(Arc::new(SpectralBackend::with_params(config.spectral))),
        BackendType::Onnx => {
            let manager = ModelManager::for_config(&config.onnx)?;
            let model_path = manager.ensure_model(&config.onnx, None)?;
            Ok(Arc::new(OrtBackend::load(&model_path, &config.onnx)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unmix_core::stft;
    use unmix_core::AudioBuffer;

    #[test]
    fn test_chunk_view() {
        let buffer = AudioBuffer::silence(4000, 8000, 2).unwrap();
        let spec = stft::forward(&buffer, 256, 64).unwrap();
        let chunk = SpectrogramChunk::new(&spec, 10..30);
        assert_eq!(chunk.shape(), (2, 20, 129));
        assert_eq!(chunk.frame_range(), 10..30);
        assert!((chunk.bin_frequency(32) - 1000.0).abs() < 1e-3);
    }

    #[test]
    fn test_create_spectral_backend() {
        let backend = create_backend(&ModelConfig::default()).unwrap();
        assert_eq!(backend.name(), "Spectral");
        assert!(backend.is_available());
    }

    #[test]
    fn test_create_backend_applies_spectral_params() {
        let mut config = ModelConfig::default();
        config.spectral.time_kernel = 9;
        let backend = create_backend(&config).unwrap();
        assert_eq!(backend.context_frames(), 4);
    }
}
