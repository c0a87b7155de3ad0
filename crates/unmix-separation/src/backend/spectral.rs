//! Built-in spectral mask estimator
//!
//! ```text
//! H = median over time  (kernel `time_kernel`)   sustained partials
//! P = median over freq  (kernel `freq_kernel`)   transients
//! Mh = H² / (H² + P² + ε),  Mp = P² / (H² + P² + ε)
//!
//! vocals       = Mh · band(f) · centre(t, f)
//! instrumental = 1 − vocals
//! drums        = Mp · (1 − vocals)
//! bass         = Mh · low(f) · (1 − vocals)
//! ```
//!
//! `band` weights the vocal range, `low` the bass range, both with linear
//! ramps at their edges. `centre` measures how much a bin is shared equally
//! by both stereo channels: `max(0, 2·Re(L·R*)) / (|L|² + |R|²)`, 1 for mono.
//! Every factor lies in `[0, 1]`, so every mask does too.

use ndarray::{Array2, Array3, ArrayView3, Axis};
use realfft::num_complex::Complex32;
use serde::{Deserialize, Serialize};

use super::{ChunkMasks, SeparationBackend, SpectrogramChunk};
use crate::error::Result;
use crate::stem::{Stem, StemSet};

/// Denominator floor for the soft masks
const EPSILON: f32 = 1e-10;

/// Fixed estimator parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralParams {
    /// Median kernel along time, in frames (odd)
    pub time_kernel: usize,
    /// Median kernel along frequency, in bins (odd)
    pub freq_kernel: usize,
    /// Vocal band corners in Hz: ramp up `[0]..[1]`, flat to `[2]`, ramp down to `[3]`
    pub vocal_band: [f32; 4],
    /// Bass band corners in Hz: flat to `[0]`, ramp down to `[1]`
    pub bass_band: [f32; 2],
}

impl Default for SpectralParams {
    fn default() -> Self {
        Self {
            time_kernel: 17,
            freq_kernel: 17,
            vocal_band: [100.0, 250.0, 6000.0, 12000.0],
            bass_band: [150.0, 300.0],
        }
    }
}

/// Deterministic mask estimator needing no model weights
#[derive(Debug, Clone, Default)]
pub struct SpectralBackend {
    params: SpectralParams,
}

impl SpectralParams {
    /// Force both median kernels to odd, non-zero lengths
    pub fn validate(&mut self) {
        self.time_kernel = self.time_kernel.clamp(1, 255) | 1;
        self.freq_kernel = self.freq_kernel.clamp(1, 255) | 1;
    }
}

impl SpectralBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(mut params: SpectralParams) -> Self {
        params.validate();
        Self { params }
    }

    pub fn params(&self) -> &SpectralParams {
        &self.params
    }

    fn vocal_weight(&self, freq: f32) -> f32 {
        let [lo_start, lo_end, hi_start, hi_end] = self.params.vocal_band;
        if freq < lo_start || freq > hi_end {
            0.0
        } else if freq < lo_end {
            (freq - lo_start) / (lo_end - lo_start)
        } else if freq <= hi_start {
            1.0
        } else {
            (hi_end - freq) / (hi_end - hi_start)
        }
    }

    fn bass_weight(&self, freq: f32) -> f32 {
        let [flat_end, cutoff] = self.params.bass_band;
        if freq <= flat_end {
            1.0
        } else if freq >= cutoff {
            0.0
        } else {
            (cutoff - freq) / (cutoff - flat_end)
        }
    }
}

impl SeparationBackend for SpectralBackend {
    fn estimate(&self, chunk: &SpectrogramChunk<'_>, stems: &StemSet) -> Result<ChunkMasks> {
        let magnitudes = chunk.magnitudes();
        let (channels, frames, bins) = magnitudes.dim();

        let harmonic = median_along(&magnitudes, Axis(1), self.params.time_kernel);
        let percussive = median_along(&magnitudes, Axis(2), self.params.freq_kernel);
        drop(magnitudes);

        let centre = centre_similarity(chunk.data());
        let vocal_band: Vec<f32> = (0..bins).map(|b| self.vocal_weight(chunk.bin_frequency(b))).collect();

        let mut harmonic_mask = Array3::<f32>::zeros((channels, frames, bins));
        let mut percussive_mask = Array3::<f32>::zeros((channels, frames, bins));
        let mut vocals = Array3::<f32>::zeros((channels, frames, bins));

        for ((c, t, f), v) in vocals.indexed_iter_mut() {
            let h2 = harmonic[[c, t, f]].powi(2);
            let p2 = percussive[[c, t, f]].powi(2);
            let total = h2 + p2 + EPSILON;
            let mh = h2 / total;
            harmonic_mask[[c, t, f]] = mh;
            percussive_mask[[c, t, f]] = p2 / total;
            *v = (mh * vocal_band[f] * centre[[t, f]]).clamp(0.0, 1.0);
        }

        let mut masks = ChunkMasks::new();
        for stem in stems {
            let mask = match stem {
                Stem::Vocals => vocals.clone(),
                Stem::Instrumental => vocals.mapv(|v| 1.0 - v),
                Stem::Drums => {
                    let mut drums = percussive_mask.clone();
                    drums.zip_mut_with(&vocals, |d, &v| *d = (*d * (1.0 - v)).clamp(0.0, 1.0));
                    drums
                }
                Stem::Bass => {
                    let low: Vec<f32> = (0..bins).map(|b| self.bass_weight(chunk.bin_frequency(b))).collect();
                    let mut bass = harmonic_mask.clone();
                    for ((_, _, f), b) in bass.indexed_iter_mut() {
                        *b *= low[f];
                    }
                    bass.zip_mut_with(&vocals, |b, &v| *b = (*b * (1.0 - v)).clamp(0.0, 1.0));
                    bass
                }
            };
            masks.insert(stem, mask);
        }

        log::debug!(
            "Spectral masks for frames {:?}: {} stems, {}x{}x{}",
            chunk.frame_range(),
            masks.len(),
            channels,
            frames,
            bins
        );
        Ok(masks)
    }

    fn context_frames(&self) -> usize {
        self.params.time_kernel / 2
    }

    fn name(&self) -> &'static str {
        "Spectral"
    }
}

/// Running median along one axis of a `[channel, frame, bin]` grid
///
/// The kernel is centred and truncated at the edges, so edge values are
/// the median of fewer elements.
fn median_along(grid: &Array3<f32>, axis: Axis, kernel: usize) -> Array3<f32> {
    let half = kernel / 2;
    let mut out = Array3::<f32>::zeros(grid.dim());
    let mut window: Vec<f32> = Vec::with_capacity(kernel);

    for (input, mut output) in grid.lanes(axis).into_iter().zip(out.lanes_mut(axis)) {
        let len = input.len();
        for i in 0..len {
            let start = i.saturating_sub(half);
            let end = (i + half + 1).min(len);
            window.clear();
            window.extend((start..end).map(|j| input[j]));
            let mid = window.len() / 2;
            let (_, median, _) = window.select_nth_unstable_by(mid, f32::total_cmp);
            output[i] = *median;
        }
    }
    out
}

/// Per-bin stereo centre similarity, shaped `[frame, bin]`
fn centre_similarity(data: &ArrayView3<'_, Complex32>) -> Array2<f32> {
    let (channels, frames, bins) = data.dim();
    if channels < 2 {
        return Array2::from_elem((frames, bins), 1.0);
    }

    Array2::from_shape_fn((frames, bins), |(t, f)| {
        let left = data[[0, t, f]];
        let right = data[[1, t, f]];
        let cross = 2.0 * (left * right.conj()).re;
        let power = left.norm_sqr() + right.norm_sqr();
        if power <= EPSILON {
            0.0
        } else {
            (cross.max(0.0) / power).clamp(0.0, 1.0)
        }
    })
}
