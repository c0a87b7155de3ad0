//! Mask assembly, masking and reconstruction
//!
//! ## Chunk cross-fade
//!
//! ```text
//! chunk k      [ctx|====== core ======|ctx]
//! chunk k+1                     [ctx|====== core ======|ctx]
//!                               |<- 2·ctx ->|
//! weight k     1 1 1 ... 1 1 1   \ \ \ \ \ \
//! weight k+1                     / / / / / /   1 1 1 ...
//! ```
//!
//! Over the duplicated context the two estimates are blended with linear
//! ramps that sum to one at every frame, so the assembled mask is a convex
//! combination of backend output and stays in `[0, 1]`.

use std::collections::BTreeMap;

use ndarray::{s, Array3, Axis, Zip};
use unmix_core::stft::{Spectrogram, StftProcessor};
use unmix_core::AudioBuffer;

use crate::backend::ChunkMasks;
use crate::error::{Result, SeparationError};
use crate::job::CancelToken;
use crate::runner::ChunkRange;
use crate::stem::{Stem, StemSet};

/// Real-valued mask over a spectrogram, every value in `[0, 1]`
#[derive(Debug, Clone, PartialEq)]
pub struct SeparationMask {
    data: Array3<f32>,
}

impl SeparationMask {
    /// Wrap a grid, rejecting non-finite or out-of-range values
    pub fn new(data: Array3<f32>) -> Result<Self> {
        if let Some(bad) = data.iter().find(|v| !v.is_finite() || **v < 0.0 || **v > 1.0) {
            return Err(SeparationError::Model(format!(
                "mask value {} outside [0, 1]",
                bad
            )));
        }
        Ok(Self { data })
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    /// `(channels, frames, bins)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn into_inner(self) -> Array3<f32> {
        self.data
    }
}

/// One mask per requested stem
pub type MaskSet = BTreeMap<Stem, SeparationMask>;

/// Multiply a spectrogram element-wise by a mask
pub fn apply(spectrogram: &Spectrogram, mask: &SeparationMask) -> Result<Spectrogram> {
    if spectrogram.shape() != mask.shape() {
        return Err(SeparationError::Internal(format!(
            "mask {:?} does not match spectrogram {:?}",
            mask.shape(),
            spectrogram.shape()
        )));
    }

    let mut data = spectrogram.data().clone();
    Zip::from(&mut data).and(mask.data()).for_each(|bin, &m| *bin *= m);
    spectrogram
        .with_data(data)
        .map_err(|e| SeparationError::Internal(e.to_string()))
}

/// Reassembles chunked backend output into full-length masks
///
/// Chunks must be pushed in order. Each chunk is accumulated with its
/// cross-fade weights and can be dropped immediately, so only one chunk's
/// estimate is alive at a time.
pub struct MaskAssembler {
    shape: (usize, usize, usize),
    ranges: Vec<ChunkRange>,
    sums: BTreeMap<Stem, Array3<f32>>,
    weight_sum: Vec<f32>,
    next: usize,
}

impl MaskAssembler {
    /// Prepare accumulators for a spectrogram shape and chunk layout
    pub fn new(shape: (usize, usize, usize), stems: &StemSet, ranges: Vec<ChunkRange>) -> Self {
        let sums = stems.iter().map(|stem| (stem, Array3::zeros(shape))).collect();
        Self {
            shape,
            ranges,
            sums,
            weight_sum: vec![0.0; shape.1],
            next: 0,
        }
    }

    /// Number of chunks still expected
    pub fn remaining(&self) -> usize {
        self.ranges.len() - self.next
    }

    /// Cross-fade weight of every frame in chunk `index`'s extended range
    pub fn chunk_weights(&self, index: usize) -> Vec<f32> {
        let range = &self.ranges[index].extended;
        let fade_in = index
            .checked_sub(1)
            .map(|prev| self.ranges[prev].extended.end)
            .filter(|&end| end > range.start);
        let fade_out = self
            .ranges
            .get(index + 1)
            .map(|next| next.extended.start)
            .filter(|&start| start < range.end);

        range
            .clone()
            .map(|frame| {
                let mut weight = 1.0f32;
                if let Some(prev_end) = fade_in {
                    if frame < prev_end {
                        let len = (prev_end - range.start) as f32;
                        weight = weight.min(((frame - range.start) as f32 + 0.5) / len);
                    }
                }
                if let Some(next_start) = fade_out {
                    if frame >= next_start {
                        let len = (range.end - next_start) as f32;
                        weight = weight.min(((range.end - frame) as f32 - 0.5) / len);
                    }
                }
                weight
            })
            .collect()
    }

    /// Accumulate the next chunk's masks
    pub fn push(&mut self, masks: ChunkMasks) -> Result<()> {
        let index = self.next;
        let range = self
            .ranges
            .get(index)
            .ok_or_else(|| SeparationError::Internal("more chunks than planned".to_string()))?
            .extended
            .clone();
        let expected = (self.shape.0, range.len(), self.shape.2);

        if masks.len() != self.sums.len() || masks.keys().any(|stem| !self.sums.contains_key(stem)) {
            return Err(SeparationError::Internal(format!(
                "chunk {} stems {:?} do not match {:?}",
                index,
                masks.keys().collect::<Vec<_>>(),
                self.sums.keys().collect::<Vec<_>>()
            )));
        }

        if let Some((stem, mask)) = masks.iter().find(|(_, m)| m.dim() != expected) {
            return Err(SeparationError::Internal(format!(
                "chunk {} {} mask is {:?}, expected {:?}",
                index,
                stem,
                mask.dim(),
                expected
            )));
        }

        let weights = self.chunk_weights(index);
        for (stem, mask) in masks {
            if let Some(sum) = self.sums.get_mut(&stem) {
                let mut target = sum.slice_mut(s![.., range.clone(), ..]);
                for (offset, weight) in weights.iter().enumerate() {
                    let mut frame = target.index_axis_mut(Axis(1), offset);
                    frame.scaled_add(*weight, &mask.index_axis(Axis(1), offset));
                }
            }
        }

        for (frame, weight) in range.zip(&weights) {
            self.weight_sum[frame] += weight;
        }
        self.next += 1;
        Ok(())
    }

    /// Normalize by the summed weights and produce the final masks
    pub fn finish(self) -> Result<MaskSet> {
        if self.next != self.ranges.len() {
            return Err(SeparationError::Internal(format!(
                "{} of {} chunks assembled",
                self.next,
                self.ranges.len()
            )));
        }

        let weight_sum = self.weight_sum;
        self.sums
            .into_iter()
            .map(|(stem, mut sum)| -> Result<(Stem, SeparationMask)> {
                for (frame, total) in weight_sum.iter().enumerate() {
                    if *total > 0.0 {
                        sum.index_axis_mut(Axis(1), frame)
                            .mapv_inplace(|v| (v / total).clamp(0.0, 1.0));
                    }
                }
                Ok((stem, SeparationMask::new(sum)?))
            })
            .collect()
    }
}

/// Assemble a complete list of chunk estimates in one call
///
/// `chunks` must follow the order of `ranges`.
pub fn assemble_masks(
    chunks: Vec<ChunkMasks>,
    shape: (usize, usize, usize),
    stems: &StemSet,
    ranges: Vec<ChunkRange>,
) -> Result<MaskSet> {
    let mut assembler = MaskAssembler::new(shape, stems, ranges);
    for masks in chunks {
        assembler.push(masks)?;
    }
    assembler.finish()
}

/// Inverse-transform each stem through its mask, one buffer per stem
///
/// Stems are rendered one after another and each mask is applied frame by
/// frame inside the inverse, so besides the spectrogram only one mask and
/// one output buffer are live at a time. Masks are consumed and released as
/// soon as their stem is rendered. Cancellation is checked before each stem.
pub fn reconstruct(
    spectrogram: &Spectrogram,
    masks: MaskSet,
    stft: &StftProcessor,
    cancel: &CancelToken,
) -> Result<BTreeMap<Stem, AudioBuffer>> {
    let mut stems = BTreeMap::new();
    for (stem, mask) in masks {
        cancel.check()?;
        let audio = stft
            .inverse_masked(spectrogram, mask.data().view())
            .map_err(|e| SeparationError::Internal(format!("inverse transform failed: {}", e)))?;
        drop(mask);
        log::debug!("Reconstructed {} stem: {} frames", stem, audio.frames());
        stems.insert(stem, audio);
    }
    Ok(stems)
}
