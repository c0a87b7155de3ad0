//! Chunked mask estimation
//!
//! The spectrogram is streamed through the backend in fixed-size time
//! chunks so peak memory does not grow with track length. Each chunk is
//! extended by the backend's context on both sides; the duplicated context
//! is cross-faded by [`MaskAssembler`].

use std::ops::Range;
use std::sync::Arc;

use ndarray::Array3;
use unmix_core::stft::Spectrogram;

use crate::backend::{ChunkMasks, SeparationBackend, SpectrogramChunk};
use crate::error::{Result, SeparationError};
use crate::job::CancelToken;
use crate::mixing::{MaskAssembler, MaskSet};
use crate::stem::StemSet;

/// Frames owned by a chunk and the frames handed to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    /// Frames this chunk is responsible for
    pub core: Range<usize>,
    /// Core plus context, clipped to the spectrogram
    pub extended: Range<usize>,
}

/// Split `total_frames` into consecutive cores of `chunk_frames`, each
/// extended by `context` frames on both sides
pub fn plan_chunks(total_frames: usize, chunk_frames: usize, context: usize) -> Vec<ChunkRange> {
    let chunk_frames = chunk_frames.max(1);
    (0..total_frames)
        .step_by(chunk_frames)
        .map(|start| {
            let end = (start + chunk_frames).min(total_frames);
            ChunkRange {
                core: start..end,
                extended: start.saturating_sub(context)..(end + context).min(total_frames),
            }
        })
        .collect()
}

/// Runs a backend over a spectrogram chunk by chunk
///
/// Holds only the shared, read-only backend, so one runner serves every job.
#[derive(Clone)]
pub struct ModelRunner {
    backend: Arc<dyn SeparationBackend>,
    chunk_frames: usize,
}

impl ModelRunner {
    /// Create a runner
    ///
    /// The chunk is widened to at least twice the backend's context so that
    /// only neighbouring chunks ever overlap.
    pub fn new(backend: Arc<dyn SeparationBackend>, chunk_frames: usize) -> Self {
        let chunk_frames = chunk_frames.max(2 * backend.context_frames()).max(1);
        Self {
            backend,
            chunk_frames,
        }
    }

    pub fn backend(&self) -> &Arc<dyn SeparationBackend> {
        &self.backend
    }

    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    pub fn context_frames(&self) -> usize {
        self.backend.context_frames()
    }

    /// Chunk layout used for a spectrogram with `total_frames` frames
    pub fn plan(&self, total_frames: usize) -> Vec<ChunkRange> {
        plan_chunks(total_frames, self.chunk_frames, self.context_frames())
    }

    /// Estimate one mask per requested stem over the whole spectrogram
    pub fn separate(&self, spectrogram: &Spectrogram, stems: &StemSet) -> Result<MaskSet> {
        self.separate_with(spectrogram, stems, &CancelToken::new(), |_, _| {})
    }

    /// Like [`separate`](Self::separate), checking `cancel` before every
    /// chunk and reporting `(chunks_done, chunks_total)` after each one
    pub fn separate_with<F>(
        &self,
        spectrogram: &Spectrogram,
        stems: &StemSet,
        cancel: &CancelToken,
        mut on_chunk: F,
    ) -> Result<MaskSet>
    where
        F: FnMut(usize, usize),
    {
        if stems.is_empty() {
            return Err(SeparationError::InvalidRequest("no stems requested".to_string()));
        }
        if !self.backend.is_available() {
            return Err(SeparationError::Model(format!(
                "{} backend unavailable: {}",
                self.backend.name(),
                self.backend
                    .unavailable_reason()
                    .unwrap_or_else(|| "unknown reason".to_string())
            )));
        }

        let plan = self.plan(spectrogram.num_frames());
        let total = plan.len();
        log::info!(
            "Separating {} frames in {} chunks of {} (+{} context) with {} backend",
            spectrogram.num_frames(),
            total,
            self.chunk_frames,
            self.context_frames(),
            self.backend.name()
        );

        let mut assembler = MaskAssembler::new(spectrogram.shape(), stems, plan.clone());
        for (index, range) in plan.iter().enumerate() {
            cancel.check()?;

            let chunk = SpectrogramChunk::new(spectrogram, range.extended.clone());
            let masks = self.backend.estimate(&chunk, stems)?;
            check_chunk(&masks, stems, chunk.shape(), index)?;
            assembler.push(masks)?;

            log::debug!("Chunk {}/{} done (frames {:?})", index + 1, total, range.core);
            on_chunk(index + 1, total);
        }

        assembler.finish()
    }
}

/// Enforce the backend contract on one chunk's output
fn check_chunk(
    masks: &ChunkMasks,
    stems: &StemSet,
    shape: (usize, usize, usize),
    index: usize,
) -> Result<()> {
    let produced: StemSet = masks.keys().copied().collect();
    if &produced != stems {
        return Err(SeparationError::Model(format!(
            "chunk {}: backend produced stems {:?}, requested {:?}",
            index, produced, stems
        )));
    }

    for (stem, mask) in masks {
        if mask.dim() != shape {
            return Err(SeparationError::Model(format!(
                "chunk {}: {} mask shaped {:?}, expected {:?}",
                index,
                stem,
                mask.dim(),
                shape
            )));
        }
        if let Some(bad) = find_invalid(mask) {
            return Err(SeparationError::Model(format!(
                "chunk {}: {} mask contains {}",
                index, stem, bad
            )));
        }
    }
    Ok(())
}

fn find_invalid(mask: &Array3<f32>) -> Option<f32> {
    mask.iter()
        .copied()
        .find(|v| !v.is_finite() || *v < 0.0 || *v > 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SpectralBackend;
    use crate::stem::Stem;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use unmix_core::{stft, AudioBuffer};

    /// Backend returning a fixed value, counting calls
    struct FixedBackend {
        value: f32,
        calls: AtomicUsize,
        context: usize,
    }

    impl FixedBackend {
        fn new(value: f32, context: usize) -> Self {
            Self {
                value,
                calls: AtomicUsize::new(0),
                context,
            }
        }
    }

    impl SeparationBackend for FixedBackend {
        fn estimate(&self, chunk: &SpectrogramChunk<'_>, stems: &StemSet) -> Result<ChunkMasks> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(stems
                .iter()
                .map(|s| (s, Array3::from_elem(chunk.shape(), self.value)))
                .collect())
        }

        fn context_frames(&self) -> usize {
            self.context
        }

        fn name(&self) -> &'static str {
            "Fixed"
        }
    }

    fn test_spectrogram(seconds: f32) -> Spectrogram {
        let sample_rate = 8000;
        let frames = (seconds * sample_rate as f32) as usize;
        let planar: Vec<Vec<f32>> = (0..2)
            .map(|ch| {
                (0..frames)
                    .map(|i| {
                        let t = i as f32 / sample_rate as f32;
                        (2.0 * std::f32::consts::PI * 330.0 * t).sin() * 0.3
                            + ((i * 7 + ch * 13) % 17) as f32 / 170.0
                    })
                    .collect()
            })
            .collect();
        let buffer = AudioBuffer::from_planar(planar, sample_rate).unwrap();
        stft::forward(&buffer, 256, 64).unwrap()
    }

    #[test]
    fn test_plan_chunks_covers_every_frame_once() {
        let plan = plan_chunks(1000, 128, 8);
        assert_eq!(plan.len(), 8);
        assert_eq!(plan[0].extended, 0..136);
        assert_eq!(plan[1].extended, 120..264);
        assert_eq!(plan.last().unwrap().core, 896..1000);
        assert_eq!(plan.last().unwrap().extended, 888..1000);

        let mut next = 0;
        for range in &plan {
            assert_eq!(range.core.start, next);
            next = range.core.end;
        }
        assert_eq!(next, 1000);
    }

    #[test]
    fn test_chunk_widened_to_context() {
        let runner = ModelRunner::new(Arc::new(FixedBackend::new(0.5, 40)), 16);
        assert_eq!(runner.chunk_frames(), 80);
    }

    #[test]
    fn test_stem_keys_match_request() {
        let spec = test_spectrogram(1.0);
        let runner = ModelRunner::new(Arc::new(SpectralBackend::new()), 32);
        let masks = runner.separate(&spec, &StemSet::vocal_split()).unwrap();
        assert_eq!(
            masks.keys().copied().collect::<Vec<_>>(),
            vec![Stem::Vocals, Stem::Instrumental]
        );
        for mask in masks.values() {
            assert_eq!(mask.shape(), spec.shape());
        }
    }

    #[test]
    fn test_masks_bounded() {
        let spec = test_spectrogram(1.0);
        let runner = ModelRunner::new(Arc::new(SpectralBackend::new()), 24);
        let stems: StemSet = Stem::ALL.into_iter().collect();
        let masks = runner.separate(&spec, &stems).unwrap();
        for (stem, mask) in &masks {
            assert!(
                mask.data().iter().all(|v| (0.0..=1.0).contains(v)),
                "{} mask out of range",
                stem
            );
        }
    }

    #[test]
    fn test_separate_is_deterministic() {
        let spec = test_spectrogram(0.75);
        let runner = ModelRunner::new(Arc::new(SpectralBackend::new()), 20);
        let stems = StemSet::vocal_split();
        let first = runner.separate(&spec, &stems).unwrap();
        let second = runner.separate(&spec, &stems).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_progress_per_chunk() {
        let spec = test_spectrogram(0.5);
        let backend = Arc::new(FixedBackend::new(0.5, 2));
        let runner = ModelRunner::new(backend.clone(), 10);
        let expected = runner.plan(spec.num_frames()).len();

        let mut reports = Vec::new();
        runner
            .separate_with(&spec, &StemSet::vocal_split(), &CancelToken::new(), |done, total| {
                reports.push((done, total))
            })
            .unwrap();

        assert_eq!(backend.calls.load(Ordering::SeqCst), expected);
        assert_eq!(reports.len(), expected);
        assert_eq!(reports.last(), Some(&(expected, expected)));
    }

    #[test]
    fn test_cancelled_before_first_chunk() {
        let spec = test_spectrogram(0.5);
        let backend = Arc::new(FixedBackend::new(0.5, 0));
        let runner = ModelRunner::new(backend.clone(), 10);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = runner.separate_with(&spec, &StemSet::vocal_split(), &cancel, |_, _| {});
        assert!(matches!(result, Err(SeparationError::Cancelled)));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rejects_out_of_range_output() {
        let spec = test_spectrogram(0.25);
        let runner = ModelRunner::new(Arc::new(FixedBackend::new(1.5, 0)), 10);
        let result = runner.separate(&spec, &StemSet::vocal_split());
        assert!(matches!(result, Err(SeparationError::Model(_))));

        let runner = ModelRunner::new(Arc::new(FixedBackend::new(f32::NAN, 0)), 10);
        let result = runner.separate(&spec, &StemSet::vocal_split());
        assert!(matches!(result, Err(SeparationError::Model(_))));
    }

    #[test]
    fn test_rejects_missing_and_extra_stems() {
        struct VocalsOnly;
        impl SeparationBackend for VocalsOnly {
            fn estimate(&self, chunk: &SpectrogramChunk<'_>, _: &StemSet) -> Result<ChunkMasks> {
                Ok([(Stem::Vocals, Array3::zeros(chunk.shape()))].into_iter().collect())
            }
            fn name(&self) -> &'static str {
                "VocalsOnly"
            }
        }

        let spec = test_spectrogram(0.25);
        let runner = ModelRunner::new(Arc::new(VocalsOnly), 10);
        let result = runner.separate(&spec, &StemSet::vocal_split());
        assert!(matches!(result, Err(SeparationError::Model(_))));

        let drums: StemSet = [Stem::Drums].into_iter().collect();
        assert!(matches!(runner.separate(&spec, &drums), Err(SeparationError::Model(_))));
    }

    #[test]
    fn test_rejects_wrong_shape() {
        struct Shrunk;
        impl SeparationBackend for Shrunk {
            fn estimate(&self, _: &SpectrogramChunk<'_>, stems: &StemSet) -> Result<ChunkMasks> {
                Ok(stems.iter().map(|s| (s, Array3::zeros((1, 1, 1)))).collect())
            }
            fn name(&self) -> &'static str {
                "Shrunk"
            }
        }

        let spec = test_spectrogram(0.25);
        let runner = ModelRunner::new(Arc::new(Shrunk), 10);
        assert!(matches!(
            runner.separate(&spec, &StemSet::vocal_split()),
            Err(SeparationError::Model(_))
        ));
    }

    #[test]
    fn test_unavailable_backend_is_model_error() {
        struct Offline;
        impl SeparationBackend for Offline {
            fn estimate(&self, _: &SpectrogramChunk<'_>, _: &StemSet) -> Result<ChunkMasks> {
                unreachable!()
            }
            fn name(&self) -> &'static str {
                "Offline"
            }
            fn is_available(&self) -> bool {
                false
            }
        }

        let spec = test_spectrogram(0.25);
        let runner = ModelRunner::new(Arc::new(Offline), 10);
        let err = runner.separate(&spec, &StemSet::vocal_split()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ModelError);
    }
}
