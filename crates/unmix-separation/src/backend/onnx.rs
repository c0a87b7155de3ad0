//! ONNX Runtime mask network backend

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ndarray::{Array3, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;

use super::{ChunkMasks, SeparationBackend, SpectrogramChunk};
use crate::config::OnnxConfig;
use crate::error::{Result, SeparationError};
use crate::stem::{Stem, StemSet};

/// Backend using ONNX Runtime directly via the `ort` crate
///
/// The network receives chunk magnitudes `[1, channels, frames, bins]` and
/// returns one mask per stem in `stem_order`, shaped
/// `[1, stems, channels, frames, bins]`. Instrumental may be left out of the
/// model; it is then derived as the complement of vocals.
///
/// The session is loaded once and shared by every job; `run` needs exclusive
/// access, so calls are serialized through a mutex.
pub struct OrtBackend {
    session: Mutex<Session>,
    model_path: PathBuf,
    stem_order: Vec<Stem>,
    apply_sigmoid: bool,
    context_frames: usize,
}

// Safety: the session is only reached through the mutex
unsafe impl Send for OrtBackend {}
unsafe impl Sync for OrtBackend {}

impl OrtBackend {
    /// Input tensor name expected by the network
    pub const INPUT_NAME: &'static str = "magnitude";

    /// Load the model and create the inference session
    pub fn load(model_path: &Path, config: &OnnxConfig) -> Result<Self> {
        if !model_path.exists() {
            return Err(SeparationError::ModelNotFound(model_path.display().to_string()));
        }
        if config.stem_order.is_empty() {
            return Err(SeparationError::InvalidConfig(
                "ONNX stem order must name at least one stem".to_string(),
            ));
        }

        log::info!("Loading ONNX model from {:?}", model_path);

        let session = Session::builder()
            .map_err(|e| SeparationError::Model(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| SeparationError::Model(e.to_string()))?
            .with_intra_threads(config.intra_threads)
            .map_err(|e| SeparationError::Model(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| SeparationError::Model(format!("Failed to load ONNX model: {}", e)))?;

        log::info!(
            "OrtBackend ready: stems {:?}, context {} frames, sigmoid {}",
            config.stem_order,
            config.context_frames,
            config.apply_sigmoid
        );

        Ok(Self {
            session: Mutex::new(session),
            model_path: model_path.to_path_buf(),
            stem_order: config.stem_order.clone(),
            apply_sigmoid: config.apply_sigmoid,
            context_frames: config.context_frames,
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Stems this model can deliver
    pub fn provides(&self, stem: Stem) -> bool {
        self.stem_order.contains(&stem)
            || (stem == Stem::Instrumental && self.stem_order.contains(&Stem::Vocals))
    }
}

impl SeparationBackend for OrtBackend {
    fn estimate(&self, chunk: &SpectrogramChunk<'_>, stems: &StemSet) -> Result<ChunkMasks> {
        if let Some(missing) = stems.iter().find(|s| !self.provides(*s)) {
            return Err(SeparationError::Model(format!(
                "model {:?} does not produce the '{}' stem",
                self.model_path.file_name().unwrap_or_default(),
                missing
            )));
        }

        let shape = chunk.shape();
        let input = chunk.magnitudes().insert_axis(Axis(0));
        let input_tensor = Tensor::from_array(input).map_err(|e| {
            SeparationError::Model(format!("Failed to create input tensor: {}", e))
        })?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| SeparationError::Model("ONNX session lock poisoned".to_string()))?;

        let outputs = session
            .run(ort::inputs![Self::INPUT_NAME => input_tensor])
            .map_err(|e| SeparationError::Model(format!("Inference failed: {}", e)))?;

        let output = outputs
            .iter()
            .next()
            .ok_or_else(|| SeparationError::Model("No output tensor".to_string()))?
            .1;

        let (output_shape, data) = output.try_extract_tensor::<f32>().map_err(|e| {
            SeparationError::Model(format!("Failed to extract output: {}", e))
        })?;
        let dims: Vec<i64> = output_shape.iter().copied().collect();

        masks_from_output(&dims, data, &self.stem_order, stems, shape, self.apply_sigmoid)
    }

    fn context_frames(&self) -> usize {
        self.context_frames
    }

    fn name(&self) -> &'static str {
        "ONNX Runtime"
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Slice the requested stems out of a flat `[1, stems, channels, frames, bins]` tensor
fn masks_from_output(
    dims: &[i64],
    data: &[f32],
    stem_order: &[Stem],
    stems: &StemSet,
    (channels, frames, bins): (usize, usize, usize),
    apply_sigmoid: bool,
) -> Result<ChunkMasks> {
    let expected = [1, stem_order.len() as i64, channels as i64, frames as i64, bins as i64];
    if dims != expected.as_slice() {
        return Err(SeparationError::Model(format!(
            "Unexpected output shape: {:?}, expected {:?}",
            dims, expected
        )));
    }

    let stem_len = channels * frames * bins;
    let extract = |index: usize| -> Result<Array3<f32>> {
        let slice = &data[index * stem_len..(index + 1) * stem_len];
        let values: Vec<f32> = if apply_sigmoid {
            slice.iter().map(|&x| sigmoid(x)).collect()
        } else {
            slice.to_vec()
        };
        Array3::from_shape_vec((channels, frames, bins), values)
            .map_err(|e| SeparationError::Model(format!("Output reshape failed: {}", e)))
    };
    let position = |stem: Stem| stem_order.iter().position(|s| *s == stem);

    let mut masks = ChunkMasks::new();
    for stem in stems {
        let mask = match (position(stem), stem) {
            (Some(index), _) => extract(index)?,
            (None, Stem::Instrumental) => {
                let vocals = position(Stem::Vocals).ok_or_else(|| {
                    SeparationError::Model("instrumental needs a vocals output".to_string())
                })?;
                extract(vocals)?.mapv(|v| 1.0 - v)
            }
            (None, other) => {
                return Err(SeparationError::Model(format!("no output for stem '{}'", other)));
            }
        };
        masks.insert(stem, mask);
    }
    Ok(masks)
}
