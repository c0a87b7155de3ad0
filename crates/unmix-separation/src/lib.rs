//! Unmix Separation - Vocal/instrumental stem separation pipeline
//!
//! Turns an uploaded audio file into separately encoded stems.
//!
//! ## Architecture
//!
//! ```text
//! SeparationRequest ──▶ SeparationService (rayon pool, one job per worker)
//!                              │
//!                              ▼
//!   Job:  validate ─▶ decode/conform ─▶ STFT ─▶ ModelRunner ─▶ reconstruct ─▶ encode
//!                        unmix-core      unmix-core   │            mixing         unmix-core
//!                                                     ▼
//!                                      Arc<dyn SeparationBackend>
//!                                      (Spectral | ONNX Runtime)
//! ```
//!
//! The backend is the only state shared between jobs and is read-only.
//! Progress is reported on every state transition and after every chunk;
//! a [`JobHandle`] can cancel a job between stages or chunks.

pub mod backend;
pub mod config;
pub mod error;
pub mod job;
pub mod mixing;
pub mod model;
pub mod runner;
pub mod service;
pub mod stem;

pub use backend::{create_backend, OrtBackend, SeparationBackend, SpectralBackend};
pub use config::{default_config_path, load_config, save_config, BackendType, SeparationConfig};
pub use error::{ErrorKind, Result, SeparationError};
pub use job::{CancelToken, JobId, JobProgress, JobResponse, JobStatus, ProgressCallback, SeparationRequest};
pub use mixing::{MaskSet, SeparationMask};
pub use model::ModelManager;
pub use runner::ModelRunner;
pub use service::{JobHandle, SeparationService};
pub use stem::{Stem, StemSet};

#[cfg(test)]
pub(crate) mod test_support {
    use hound::{SampleFormat, WavSpec, WavWriter};
    use std::io::Cursor;

    /// Render a sine wave to an in-memory 16-bit WAV file
    pub fn sine_wav(frequency: f32, seconds: f32, sample_rate: u32, channels: u16) -> Vec<u8> {
        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            let frames = (seconds * sample_rate as f32).round() as usize;
            for i in 0..frames {
                let t = i as f32 / sample_rate as f32;
                let value = (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.5;
                for _ in 0..channels {
                    writer.write_sample((value * i16::MAX as f32) as i16).unwrap();
                }
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }
}
