//! Separation configuration
//!
//! Stored as YAML. Default location: `~/.config/unmix/config.yaml`
//! (platform config directory). Every section has defaults, so a file only
//! needs the keys it changes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use unmix_core::codec::{BitDepth, OutputFormat};
use unmix_core::{ChannelLayout, MODEL_SAMPLE_RATE};

use crate::backend::SpectralParams;
use crate::stem::Stem;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// Format the pipeline processes and emits
    pub audio: AudioConfig,
    /// STFT parameters
    pub transform: TransformConfig,
    /// Mask estimation settings
    pub model: ModelConfig,
    /// Container and bit depth of encoded stems
    pub output: OutputFormat,
    /// Request limits checked before decoding
    pub limits: LimitsConfig,
    /// Number of jobs processed concurrently
    pub workers: usize,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            transform: TransformConfig::default(),
            model: ModelConfig::default(),
            output: OutputFormat::default(),
            limits: LimitsConfig::default(),
            workers: 2,
        }
    }
}

impl SeparationConfig {
    /// Clamp every value into its supported range
    pub fn validate(&mut self) {
        self.audio.validate();
        self.transform.validate();
        self.model.validate();
        self.limits.validate();
        self.workers = self.workers.clamp(1, 64);

        if self.output.validate().is_err() {
            log::warn!(
                "{} output cannot store {}-bit float, using 24-bit PCM",
                self.output.container.extension(),
                self.output.bit_depth.bits()
            );
            self.output.bit_depth = BitDepth::Pcm24;
        }
    }
}

/// Processing sample rate and channel layout
///
/// Decoded input is conformed to this format before the transform; output
/// stems keep it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub layout: ChannelLayout,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: MODEL_SAMPLE_RATE,
            layout: ChannelLayout::Stereo,
        }
    }
}

impl AudioConfig {
    pub fn validate(&mut self) {
        self.sample_rate = self.sample_rate.clamp(8000, 192_000);
    }
}

/// Short-time Fourier transform parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Analysis window length in samples (even)
    pub window_size: usize,
    /// Hop between frames in samples (1..=window_size)
    pub hop_size: usize,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            window_size: 4096,
            hop_size: 1024,
        }
    }
}

impl TransformConfig {
    pub fn validate(&mut self) {
        self.window_size = self.window_size.clamp(64, 16384);
        if self.window_size % 2 != 0 {
            self.window_size += 1;
        }
        self.hop_size = self.hop_size.clamp(1, self.window_size);
    }
}

/// Mask estimation backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Built-in spectral estimator (no model file needed)
    #[default]
    Spectral,
    /// Mask network run through ONNX Runtime
    Onnx,
}

impl BackendType {
    /// Display name for logs
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Spectral => "Spectral",
            Self::Onnx => "ONNX Runtime",
        }
    }
}

/// Mask estimation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub backend: BackendType,
    /// Spectrogram frames per chunk, excluding context (bounds peak memory)
    pub chunk_frames: usize,
    /// Settings for [`BackendType::Spectral`]
    pub spectral: SpectralParams,
    /// Settings for [`BackendType::Onnx`]
    pub onnx: OnnxConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::Spectral,
            chunk_frames: 256,
            spectral: SpectralParams::default(),
            onnx: OnnxConfig::default(),
        }
    }
}

impl ModelConfig {
    pub fn validate(&mut self) {
        self.chunk_frames = self.chunk_frames.clamp(16, 8192);
        self.spectral.validate();
        self.onnx.validate();
    }
}

/// ONNX mask network settings
///
/// The network takes magnitudes shaped `[1, channels, frames, bins]` on input
/// `magnitude` and returns masks shaped `[1, stems, channels, frames, bins]`
/// with stems in `stem_order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxConfig {
    /// Model filename inside the model cache directory
    pub model_file: String,
    /// Where to fetch the model when it is not cached
    pub download_url: Option<String>,
    /// Override for the model cache directory
    pub cache_dir: Option<PathBuf>,
    /// Stem produced by each output slice
    pub stem_order: Vec<Stem>,
    /// Apply a sigmoid to raw network output (for logit-producing models)
    pub apply_sigmoid: bool,
    /// Temporal context the network needs on each side of a chunk
    pub context_frames: usize,
    /// ONNX Runtime intra-op threads per session
    pub intra_threads: usize,
}

impl Default for OnnxConfig {
    fn default() -> Self {
        Self {
            model_file: "unmix-masks.onnx".to_string(),
            download_url: None,
            cache_dir: None,
            stem_order: vec![Stem::Vocals, Stem::Drums, Stem::Bass],
            apply_sigmoid: false,
            context_frames: 16,
            intra_threads: 1,
        }
    }
}

impl OnnxConfig {
    pub fn validate(&mut self) {
        self.context_frames = self.context_frames.min(512);
        self.intra_threads = self.intra_threads.clamp(1, 16);
        let mut seen = Vec::with_capacity(self.stem_order.len());
        for stem in &self.stem_order {
            if seen.contains(stem) {
                log::warn!("Duplicate stem '{}' in ONNX stem order ignored", stem);
            } else {
                seen.push(*stem);
            }
        }
        self.stem_order = seen;
    }
}

/// Limits enforced before a job starts decoding
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest accepted upload in bytes
    pub max_file_bytes: u64,
    /// Longest accepted audio duration in seconds
    pub max_duration_secs: f64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: 50 * 1024 * 1024,
            max_duration_secs: 600.0,
        }
    }
}

impl LimitsConfig {
    pub fn validate(&mut self) {
        self.max_file_bytes = self.max_file_bytes.max(1024);
        if !self.max_duration_secs.is_finite() || self.max_duration_secs <= 0.0 {
            self.max_duration_secs = LimitsConfig::default().max_duration_secs;
        }
        self.max_duration_secs = self.max_duration_secs.min(4.0 * 3600.0);
    }
}

/// Get the default config file path
///
/// Returns: `{config_dir}/unmix/config.yaml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("unmix")
        .join("config.yaml")
}

/// Load configuration from a YAML file
///
/// If the file doesn't exist, returns default config.
/// If the file exists but is invalid, logs a warning and returns default config.
pub fn load_config(path: &Path) -> SeparationConfig {
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Config file doesn't exist, using defaults");
        return SeparationConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<SeparationConfig>(&contents) {
            Ok(mut config) => {
                config.validate();
                log::info!(
                    "load_config: Loaded config - backend: {}, window {} / hop {}, {} workers",
                    config.model.backend.display_name(),
                    config.transform.window_size,
                    config.transform.hop_size,
                    config.workers
                );
                config
            }
            Err(e) => {
                log::warn!("load_config: Failed to parse config: {}, using defaults", e);
                SeparationConfig::default()
            }
        },
        Err(e) => {
            log::warn!("load_config: Failed to read config file: {}, using defaults", e);
            SeparationConfig::default()
        }
    }
}

/// Save configuration to a YAML file
///
/// Creates parent directories if needed.
pub fn save_config(config: &SeparationConfig, path: &Path) -> Result<()> {
    log::info!("save_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    std::fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    log::info!("save_config: Config saved successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use unmix_core::codec::OutputContainer;

    #[test]
    fn test_default_config() {
        let config = SeparationConfig::default();
        assert_eq!(config.audio.sample_rate, 44100);
        assert_eq!(config.transform.window_size, 4096);
        assert_eq!(config.limits.max_file_bytes, 52_428_800);
        assert_eq!(config.model.backend, BackendType::Spectral);
        assert_eq!(config.output.container, OutputContainer::Wav);
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = SeparationConfig::default();
        config.transform.window_size = 1001;
        config.transform.hop_size = 5000;
        config.workers = 0;
        config.limits.max_duration_secs = f64::NAN;
        config.output = OutputFormat::flac(BitDepth::Float32);
        config.validate();

        assert_eq!(config.transform.window_size, 1002);
        assert_eq!(config.transform.hop_size, 1002);
        assert_eq!(config.workers, 1);
        assert_eq!(config.limits.max_duration_secs, 600.0);
        assert_eq!(config.output.bit_depth, BitDepth::Pcm24);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "model:\n  backend: onnx\n  onnx:\n    stem_order: [vocals, vocals, drums]\n";
        let mut config: SeparationConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate();
        assert_eq!(config.model.backend, BackendType::Onnx);
        assert_eq!(config.model.onnx.stem_order, vec![Stem::Vocals, Stem::Drums]);
        assert_eq!(config.model.chunk_frames, 256);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_spectral_params_from_yaml() {
        let yaml = "model:\n  spectral:\n    time_kernel: 12\n    freq_kernel: 0\n";
        let mut config: SeparationConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate();
        assert_eq!(config.model.spectral.time_kernel, 13);
        assert_eq!(config.model.spectral.freq_kernel, 1);
        assert_eq!(config.model.spectral.vocal_band, SpectralParams::default().vocal_band);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = SeparationConfig::default();
        config.workers = 3;
        config.audio.layout = ChannelLayout::Mono;
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path);
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file_falls_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "workers: [not, a, number]").unwrap();
        assert_eq!(load_config(&path), SeparationConfig::default());

        assert_eq!(
            load_config(&dir.path().join("missing.yaml")),
            SeparationConfig::default()
        );
    }
}
