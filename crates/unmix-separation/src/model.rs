//! Model cache for the ONNX backend
//!
//! Locates mask network files in a cache directory and downloads them on
//! first use when the configuration names a download URL.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::config::OnnxConfig;
use crate::error::{Result, SeparationError};

/// Manages model downloads and caching
#[derive(Debug, Clone)]
pub struct ModelManager {
    /// Directory where models are cached
    cache_dir: PathBuf,
}

impl ModelManager {
    /// Create a ModelManager with the default cache directory
    ///
    /// Default location: `~/.cache/unmix/models/`
    pub fn new() -> Result<Self> {
        let cache_dir = Self::default_cache_dir()?;
        Ok(Self { cache_dir })
    }

    /// Create a ModelManager with a custom cache directory
    pub fn with_cache_dir(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    /// Use the configured cache directory, or the default one
    pub fn for_config(config: &OnnxConfig) -> Result<Self> {
        match &config.cache_dir {
            Some(dir) => Ok(Self::with_cache_dir(dir.clone())),
            None => Self::new(),
        }
    }

    fn default_cache_dir() -> Result<PathBuf> {
        let base = dirs::cache_dir().ok_or_else(|| {
            SeparationError::InvalidConfig("Could not determine cache directory".to_string())
        })?;
        Ok(base.join("unmix").join("models"))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Get the local path where a model would be stored
    pub fn model_path(&self, model_file: &str) -> PathBuf {
        self.cache_dir.join(model_file)
    }

    /// Check if a model is already cached
    pub fn is_model_available(&self, model_file: &str) -> bool {
        self.model_path(model_file).exists()
    }

    /// Get the path to the configured model, downloading if necessary
    ///
    /// Fails with `ModelNotFound` when the model is not cached and no
    /// download URL is configured.
    pub fn ensure_model(
        &self,
        config: &OnnxConfig,
        progress: Option<Box<dyn Fn(f32) + Send>>,
    ) -> Result<PathBuf> {
        let model_path = self.model_path(&config.model_file);

        if model_path.exists() {
            log::info!("Model {} found at {:?}", config.model_file, model_path);
            if let Some(cb) = &progress {
                cb(1.0);
            }
            return Ok(model_path);
        }

        let url = config.download_url.as_deref().ok_or_else(|| {
            SeparationError::ModelNotFound(format!(
                "{} (not cached and no download URL configured)",
                model_path.display()
            ))
        })?;

        log::info!("Downloading model {} from {}", config.model_file, url);
        self.download_file(url, &model_path, progress)?;
        Ok(model_path)
    }

    /// Download a file into the cache directory
    ///
    /// Writes to a temporary sibling first and renames once the size checks
    /// out, so a partial download never looks like a cached model.
    fn download_file(
        &self,
        url: &str,
        target_path: &Path,
        progress: Option<Box<dyn Fn(f32) + Send>>,
    ) -> Result<()> {
        fs::create_dir_all(&self.cache_dir)?;

        let temp_path = target_path.with_extension("tmp");

        log::info!("Downloading {} to {:?}", url, target_path);

        let response = ureq::get(url)
            .call()
            .map_err(|e| SeparationError::ModelDownloadFailed(e.to_string()))?;

        let content_length: Option<u64> = response
            .header("Content-Length")
            .and_then(|s| s.parse().ok());

        let mut file = fs::File::create(&temp_path)?;

        let mut reader = response.into_reader();
        let mut buffer = [0u8; 8192];
        let mut downloaded: u64 = 0;

        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }

            file.write_all(&buffer[..bytes_read])?;
            downloaded += bytes_read as u64;

            if let (Some(cb), Some(total)) = (&progress, content_length) {
                let pct = downloaded as f32 / total as f32;
                cb(pct.min(0.99)); // Cap at 99% until verification
            }
        }

        file.flush()?;
        drop(file);

        let actual_size = fs::metadata(&temp_path)?.len();

        if let Some(expected) = content_length {
            if actual_size != expected {
                fs::remove_file(&temp_path).ok();
                return Err(SeparationError::ModelDownloadFailed(format!(
                    "Download incomplete: expected {} bytes, got {}",
                    expected, actual_size
                )));
            }
        }

        fs::rename(&temp_path, target_path)?;

        log::info!(
            "Successfully downloaded {:?} ({} bytes)",
            target_path.file_name().unwrap_or_default(),
            actual_size
        );

        if let Some(cb) = progress {
            cb(1.0);
        }

        Ok(())
    }

    /// Delete a cached model
    pub fn delete_model(&self, model_file: &str) -> Result<()> {
        let model_path = self.model_path(model_file);
        if model_path.exists() {
            fs::remove_file(&model_path)?;
            log::info!("Deleted cached model: {:?}", model_path);
        }
        Ok(())
    }

    /// Total size of all cached `.onnx` files
    pub fn cache_size(&self) -> u64 {
        let Ok(entries) = fs::read_dir(&self.cache_dir) else {
            return 0;
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "onnx"))
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }
}
