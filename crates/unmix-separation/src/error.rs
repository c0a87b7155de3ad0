//! Separation error types

use serde::{Deserialize, Serialize};
use thiserror::Error;
use unmix_core::AudioError;

/// Errors that can end a separation job
#[derive(Error, Debug)]
pub enum SeparationError {
    #[error("Decode failed: {0}")]
    Decode(#[source] AudioError),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Resource limit exceeded: {0}")]
    ResourceExceeded(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Encode failed: {0}")]
    Encode(#[source] AudioError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Model download failed: {0}")]
    ModelDownloadFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SeparationError {
    /// Category reported to callers
    pub fn kind(&self) -> ErrorKind {
        match self {
            SeparationError::Decode(_) => ErrorKind::DecodeError,
            SeparationError::Model(_)
            | SeparationError::ModelNotFound(_)
            | SeparationError::ModelDownloadFailed(_) => ErrorKind::ModelError,
            SeparationError::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            SeparationError::Cancelled => ErrorKind::Cancelled,
            SeparationError::Encode(_) => ErrorKind::EncodeError,
            SeparationError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            SeparationError::InvalidConfig(_)
            | SeparationError::Internal(_)
            | SeparationError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Map an error raised while reading the upload
    ///
    /// Over-long streams are a resource limit, not a malformed input.
    pub fn from_decode(err: AudioError) -> Self {
        match err {
            AudioError::DurationExceeded { .. } => SeparationError::ResourceExceeded(err.to_string()),
            other => SeparationError::Decode(other),
        }
    }
}

/// Error category carried in a failure response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    DecodeError,
    ModelError,
    ResourceExceeded,
    Cancelled,
    EncodeError,
    InvalidRequest,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::DecodeError => "DecodeError",
            ErrorKind::ModelError => "ModelError",
            ErrorKind::ResourceExceeded => "ResourceExceeded",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::EncodeError => "EncodeError",
            ErrorKind::InvalidRequest => "InvalidRequest",
            ErrorKind::Internal => "Internal",
        };
        f.write_str(name)
    }
}

pub type Result<T> = std::result::Result<T, SeparationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_exceeded_maps_to_resource_limit() {
        let err = SeparationError::from_decode(AudioError::DurationExceeded {
            actual_secs: 700.0,
            max_secs: 600.0,
        });
        assert_eq!(err.kind(), ErrorKind::ResourceExceeded);

        let err = SeparationError::from_decode(AudioError::Corrupt("bad frame".to_string()));
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }

    #[test]
    fn test_model_failures_share_kind() {
        assert_eq!(SeparationError::Model("nan".into()).kind(), ErrorKind::ModelError);
        assert_eq!(
            SeparationError::ModelNotFound("a.onnx".into()).kind(),
            ErrorKind::ModelError
        );
    }
}
