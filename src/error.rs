//! Error types for the verification pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Failures raised by pipeline stages
///
/// Expected branches (face mismatch, duplicate user, missing fields) are
/// not errors; they are reported through `PipelineOutcome`.
#[derive(Debug, Error)]
pub enum EkycError {
    #[error("failed to read image from {source_name}: {source}")]
    Decode {
        source_name: String,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to read image file {path:?}: {source}")]
    ImageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to save image to {path:?}: {reason}")]
    Save { path: PathBuf, reason: String },

    #[error("database error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("stored embedding is not valid JSON: {0}")]
    EmbeddingFormat(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Model(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EkycError {
    /// Wrap an ONNX Runtime or tensor-shape failure
    pub fn inference(err: impl std::fmt::Display) -> Self {
        EkycError::Inference(err.to_string())
    }
}

/// Result alias for pipeline stages
pub type Result<T> = std::result::Result<T, EkycError>;
