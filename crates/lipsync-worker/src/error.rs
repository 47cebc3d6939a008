//! Pipeline error types.

use lipsync_media::MediaError;
use std::path::PathBuf;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Missing input: {0}")]
    MissingInput(PathBuf),

    #[error("Empty input: {0}")]
    EmptyInput(PathBuf),

    #[error("Provisioning {asset} failed: {message}")]
    Provisioning { asset: String, message: String },

    #[error("Audio conversion failed: {0}")]
    AudioConversion(#[source] MediaError),

    #[error("Preprocessing failed: {0}")]
    Preprocessing(#[source] MediaError),

    #[error("Inference failed: {message}")]
    Inference {
        message: String,
        exit_code: Option<i32>,
        /// Standard error of the inference program, verbatim
        stderr: String,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Inference timed out after {0} seconds")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn provisioning(asset: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            asset: asset.into(),
            message: message.into(),
        }
    }

    pub fn inference(message: impl Into<String>, exit_code: Option<i32>, stderr: String) -> Self {
        Self::Inference {
            message: message.into(),
            exit_code,
            stderr,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Map a missing or empty input file to the matching error.
    pub fn from_input_check(error: MediaError) -> Self {
        match error {
            MediaError::FileNotFound(path) => Self::MissingInput(path),
            MediaError::EmptyFile(path) => Self::EmptyInput(path),
            other => Self::Media(other),
        }
    }

    /// Stable label for metrics and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingInput(_) | Self::EmptyInput(_) => "missing_input",
            Self::Provisioning { .. } => "provisioning",
            Self::AudioConversion(_) => "audio_conversion",
            Self::Preprocessing(_) => "preprocessing",
            Self::Inference { .. } => "inference",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::Config(_) => "config",
            Self::Media(_) => "media",
            Self::Io(_) => "io",
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Diagnostic output of the failing external tool, if any.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::Inference { stderr, .. } => Some(stderr.as_str()),
            Self::AudioConversion(e) | Self::Preprocessing(e) | Self::Media(e) => e.stderr(),
            _ => None,
        }
    }
}
