//! Pipeline configuration.

use lipsync_media::{AlignerConfig, VideoProcessorConfig};
use lipsync_models::defaults::{
    DEFAULT_CHECKPOINT_DIR, DEFAULT_MAX_ALIGN_ANGLE, DEFAULT_PREPROCESS_CODEC,
    DEFAULT_RESULT_RELATIVE_PATH, DEFAULT_TARGET_HEIGHT,
};
use lipsync_models::ModelVariant;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::error::{PipelineError, PipelineResult};

/// Where model weights live and where they come from.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    pub checkpoint_dir: PathBuf,
    pub standard_url: String,
    pub gan_url: String,
    /// Whole-request timeout for one download
    pub download_timeout: Duration,
    pub connect_timeout: Duration,
    /// YuNet model used by the face aligner, fetched from `face_model_url` when set
    pub face_model_path: Option<PathBuf>,
    pub face_model_url: Option<String>,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from(DEFAULT_CHECKPOINT_DIR),
            standard_url: ModelVariant::Standard.default_url().to_string(),
            gan_url: ModelVariant::Gan.default_url().to_string(),
            download_timeout: Duration::from_secs(1800),
            connect_timeout: Duration::from_secs(30),
            face_model_path: None,
            face_model_url: None,
        }
    }
}

impl ProvisionerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            checkpoint_dir: std::env::var("LIPSYNC_CHECKPOINT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.checkpoint_dir),
            standard_url: std::env::var("LIPSYNC_MODEL_URL_STANDARD")
                .unwrap_or(defaults.standard_url),
            gan_url: std::env::var("LIPSYNC_MODEL_URL_GAN").unwrap_or(defaults.gan_url),
            download_timeout: std::env::var("LIPSYNC_DOWNLOAD_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.download_timeout),
            connect_timeout: defaults.connect_timeout,
            face_model_path: std::env::var("LIPSYNC_FACE_MODEL_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            face_model_url: std::env::var("LIPSYNC_FACE_MODEL_URL")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }

    /// Remote location of a variant's weights.
    pub fn url(&self, variant: ModelVariant) -> &str {
        match variant {
            ModelVariant::Standard => &self.standard_url,
            ModelVariant::Gan => &self.gan_url,
        }
    }

    /// Local path of a variant's weights.
    pub fn weights_path(&self, variant: ModelVariant) -> PathBuf {
        self.checkpoint_dir.join(variant.file_name())
    }

    pub fn validate(&self) -> PipelineResult<()> {
        for variant in ModelVariant::ALL {
            parse_http_url(self.url(*variant))?;
        }
        if let Some(url) = &self.face_model_url {
            parse_http_url(url)?;
            if self.face_model_path.is_none() {
                return Err(PipelineError::config(
                    "LIPSYNC_FACE_MODEL_URL is set but LIPSYNC_FACE_MODEL_PATH is not",
                ));
            }
        }
        Ok(())
    }
}

fn parse_http_url(raw: &str) -> PipelineResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| PipelineError::config(format!("invalid download URL {:?}: {}", raw, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(PipelineError::config(format!(
            "unsupported URL scheme {:?} in {}",
            other, raw
        ))),
    }
}

/// How the external inference program is launched.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Interpreter or executable to spawn
    pub program: String,
    /// Script passed as the first argument; `None` runs `program` directly
    pub script: Option<PathBuf>,
    /// Artifact location relative to the child's working directory
    pub result_relative_path: PathBuf,
    /// Kill the child after this long; no limit when `None`
    pub timeout: Option<Duration>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            program: "python".to_string(),
            script: Some(PathBuf::from("inference.py")),
            result_relative_path: PathBuf::from(DEFAULT_RESULT_RELATIVE_PATH),
            timeout: None,
        }
    }
}

impl InferenceConfig {
    /// Create config from environment variables.
    ///
    /// An empty `LIPSYNC_INFERENCE_SCRIPT` runs the program without a script.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            program: std::env::var("LIPSYNC_INFERENCE_PROGRAM").unwrap_or(defaults.program),
            script: match std::env::var("LIPSYNC_INFERENCE_SCRIPT") {
                Ok(s) if s.is_empty() => None,
                Ok(s) => Some(PathBuf::from(s)),
                Err(_) => defaults.script,
            },
            result_relative_path: defaults.result_relative_path,
            timeout: std::env::var("LIPSYNC_INFERENCE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

/// Everything one pipeline run needs to know.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Per-run scratch directories are created under here
    pub work_dir: PathBuf,
    /// Artifacts are moved to `output_dir/<run_id>/`
    pub output_dir: PathBuf,
    pub processor: VideoProcessorConfig,
    pub provisioner: ProvisionerConfig,
    pub inference: InferenceConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("lipsync"),
            output_dir: PathBuf::from("results"),
            processor: VideoProcessorConfig::default(),
            provisioner: ProvisionerConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_angle = std::env::var("LIPSYNC_MAX_ALIGN_ANGLE")
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|a| a.is_finite() && *a > 0.0)
            .unwrap_or(DEFAULT_MAX_ALIGN_ANGLE);

        Self {
            work_dir: std::env::var("LIPSYNC_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            output_dir: std::env::var("LIPSYNC_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            processor: VideoProcessorConfig {
                target_height: std::env::var("LIPSYNC_TARGET_HEIGHT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|h| *h > 0)
                    .unwrap_or(DEFAULT_TARGET_HEIGHT),
                codec: std::env::var("LIPSYNC_VIDEO_CODEC")
                    .unwrap_or_else(|_| DEFAULT_PREPROCESS_CODEC.to_string()),
                aligner: AlignerConfig::default().with_max_angle(max_angle),
                ..defaults.processor
            },
            provisioner: ProvisionerConfig::from_env(),
            inference: InferenceConfig::from_env(),
        }
    }

    pub fn validate(&self) -> PipelineResult<()> {
        self.provisioner.validate()?;
        if self.inference.program.trim().is_empty() {
            return Err(PipelineError::config("inference program must not be empty"));
        }
        if self.inference.result_relative_path.is_absolute() {
            return Err(PipelineError::config(
                "result path must be relative to the inference working directory",
            ));
        }
        Ok(())
    }
}
