//! Per-run scratch namespace.
//!
//! ```text
//! <work_dir>/<run_id>/              scratch root, inference working directory
//!     processed_input.mp4           preprocessed face video
//!     audio.wav                     converted audio (non-WAV input only)
//!     results/result_voice.mp4      artifact written by the inference program
//!     temp/                         intermediates of the inference program
//! <output_dir>/<run_id>/<artifact>  artifact after a successful run
//! ```

use lipsync_media::fs_utils::{remove_dir_best_effort, CleanupOutcome};
use lipsync_models::RunId;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, PipelineResult};

/// File name of the preprocessed video inside the scratch root.
pub const PREPROCESSED_VIDEO_NAME: &str = "processed_input.mp4";

/// Intermediates directory the inference program expects in its working directory.
pub const INFERENCE_TEMP_DIR: &str = "temp";

/// Scratch directory owned by a single run.
#[derive(Debug, Clone)]
pub struct RunScratch {
    run_id: RunId,
    root: PathBuf,
}

impl RunScratch {
    /// Create `work_dir/<run_id>`. The id must be usable as a path component.
    pub async fn create(work_dir: &Path, run_id: &RunId) -> PipelineResult<Self> {
        if !run_id.is_path_safe() {
            return Err(PipelineError::config(format!(
                "run id {:?} cannot be used as a directory name",
                run_id.as_str()
            )));
        }

        let root = std::path::absolute(work_dir.join(run_id.as_str()))?;
        tokio::fs::create_dir_all(&root).await?;

        Ok(Self {
            run_id: run_id.clone(),
            root,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Absolute scratch root; also the inference program's working directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn preprocessed_video(&self) -> PathBuf {
        self.root.join(PREPROCESSED_VIDEO_NAME)
    }

    /// Where the inference program leaves its artifact.
    pub fn result_path(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Create the directories the inference program writes into but never
    /// creates itself, and return where its artifact will land.
    pub async fn prepare_inference(&self, result_relative: &Path) -> PipelineResult<PathBuf> {
        let result = self.result_path(result_relative);
        if let Some(parent) = result.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::create_dir_all(self.root.join(INFERENCE_TEMP_DIR)).await?;
        Ok(result)
    }

    /// Remove the whole scratch tree. Never fails; problems come back as a value.
    pub async fn remove(self) -> CleanupOutcome {
        remove_dir_best_effort(&self.root).await
    }
}

/// Final location of a run's artifact.
pub fn output_path(output_dir: &Path, run_id: &RunId, file_name: &str) -> PathBuf {
    output_dir.join(run_id.as_str()).join(file_name)
}
