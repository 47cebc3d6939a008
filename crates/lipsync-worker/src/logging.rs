//! Structured run logging.

use lipsync_models::{RunId, RunStatus};
use tracing::{error, info, warn, Span};

/// Logs run lifecycle events with the run id and current stage attached.
#[derive(Debug, Clone)]
pub struct RunLogger {
    run_id: String,
    stage: RunStatus,
}

impl RunLogger {
    pub fn new(run_id: &RunId) -> Self {
        Self {
            run_id: run_id.to_string(),
            stage: RunStatus::Queued,
        }
    }

    /// Enter a new stage and log it.
    pub fn stage(&mut self, stage: RunStatus) {
        self.stage = stage;
        info!(
            run_id = %self.run_id,
            stage = stage.as_str(),
            "Run stage: {}", stage.as_str()
        );
    }

    pub fn log_start(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            stage = self.stage.as_str(),
            "Run started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            stage = self.stage.as_str(),
            "Run progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            run_id = %self.run_id,
            stage = self.stage.as_str(),
            "Run warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            run_id = %self.run_id,
            stage = self.stage.as_str(),
            "Run error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            run_id = %self.run_id,
            stage = self.stage.as_str(),
            "Run completed: {}", message
        );
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn current_stage(&self) -> RunStatus {
        self.stage
    }

    /// Span covering the whole run.
    pub fn create_span(&self) -> Span {
        tracing::info_span!("run", run_id = %self.run_id)
    }
}
