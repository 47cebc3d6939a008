//! Application state.

use chrono::{DateTime, Utc};
use lipsync_models::{InferenceOptions, ModelVariant, RunEvent, RunId, RunStatus};
use lipsync_worker::{InferenceOrchestrator, PipelineConfig, PipelineResult, RunReport};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

use crate::config::ApiConfig;

/// Why a run did not complete.
#[derive(Debug, Clone, Serialize)]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
    /// Standard error of the failing tool, verbatim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// Public view of the produced artifact.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactView {
    pub size_bytes: u64,
    pub variant: ModelVariant,
    pub url: String,
}

/// Snapshot of a run as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub options: InferenceOptions,
    pub preprocessing_percent: u8,
    pub output: Vec<String>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<RunFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactView>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

struct RunRecord {
    view: RunView,
    artifact_path: Option<PathBuf>,
    cancel: watch::Sender<bool>,
}

/// What happened when a cancellation was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Signalled,
    AlreadyFinished(RunStatus),
    Unknown,
}

/// In-memory registry of runs started by this process.
#[derive(Clone, Default)]
pub struct RunRegistry {
    runs: Arc<RwLock<HashMap<RunId, RunRecord>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queued run and return the receiver its pipeline watches.
    pub async fn insert(&self, run_id: RunId, options: InferenceOptions) -> watch::Receiver<bool> {
        let (cancel, rx) = watch::channel(false);
        let view = RunView {
            run_id: run_id.clone(),
            status: RunStatus::Queued,
            options,
            preprocessing_percent: 0,
            output: Vec::new(),
            warnings: Vec::new(),
            failure: None,
            artifact: None,
            created_at: Utc::now(),
            finished_at: None,
        };
        self.runs.write().await.insert(
            run_id,
            RunRecord {
                view,
                artifact_path: None,
                cancel,
            },
        );
        rx
    }

    pub async fn get(&self, run_id: &RunId) -> Option<RunView> {
        self.runs.read().await.get(run_id).map(|r| r.view.clone())
    }

    /// Fold a progress event into the run's view.
    pub async fn apply(&self, run_id: &RunId, event: RunEvent) {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.get_mut(run_id) else {
            return;
        };
        let view = &mut record.view;
        match event {
            // Terminal status only comes from the final report.
            RunEvent::Stage { status } if !status.is_terminal() => view.status = status,
            RunEvent::Stage { .. } => {}
            RunEvent::Preprocessing { percent } => {
                view.preprocessing_percent = view.preprocessing_percent.max(percent)
            }
            RunEvent::InferenceOutput { line } => view.output.push(line),
            RunEvent::Warning { message } => view.warnings.push(message),
        }
    }

    /// Record the final outcome of a run.
    pub async fn finish(&self, report: &RunReport) {
        let mut runs = self.runs.write().await;
        let Some(record) = runs.get_mut(&report.run_id) else {
            return;
        };
        let view = &mut record.view;
        view.status = report.status();
        view.finished_at = Some(report.finished_at);

        match &report.result {
            Ok(artifact) => {
                view.preprocessing_percent = 100;
                view.artifact = Some(ArtifactView {
                    size_bytes: artifact.size_bytes,
                    variant: artifact.variant,
                    url: format!("/api/runs/{}/result", report.run_id),
                });
                record.artifact_path = Some(artifact.path.clone());
            }
            Err(e) => {
                view.failure = Some(RunFailure {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    diagnostic: e
                        .diagnostic()
                        .filter(|d| !d.trim().is_empty())
                        .map(str::to_string),
                });
            }
        }
    }

    pub async fn cancel(&self, run_id: &RunId) -> CancelOutcome {
        let runs = self.runs.read().await;
        match runs.get(run_id) {
            None => CancelOutcome::Unknown,
            Some(record) if record.view.status.is_terminal() => {
                CancelOutcome::AlreadyFinished(record.view.status)
            }
            Some(record) => {
                record.cancel.send_replace(true);
                CancelOutcome::Signalled
            }
        }
    }

    pub async fn contains(&self, run_id: &RunId) -> bool {
        self.runs.read().await.contains_key(run_id)
    }

    /// Forget finished runs that ended before `cutoff` and return their ids.
    pub async fn evict_finished_before(&self, cutoff: DateTime<Utc>) -> Vec<RunId> {
        let mut runs = self.runs.write().await;
        let expired: Vec<RunId> = runs
            .iter()
            .filter(|(_, r)| {
                r.view.status.is_terminal() && r.view.finished_at.is_some_and(|t| t < cutoff)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for run_id in &expired {
            runs.remove(run_id);
        }
        expired
    }

    /// Current status and, once completed, the artifact location.
    pub async fn artifact(&self, run_id: &RunId) -> Option<(RunStatus, Option<PathBuf>)> {
        self.runs
            .read()
            .await
            .get(run_id)
            .map(|r| (r.view.status, r.artifact_path.clone()))
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub orchestrator: Arc<InferenceOrchestrator>,
    pub runs: RunRegistry,
}

impl AppState {
    /// Create new application state.
    pub fn new(config: ApiConfig, pipeline: PipelineConfig) -> PipelineResult<Self> {
        let orchestrator = InferenceOrchestrator::from_config(pipeline)?;
        Ok(Self::with_orchestrator(config, Arc::new(orchestrator)))
    }

    pub fn with_orchestrator(config: ApiConfig, orchestrator: Arc<InferenceOrchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            runs: RunRegistry::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lipsync_media::fs_utils::CleanupOutcome;
    use lipsync_worker::PipelineError;

    fn failed_report(run_id: &RunId, finished_at: DateTime<Utc>) -> RunReport {
        RunReport {
            run_id: run_id.clone(),
            result: Err(PipelineError::Cancelled),
            preprocessing: None,
            cleanup: CleanupOutcome::Removed,
            started_at: finished_at,
            finished_at,
        }
    }

    #[tokio::test]
    async fn test_evict_only_old_finished_runs() {
        let registry = RunRegistry::new();
        let now = Utc::now();
        let old = RunId::from_string("old");
        let recent = RunId::from_string("recent");
        let active = RunId::from_string("active");
        for run_id in [&old, &recent, &active] {
            registry.insert(run_id.clone(), InferenceOptions::default()).await;
        }
        registry
            .finish(&failed_report(&old, now - chrono::Duration::hours(2)))
            .await;
        registry.finish(&failed_report(&recent, now)).await;

        let evicted = registry
            .evict_finished_before(now - chrono::Duration::hours(1))
            .await;

        assert_eq!(evicted, vec![old.clone()]);
        assert!(registry.get(&old).await.is_none());
        assert!(registry.contains(&recent).await);
        assert!(registry.contains(&active).await);
    }

    #[tokio::test]
    async fn test_events_fold_into_view() {
        let registry = RunRegistry::new();
        let run_id = RunId::from_string("r1");
        registry.insert(run_id.clone(), InferenceOptions::default()).await;

        registry.apply(&run_id, RunEvent::stage(RunStatus::Preprocessing)).await;
        registry.apply(&run_id, RunEvent::Preprocessing { percent: 40 }).await;
        registry.apply(&run_id, RunEvent::Preprocessing { percent: 30 }).await;
        registry.apply(&run_id, RunEvent::output("Load checkpoint")).await;
        registry.apply(&run_id, RunEvent::stage(RunStatus::Completed)).await;

        let view = registry.get(&run_id).await.unwrap();
        assert_eq!(view.status, RunStatus::Preprocessing);
        assert_eq!(view.preprocessing_percent, 40);
        assert_eq!(view.output, vec!["Load checkpoint"]);
    }

    #[tokio::test]
    async fn test_cancel_signals_receiver() {
        let registry = RunRegistry::new();
        let run_id = RunId::from_string("r2");
        let rx = registry.insert(run_id.clone(), InferenceOptions::default()).await;

        assert_eq!(registry.cancel(&run_id).await, CancelOutcome::Signalled);
        assert!(*rx.borrow());
        assert_eq!(
            registry.cancel(&RunId::from_string("nope")).await,
            CancelOutcome::Unknown
        );
    }
}
