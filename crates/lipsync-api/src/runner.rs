//! Background execution of accepted runs.

use lipsync_media::fs_utils::{remove_dir_best_effort, CleanupOutcome};
use lipsync_worker::RunRequest;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics;
use crate::state::AppState;

/// Run the pipeline in the background, mirroring its events into the registry.
///
/// The uploaded inputs in `upload_dir` are deleted before the final status
/// becomes visible.
pub fn spawn_run(
    state: AppState,
    request: RunRequest,
    cancel: watch::Receiver<bool>,
    upload_dir: PathBuf,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let run_id = request.run_id.clone();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let consumer = {
            let registry = state.runs.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    registry.apply(&run_id, event).await;
                }
            })
        };

        let report = state.orchestrator.run(request, Some(tx), Some(cancel)).await;
        consumer.await.ok();

        if let CleanupOutcome::Degraded { path, reason } = remove_dir_best_effort(&upload_dir).await {
            warn!(run_id = %run_id, "Uploads {} not removed: {}", path.display(), reason);
        }

        state.runs.finish(&report).await;
        metrics::record_run_finished();
        info!(run_id = %run_id, status = report.status().as_str(), "Run finished");
    })
}
