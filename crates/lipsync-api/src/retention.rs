//! Background expiry of finished runs and their results.
//!
//! Each sweep:
//! - forgets runs that finished more than `ttl` ago
//! - deletes their `output_dir/<run_id>/` directories
//! - deletes result directories no run in this process knows about, such as
//!   those left by a previous process, once they are older than `ttl`

use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use lipsync_media::fs_utils::{remove_dir_best_effort, CleanupOutcome};
use lipsync_models::RunId;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::state::{AppState, RunRegistry};

/// Interval between retention sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Retention sweeper service.
pub struct RetentionSweeper {
    runs: RunRegistry,
    output_dir: PathBuf,
    ttl: Duration,
}

impl RetentionSweeper {
    pub fn new(state: &AppState) -> Self {
        Self {
            runs: state.runs.clone(),
            output_dir: state.orchestrator.config().output_dir.clone(),
            ttl: state.config.result_ttl,
        }
    }

    /// Sweep forever. Returns immediately when retention is unlimited.
    pub async fn run(&self) {
        if self.ttl.is_zero() {
            info!("Result retention is unlimited, sweeper disabled");
            return;
        }

        info!(
            "Starting retention sweeper (ttl: {:?}, interval: {:?})",
            self.ttl, SWEEP_INTERVAL
        );

        let mut ticker = interval(SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            let removed = self.sweep_once(Utc::now()).await;
            if removed > 0 {
                info!("Retention sweep removed {} runs", removed);
            }
        }
    }

    /// Run a single sweep as of `now`; returns how many runs were removed.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> usize {
        if self.ttl.is_zero() {
            return 0;
        }
        let Some(cutoff) = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_sub_signed(ttl))
        else {
            return 0;
        };

        let expired = self.runs.evict_finished_before(cutoff).await;
        for run_id in &expired {
            self.remove_results(run_id).await;
        }

        let orphans = self.remove_orphans(cutoff).await;
        let removed = expired.len() + orphans;
        metrics::record_runs_expired(removed as u64);
        removed
    }

    async fn remove_results(&self, run_id: &RunId) {
        let dir = self.output_dir.join(run_id.as_str());
        if let CleanupOutcome::Degraded { path, reason } = remove_dir_best_effort(&dir).await {
            warn!(run_id = %run_id, "Expired results {} not removed: {}", path.display(), reason);
        }
    }

    async fn remove_orphans(&self, cutoff: DateTime<Utc>) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.output_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Output directory {} not readable: {}", self.output_dir.display(), e);
                return 0;
            }
        };

        let cutoff = SystemTime::from(cutoff);
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let run_id = RunId::from_string(name);
            if !run_id.is_path_safe() || self.runs.contains(&run_id).await {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            if modified >= cutoff {
                continue;
            }
            if let Ok(file_type) = entry.file_type().await {
                if file_type.is_dir() {
                    self.remove_results(&run_id).await;
                    removed += 1;
                }
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lipsync_models::{InferenceOptions, ModelVariant};
    use lipsync_worker::{InferenceArtifact, RunReport};
    use tempfile::TempDir;

    fn sweeper(runs: RunRegistry, output_dir: PathBuf, ttl: Duration) -> RetentionSweeper {
        RetentionSweeper {
            runs,
            output_dir,
            ttl,
        }
    }

    async fn completed_run(runs: &RunRegistry, output_dir: &std::path::Path, id: &str) -> PathBuf {
        let run_id = RunId::from_string(id);
        runs.insert(run_id.clone(), InferenceOptions::default()).await;
        let dir = output_dir.join(id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("result_voice.mp4");
        tokio::fs::write(&path, b"video").await.unwrap();

        let now = Utc::now();
        runs.finish(&RunReport {
            run_id,
            result: Ok(InferenceArtifact {
                path,
                size_bytes: 5,
                variant: ModelVariant::Standard,
            }),
            preprocessing: None,
            cleanup: CleanupOutcome::Removed,
            started_at: now,
            finished_at: now,
        })
        .await;
        dir
    }

    #[tokio::test]
    async fn test_expired_runs_lose_record_and_results() {
        let dir = TempDir::new().unwrap();
        let runs = RunRegistry::new();
        let result_dir = completed_run(&runs, dir.path(), "run-done").await;
        let sweeper = sweeper(runs.clone(), dir.path().to_path_buf(), Duration::from_secs(60));

        // Still inside the retention window.
        assert_eq!(sweeper.sweep_once(Utc::now()).await, 0);
        assert!(result_dir.exists());

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(sweeper.sweep_once(later).await, 1);
        assert!(!result_dir.exists());
        assert!(runs.get(&RunId::from_string("run-done")).await.is_none());
    }

    #[tokio::test]
    async fn test_running_runs_are_kept() {
        let dir = TempDir::new().unwrap();
        let runs = RunRegistry::new();
        runs.insert(RunId::from_string("run-busy"), InferenceOptions::default())
            .await;
        let result_dir = dir.path().join("run-busy");
        tokio::fs::create_dir_all(&result_dir).await.unwrap();
        let sweeper = sweeper(runs.clone(), dir.path().to_path_buf(), Duration::from_secs(60));

        let later = Utc::now() + chrono::Duration::hours(1);
        assert_eq!(sweeper.sweep_once(later).await, 0);
        assert!(result_dir.exists());
        assert!(runs.contains(&RunId::from_string("run-busy")).await);
    }

    #[tokio::test]
    async fn test_unknown_result_dirs_expire() {
        let dir = TempDir::new().unwrap();
        let leftover = dir.path().join("from-previous-process");
        tokio::fs::create_dir_all(&leftover).await.unwrap();
        tokio::fs::write(leftover.join("result_voice.mp4"), b"video").await.unwrap();
        let sweeper = sweeper(RunRegistry::new(), dir.path().to_path_buf(), Duration::from_secs(60));

        assert_eq!(sweeper.sweep_once(Utc::now()).await, 0);
        assert!(leftover.exists());

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(sweeper.sweep_once(later).await, 1);
        assert!(!leftover.exists());
    }

    #[tokio::test]
    async fn test_zero_ttl_keeps_everything() {
        let dir = TempDir::new().unwrap();
        let runs = RunRegistry::new();
        let result_dir = completed_run(&runs, dir.path(), "run-keep").await;
        let sweeper = sweeper(runs, dir.path().to_path_buf(), Duration::ZERO);

        let later = Utc::now() + chrono::Duration::days(30);
        assert_eq!(sweeper.sweep_once(later).await, 0);
        assert!(result_dir.exists());
    }
}
