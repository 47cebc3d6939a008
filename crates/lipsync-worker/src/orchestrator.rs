//! End-to-end lip-sync run: provision, preprocess, infer, collect.
//!
//! A run never shares files with another run: its scratch directory, the
//! inference program's working directory and the final artifact location
//! are all keyed by the [`RunId`].

use chrono::{DateTime, Utc};
use lipsync_media::audio::normalize_audio;
use lipsync_media::command::{collect_output, wait_for_exit};
use lipsync_media::fs_utils::{ensure_non_empty_file, move_file, CleanupOutcome};
use lipsync_media::{
    default_detector_factory, MediaError, Preprocessor, ProcessedVideo, VideoProcessor,
};
use lipsync_models::{InferenceOptions, ModelVariant, RunEvent, RunId, RunStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::Instrument;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::inference::{forward_lines, InferenceCommand};
use crate::logging::RunLogger;
use crate::metrics;
use crate::provision::ModelProvisioner;
use crate::scratch::{output_path, RunScratch};

/// Receives progress events of a run.
pub type EventSender = mpsc::UnboundedSender<RunEvent>;

/// Inputs of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: RunId,
    pub video: PathBuf,
    pub audio: PathBuf,
    pub options: InferenceOptions,
}

impl RunRequest {
    pub fn new(video: impl Into<PathBuf>, audio: impl Into<PathBuf>, options: InferenceOptions) -> Self {
        Self {
            run_id: RunId::new(),
            video: video.into(),
            audio: audio.into(),
            options,
        }
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = run_id;
        self
    }
}

/// The produced lip-synced video.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub variant: ModelVariant,
}

/// Everything known about a finished run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: RunId,
    pub result: PipelineResult<InferenceArtifact>,
    /// Present once preprocessing succeeded
    pub preprocessing: Option<ProcessedVideo>,
    pub cleanup: CleanupOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        match &self.result {
            Ok(_) => RunStatus::Completed,
            Err(e) if e.is_cancelled() => RunStatus::Cancelled,
            Err(_) => RunStatus::Failed,
        }
    }

    pub fn artifact(&self) -> Option<&InferenceArtifact> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&PipelineError> {
        self.result.as_ref().err()
    }
}

/// Event sink that tolerates a missing or departed receiver.
#[derive(Clone)]
struct Events(Option<EventSender>);

impl Events {
    fn send(&self, event: RunEvent) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

/// Runs lip-sync inference against a video and an audio track.
#[derive(Clone)]
pub struct InferenceOrchestrator {
    config: PipelineConfig,
    provisioner: Arc<ModelProvisioner>,
    preprocessor: Arc<dyn Preprocessor>,
}

impl InferenceOrchestrator {
    pub fn new(
        config: PipelineConfig,
        provisioner: Arc<ModelProvisioner>,
        preprocessor: Arc<dyn Preprocessor>,
    ) -> Self {
        Self {
            config,
            provisioner,
            preprocessor,
        }
    }

    /// Wire up the FFmpeg preprocessor and an HTTP provisioner from `config`.
    pub fn from_config(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;
        let provisioner = Arc::new(ModelProvisioner::new(config.provisioner.clone())?);
        let detector_factory = default_detector_factory(config.provisioner.face_model_path.clone());
        let preprocessor = Arc::new(VideoProcessor::new(config.processor.clone(), detector_factory));
        Ok(Self::new(config, provisioner, preprocessor))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &Arc<ModelProvisioner> {
        &self.provisioner
    }

    /// Execute one run to completion.
    ///
    /// Never panics and never returns early: the outcome, including failures
    /// and cancellation, is in the report. The scratch directory is removed
    /// whatever happens.
    pub async fn run(
        &self,
        request: RunRequest,
        events: Option<EventSender>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> RunReport {
        let mut logger = RunLogger::new(&request.run_id);
        let span = logger.create_span();
        let events = Events(events);

        async move {
            let started_at = Utc::now();
            let start = Instant::now();
            let variant = request.options.variant();

            logger.log_start(&format!(
                "video={} audio={} variant={} nosmooth={}",
                request.video.display(),
                request.audio.display(),
                variant,
                request.options.smoothing_disabled
            ));

            let mut scratch = None;
            let mut preprocessing = None;
            let result = self
                .execute(
                    &request,
                    &mut scratch,
                    &mut preprocessing,
                    &events,
                    cancel,
                    &mut logger,
                )
                .await;

            let cleanup = match scratch {
                Some(scratch) => scratch.remove().await,
                None => CleanupOutcome::NotPresent,
            };
            if let CleanupOutcome::Degraded { path, reason } = &cleanup {
                metrics::record_cleanup_failure();
                let message = format!("scratch {} not removed: {}", path.display(), reason);
                logger.log_warning(&message);
                events.send(RunEvent::warning(message));
            }

            let report = RunReport {
                run_id: request.run_id.clone(),
                result,
                preprocessing,
                cleanup,
                started_at,
                finished_at: Utc::now(),
            };

            let status = report.status();
            logger.stage(status);
            events.send(RunEvent::stage(status));

            let outcome = match &report.result {
                Ok(artifact) => {
                    logger.log_completion(&format!(
                        "{} ({} bytes)",
                        artifact.path.display(),
                        artifact.size_bytes
                    ));
                    "success"
                }
                Err(e) if e.is_cancelled() => {
                    logger.log_progress("cancelled");
                    "cancelled"
                }
                Err(e) => {
                    logger.log_error(&e.to_string());
                    e.kind()
                }
            };
            metrics::record_run(outcome, variant.as_str(), start.elapsed().as_secs_f64());

            report
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        request: &RunRequest,
        scratch_slot: &mut Option<RunScratch>,
        preprocessing: &mut Option<ProcessedVideo>,
        events: &Events,
        cancel: Option<watch::Receiver<bool>>,
        logger: &mut RunLogger,
    ) -> PipelineResult<InferenceArtifact> {
        // Inputs first: nothing is downloaded or spawned for a run that cannot start.
        ensure_non_empty_file(&request.video)
            .await
            .map_err(PipelineError::from_input_check)?;
        ensure_non_empty_file(&request.audio)
            .await
            .map_err(PipelineError::from_input_check)?;

        let variant = request.options.variant();

        logger.stage(RunStatus::Provisioning);
        events.send(RunEvent::stage(RunStatus::Provisioning));
        let weights = self.provisioner.ensure(variant).await?;
        check_cancelled(&cancel)?;

        let scratch = scratch_slot.insert(RunScratch::create(&self.config.work_dir, &request.run_id).await?);

        logger.stage(RunStatus::Preprocessing);
        events.send(RunEvent::stage(RunStatus::Preprocessing));

        let audio = normalize_audio(&request.audio, scratch.root(), cancel.clone())
            .await
            .map_err(|e| match e {
                MediaError::Cancelled => PipelineError::Cancelled,
                e => PipelineError::AudioConversion(e),
            })?;

        let progress = |percent: u8| events.send(RunEvent::Preprocessing { percent });
        let processed = self
            .preprocessor
            .preprocess(
                &request.video,
                &scratch.preprocessed_video(),
                &progress,
                cancel.clone(),
            )
            .await
            .map_err(|e| match e {
                MediaError::Cancelled => PipelineError::Cancelled,
                e => PipelineError::Preprocessing(e),
            })?;

        if processed.alignment.degraded > 0 {
            let message = format!(
                "face detection failed on {} of {} frames; those frames were not aligned",
                processed.alignment.degraded, processed.frames
            );
            logger.log_warning(&message);
            events.send(RunEvent::warning(message));
        }
        logger.log_progress(&format!(
            "preprocessed {} frames at {}x{}",
            processed.frames, processed.width, processed.height
        ));
        let face = processed.output.clone();
        *preprocessing = Some(processed);
        check_cancelled(&cancel)?;

        logger.stage(RunStatus::Inferring);
        events.send(RunEvent::stage(RunStatus::Inferring));
        self.infer(request, variant, &weights, &face, &audio, scratch, events, cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn infer(
        &self,
        request: &RunRequest,
        variant: ModelVariant,
        weights: &Path,
        face: &Path,
        audio: &Path,
        scratch: &RunScratch,
        events: &Events,
        cancel: Option<watch::Receiver<bool>>,
    ) -> PipelineResult<InferenceArtifact> {
        let inference = &self.config.inference;
        let script = inference
            .script
            .as_deref()
            .map(std::path::absolute)
            .transpose()?;

        // The child runs inside the scratch root, so every path it gets is absolute.
        let cmd = InferenceCommand::new(
            inference.program.clone(),
            std::path::absolute(weights)?,
            std::path::absolute(face)?,
            std::path::absolute(audio)?,
        )
        .script(script)
        .smoothing_disabled(request.options.smoothing_disabled)
        .working_dir(scratch.root());

        let produced = scratch.prepare_inference(&inference.result_relative_path).await?;

        tracing::debug!("Running inference: {} {}", cmd.program(), cmd.build_args().join(" "));

        let start = Instant::now();
        let mut child = cmd.to_command().spawn().map_err(|e| {
            PipelineError::inference(
                format!("failed to start {}: {}", inference.program, e),
                None,
                String::new(),
            )
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = stdout.map(|s| forward_lines(s, events.0.clone(), request.run_id.to_string()));
        let stderr_task = stderr.map(|s| collect_output(s, None));

        let waited = wait_for_exit(&mut child, cancel, inference.timeout).await;

        let status = match waited {
            Ok(status) => status,
            Err(e) => {
                // Grandchildren may still hold the pipes open.
                if let Some(task) = stdout_task {
                    task.abort();
                }
                if let Some(task) = stderr_task {
                    task.abort();
                }
                return Err(match e {
                    MediaError::Cancelled => PipelineError::Cancelled,
                    MediaError::Timeout(secs) => PipelineError::Timeout(secs),
                    other => PipelineError::Media(other),
                });
            }
        };

        let lines = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => 0,
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        metrics::record_inference_duration(variant.as_str(), start.elapsed().as_secs_f64());
        tracing::debug!(
            exit_code = ?status.code(),
            lines,
            "Inference program exited"
        );

        if !status.success() {
            return Err(PipelineError::inference(
                format!("inference program exited with {}", status),
                status.code(),
                stderr,
            ));
        }
        if let Err(e) = ensure_non_empty_file(&produced).await {
            return Err(PipelineError::inference(
                format!("inference program exited successfully but {}", e),
                status.code(),
                stderr,
            ));
        }

        let file_name = produced
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "result.mp4".to_string());
        let destination = output_path(&self.config.output_dir, &request.run_id, &file_name);
        move_file(&produced, &destination).await?;
        let size_bytes = ensure_non_empty_file(&destination).await?;

        Ok(InferenceArtifact {
            path: destination,
            size_bytes,
            variant,
        })
    }
}

fn check_cancelled(cancel: &Option<watch::Receiver<bool>>) -> PipelineResult<()> {
    match cancel {
        Some(rx) if *rx.borrow() => Err(PipelineError::Cancelled),
        _ => Ok(()),
    }
}
