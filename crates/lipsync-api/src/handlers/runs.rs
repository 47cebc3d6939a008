//! Run submission, polling, cancellation and result delivery.

use std::path::{Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::Response;
use axum::Json;
use lipsync_media::fs_utils::remove_dir_best_effort;
use lipsync_models::defaults::{RESULT_DOWNLOAD_NAME, RESULT_MIME_TYPE};
use lipsync_models::{InferenceOptions, RunId, RunStatus};
use lipsync_worker::RunRequest;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::runner::spawn_run;
use crate::state::{AppState, CancelOutcome, RunView};

/// Response for an accepted or cancelled run.
#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub run_id: RunId,
    pub status: RunStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResultQuery {
    pub download: Option<String>,
}

struct Uploads {
    video: PathBuf,
    audio: PathBuf,
    options: InferenceOptions,
}

/// Parse a form checkbox value.
fn parse_flag(name: &str, value: &str) -> ApiResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ApiError::bad_request(format!(
            "'{}' must be a boolean, got {:?}",
            name, other
        ))),
    }
}

/// Extension of an uploaded file name, if it is a plain short one.
fn upload_extension(file_name: Option<&str>, fallback: &str) -> String {
    file_name
        .and_then(|name| FsPath::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| ext.to_lowercase())
        .unwrap_or_else(|| fallback.to_string())
}

async fn save_field(mut field: Field<'_>, path: &FsPath) -> ApiResult<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = field.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

async fn read_uploads(mut multipart: Multipart, upload_dir: &FsPath) -> ApiResult<Uploads> {
    let mut video = None;
    let mut audio = None;
    let mut options = InferenceOptions::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "video" | "audio" => {
                let fallback = if name == "video" { "mp4" } else { "bin" };
                let ext = upload_extension(field.file_name(), fallback);
                let path = upload_dir.join(format!("{}.{}", name, ext));
                let bytes = save_field(field, &path).await?;
                if bytes == 0 {
                    return Err(ApiError::bad_request(format!("'{}' is empty", name)));
                }
                metrics::record_upload_bytes(&name, bytes);
                if name == "video" {
                    video = Some(path);
                } else {
                    audio = Some(path);
                }
            }
            "use_gan" => options.use_gan = parse_flag(&name, &field.text().await?)?,
            "no_smooth" => options.smoothing_disabled = parse_flag(&name, &field.text().await?)?,
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    match (video, audio) {
        (Some(video), Some(audio)) => Ok(Uploads {
            video,
            audio,
            options,
        }),
        (None, _) => Err(ApiError::bad_request("missing 'video' file")),
        (_, None) => Err(ApiError::bad_request("missing 'audio' file")),
    }
}

/// Accept a video and an audio file and start a run in the background.
pub async fn create_run(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let run_id = RunId::new();
    let upload_dir = state.config.upload_dir.join(run_id.as_str());
    tokio::fs::create_dir_all(&upload_dir).await?;

    let uploads = match read_uploads(multipart, &upload_dir).await {
        Ok(uploads) => uploads,
        Err(e) => {
            remove_dir_best_effort(&upload_dir).await;
            return Err(e);
        }
    };

    let options = uploads.options;
    let request = RunRequest::new(uploads.video, uploads.audio, options).with_run_id(run_id.clone());
    let cancel = state.runs.insert(run_id.clone(), options).await;
    metrics::record_run_submitted(options.variant().as_str());
    info!(
        run_id = %run_id,
        variant = options.variant().as_str(),
        nosmooth = options.smoothing_disabled,
        "Run accepted"
    );

    spawn_run(state.clone(), request, cancel, upload_dir);

    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            run_id,
            status: RunStatus::Queued,
        }),
    ))
}

/// Current state of a run.
pub async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<Json<RunView>> {
    let run_id = RunId::from_string(run_id);
    state
        .runs
        .get(&run_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("run {} not found", run_id)))
}

/// Ask a running pipeline to stop.
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<(StatusCode, Json<RunAccepted>)> {
    let run_id = RunId::from_string(run_id);
    match state.runs.cancel(&run_id).await {
        CancelOutcome::Signalled => {
            info!(run_id = %run_id, "Cancellation requested");
            let status = state
                .runs
                .get(&run_id)
                .await
                .map(|v| v.status)
                .unwrap_or(RunStatus::Cancelled);
            Ok((StatusCode::ACCEPTED, Json(RunAccepted { run_id, status })))
        }
        CancelOutcome::AlreadyFinished(status) => Err(ApiError::conflict(format!(
            "run {} already finished ({})",
            run_id, status
        ))),
        CancelOutcome::Unknown => Err(ApiError::not_found(format!("run {} not found", run_id))),
    }
}

/// Serve the lip-synced video of a completed run.
pub async fn get_result(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> ApiResult<Response> {
    let run_id = RunId::from_string(run_id);
    let path = match state.runs.artifact(&run_id).await {
        None => return Err(ApiError::not_found(format!("run {} not found", run_id))),
        Some((_, Some(path))) => path,
        Some((status, None)) => {
            return Err(ApiError::conflict(format!(
                "run {} has no result ({})",
                run_id, status
            )))
        }
    };

    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ApiError::not_found(format!("result of run {} is gone", run_id))
        } else {
            ApiError::Io(e)
        }
    })?;

    let download = match query.download.as_deref() {
        Some(value) => parse_flag("download", value)?,
        None => false,
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, RESULT_MIME_TYPE)
        .header(header::CONTENT_LENGTH, bytes.len());
    if download {
        builder = builder.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", RESULT_DOWNLOAD_NAME),
        );
    }

    builder
        .body(Body::from(bytes))
        .map_err(|e| ApiError::internal(format!("Failed to build response: {}", e)))
}
