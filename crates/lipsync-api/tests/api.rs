//! API integration tests, with a shell script in place of the inference program.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use lipsync_api::{create_router, ApiConfig, AppState};
use lipsync_media::{AlignmentStats, MediaResult, Preprocessor, ProcessedVideo, ProgressCallback};
use lipsync_models::ModelVariant;
use lipsync_worker::{InferenceOrchestrator, ModelProvisioner, PipelineConfig};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::watch;
use tower::ServiceExt;

const BOUNDARY: &str = "lipsync-test-boundary";

struct CopyPreprocessor;

#[async_trait]
impl Preprocessor for CopyPreprocessor {
    async fn preprocess(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressCallback<'_>,
        _cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ProcessedVideo> {
        tokio::fs::copy(input, output).await?;
        progress(100);
        Ok(ProcessedVideo {
            output: output.to_path_buf(),
            width: 640,
            height: 360,
            fps: 25.0,
            frames: 1,
            alignment: AlignmentStats::default(),
        })
    }
}

struct TestApp {
    _dir: TempDir,
    router: Router,
    upload_dir: PathBuf,
}

fn test_app(script: &str) -> TestApp {
    let dir = TempDir::new().unwrap();
    let root = dir.path();

    let checkpoints = root.join("checkpoints");
    std::fs::create_dir_all(&checkpoints).unwrap();
    for variant in ModelVariant::ALL {
        std::fs::write(checkpoints.join(variant.file_name()), b"weights").unwrap();
    }
    let script_path = root.join("infer.sh");
    std::fs::write(&script_path, script).unwrap();

    let mut pipeline = PipelineConfig::default();
    pipeline.work_dir = root.join("work");
    pipeline.output_dir = root.join("out");
    pipeline.provisioner.checkpoint_dir = checkpoints;
    pipeline.inference.program = "sh".to_string();
    pipeline.inference.script = Some(script_path);

    let provisioner = ModelProvisioner::new(pipeline.provisioner.clone()).unwrap();
    let orchestrator =
        InferenceOrchestrator::new(pipeline, Arc::new(provisioner), Arc::new(CopyPreprocessor));

    let config = ApiConfig {
        upload_dir: root.join("uploads"),
        ..ApiConfig::default()
    };
    let upload_dir = config.upload_dir.clone();
    let state = AppState::with_orchestrator(config, Arc::new(orchestrator));

    TestApp {
        _dir: dir,
        router: create_router(state, None),
        upload_dir,
    }
}

/// `(name, file_name, content)`; a `None` file name makes a plain text field.
fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file_name, content) in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                    name, file_name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
            ),
        }
        body.extend_from_slice(content);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, bytes.to_vec())
}

async fn submit(router: &Router, parts: &[(&str, Option<&str>, &[u8])]) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/runs")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap();
    let (status, _, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    let (status, _, body) = send(router, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

async fn wait_until_finished(router: &Router, run_id: &str) -> Value {
    for _ in 0..200 {
        let (status, body) = get_json(router, &format!("/api/runs/{}", run_id)).await;
        assert_eq!(status, StatusCode::OK);
        if matches!(body["status"].as_str(), Some("completed" | "failed" | "cancelled")) {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("run {} did not finish", run_id);
}

const SUCCESS_SCRIPT: &str = r#"
echo "Using cpu for inference."
echo "args: $*"
printf 'lipsynced video' > results/result_voice.mp4
"#;

/// Test health endpoint.
#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app(SUCCESS_SCRIPT);
    let (status, body) = get_json(&app.router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_metrics_disabled_is_not_routed() {
    let app = test_app(SUCCESS_SCRIPT);
    let (status, _) = get_json(&app.router, "/metrics").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_run_lifecycle() {
    let app = test_app(SUCCESS_SCRIPT);

    let (status, accepted) = submit(
        &app.router,
        &[
            ("video", Some("face.mp4"), b"video bytes"),
            ("audio", Some("voice.wav"), b"RIFF audio"),
            ("use_gan", None, b"true"),
            ("no_smooth", None, b"false"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(accepted["status"], "queued");
    let run_id = accepted["run_id"].as_str().unwrap().to_string();

    let view = wait_until_finished(&app.router, &run_id).await;
    assert_eq!(view["status"], "completed", "{}", view);
    assert_eq!(view["preprocessing_percent"], 100);
    assert_eq!(view["artifact"]["variant"], "gan");
    let output = view["output"].as_array().unwrap();
    assert_eq!(output[0], "Using cpu for inference.");
    let args = output[1].as_str().unwrap();
    assert!(args.contains("wav2lip_gan.pth"));
    assert!(!args.contains("--nosmooth"));

    // Uploads are gone once the run is over.
    assert!(!app.upload_dir.join(&run_id).exists());

    let request = Request::builder()
        .uri(format!("/api/runs/{}/result?download=1", run_id))
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(
        headers[header::CONTENT_DISPOSITION],
        "attachment; filename=\"lip_sync_result.mp4\""
    );
    assert_eq!(body, b"lipsynced video");

    let request = Request::builder()
        .uri(format!("/api/runs/{}/result", run_id))
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(header::CONTENT_DISPOSITION).is_none());
}

#[tokio::test]
async fn test_failed_run_reports_stderr() {
    let app = test_app("echo 'CUDA out of memory' >&2\nexit 1\n");

    let (status, accepted) = submit(
        &app.router,
        &[
            ("video", Some("face.mp4"), b"video bytes"),
            ("audio", Some("voice.wav"), b"RIFF audio"),
        ],
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let run_id = accepted["run_id"].as_str().unwrap().to_string();

    let view = wait_until_finished(&app.router, &run_id).await;
    assert_eq!(view["status"], "failed");
    assert_eq!(view["failure"]["kind"], "inference");
    assert_eq!(view["failure"]["diagnostic"], "CUDA out of memory\n");

    let (status, _) = get_json(&app.router, &format!("/api/runs/{}/result", run_id)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_missing_audio_is_rejected() {
    let app = test_app(SUCCESS_SCRIPT);

    let (status, body) = submit(&app.router, &[("video", Some("face.mp4"), b"video bytes")]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["detail"].as_str().unwrap().contains("audio"));

    // Nothing is left behind for a rejected upload.
    let leftovers = std::fs::read_dir(&app.upload_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_cancel_running_inference() {
    let app = test_app("echo started\nexec sleep 30\n");

    let (_, accepted) = submit(
        &app.router,
        &[
            ("video", Some("face.mp4"), b"video bytes"),
            ("audio", Some("voice.wav"), b"RIFF audio"),
        ],
    )
    .await;
    let run_id = accepted["run_id"].as_str().unwrap().to_string();

    // Wait for the program to start before cancelling.
    for _ in 0..200 {
        let (_, view) = get_json(&app.router, &format!("/api/runs/{}", run_id)).await;
        if view["output"].as_array().is_some_and(|lines| !lines.is_empty()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/runs/{}/cancel", run_id))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let view = wait_until_finished(&app.router, &run_id).await;
    assert_eq!(view["status"], "cancelled");

    let request = Request::builder()
        .method("POST")
        .uri(format!("/api/runs/{}/cancel", run_id))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = send(&app.router, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_run_is_not_found() {
    let app = test_app(SUCCESS_SCRIPT);

    let (status, _) = get_json(&app.router, "/api/runs/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_json(&app.router, "/api/runs/does-not-exist/result").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
