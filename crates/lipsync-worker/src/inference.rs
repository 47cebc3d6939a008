//! External inference program invocation.

use lipsync_models::RunEvent;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Builder for the inference command line.
///
/// Produces `<program> [script] --checkpoint_path <weights> --face <video>
/// --audio <wav> --pads 0 0 0 0 --resize_factor 1 [--nosmooth]`.
#[derive(Debug, Clone)]
pub struct InferenceCommand {
    program: String,
    script: Option<PathBuf>,
    checkpoint: PathBuf,
    face: PathBuf,
    audio: PathBuf,
    smoothing_disabled: bool,
    working_dir: Option<PathBuf>,
}

impl InferenceCommand {
    pub fn new(
        program: impl Into<String>,
        checkpoint: impl Into<PathBuf>,
        face: impl Into<PathBuf>,
        audio: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            script: None,
            checkpoint: checkpoint.into(),
            face: face.into(),
            audio: audio.into(),
            smoothing_disabled: true,
            working_dir: None,
        }
    }

    /// Script handed to the program as its first argument.
    pub fn script(mut self, script: Option<PathBuf>) -> Self {
        self.script = script;
        self
    }

    /// Add `--nosmooth` when `true`.
    pub fn smoothing_disabled(mut self, disabled: bool) -> Self {
        self.smoothing_disabled = disabled;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Build the argument list, program excluded.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(script) = &self.script {
            args.push(script.to_string_lossy().to_string());
        }

        args.push("--checkpoint_path".to_string());
        args.push(self.checkpoint.to_string_lossy().to_string());
        args.push("--face".to_string());
        args.push(self.face.to_string_lossy().to_string());
        args.push("--audio".to_string());
        args.push(self.audio.to_string_lossy().to_string());
        args.extend(["--pads", "0", "0", "0", "0"].map(String::from));
        args.extend(["--resize_factor", "1"].map(String::from));

        if self.smoothing_disabled {
            args.push("--nosmooth".to_string());
        }

        args
    }

    /// Process with stdout and stderr piped, killed if dropped.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.build_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Line-by-line progress needs an unbuffered interpreter.
            .env("PYTHONUNBUFFERED", "1");

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        // The script's own modules (face_detection, models) sit next to it.
        if let Some(script_dir) = self.script.as_deref().and_then(Path::parent) {
            if !script_dir.as_os_str().is_empty() {
                command.env("PYTHONPATH", script_dir);
            }
        }

        command
    }
}

/// Forward each line of `reader` as a [`RunEvent::InferenceOutput`], in order.
///
/// Resolves to the number of lines read once the stream closes.
pub fn forward_lines<R>(
    reader: R,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    run_id: String,
) -> JoinHandle<u64>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut count = 0u64;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
                    count += 1;
                    debug!(run_id = %run_id, "inference: {}", line);
                    if let Some(tx) = &events {
                        let _ = tx.send(RunEvent::output(line));
                    }
                }
                Err(e) => {
                    debug!(run_id = %run_id, "Stopped reading inference output: {}", e);
                    break;
                }
            }
        }

        count
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_args() {
        let cmd = InferenceCommand::new(
            "python",
            "/ckpt/wav2lip.pth",
            "/run/processed_input.mp4",
            "/run/audio.wav",
        )
        .script(Some(PathBuf::from("/opt/wav2lip/inference.py")));

        assert_eq!(
            cmd.build_args(),
            vec![
                "/opt/wav2lip/inference.py",
                "--checkpoint_path",
                "/ckpt/wav2lip.pth",
                "--face",
                "/run/processed_input.mp4",
                "--audio",
                "/run/audio.wav",
                "--pads",
                "0",
                "0",
                "0",
                "0",
                "--resize_factor",
                "1",
                "--nosmooth",
            ]
        );
    }

    #[test]
    fn test_smoothing_enabled_omits_flag() {
        let cmd = InferenceCommand::new("infer", "w.pth", "f.mp4", "a.wav").smoothing_disabled(false);
        let args = cmd.build_args();
        assert!(!args.contains(&"--nosmooth".to_string()));
        assert_eq!(args[0], "--checkpoint_path");
    }

    #[tokio::test]
    async fn test_forward_lines_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input: &[u8] = b"Using cuda for inference.\r\nLoad checkpoint\nModel loaded";
        let count = forward_lines(input, Some(tx), "run-1".to_string())
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(rx.recv().await, Some(RunEvent::output("Using cuda for inference.")));
        assert_eq!(rx.recv().await, Some(RunEvent::output("Load checkpoint")));
        assert_eq!(rx.recv().await, Some(RunEvent::output("Model loaded")));
        assert_eq!(rx.recv().await, None);
    }
}
