//! FFmpeg command builder and runner.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{MediaError, MediaResult};

/// FFmpeg URL for reading from the child's standard input.
pub const STDIN_PIPE: &str = "pipe:0";
/// FFmpeg URL for writing to the child's standard output.
pub const STDOUT_PIPE: &str = "pipe:1";

/// Upper bound on stderr kept for diagnostics of FFmpeg failures.
const MAX_FFMPEG_STDERR_BYTES: usize = 16 * 1024;

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    /// Input file path (or pipe URL)
    input: PathBuf,
    /// Output file path (or pipe URL)
    output: PathBuf,
    /// Input arguments (before -i)
    input_args: Vec<String>,
    /// Output arguments (after -i)
    output_args: Vec<String>,
    /// Whether to overwrite output
    overwrite: bool,
    /// Log level
    log_level: &'static str,
}

impl FfmpegCommand {
    /// Create a new FFmpeg command.
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error",
        }
    }

    /// Add input arguments (before -i).
    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    /// Add multiple input arguments.
    pub fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add output arguments (after -i).
    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// Add multiple output arguments.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Read packed RGB24 frames of the given size and rate from the input.
    pub fn raw_rgb_input(self, width: u32, height: u32, fps: f64) -> Self {
        self.input_args([
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgb24".to_string(),
            "-s".to_string(),
            format!("{}x{}", width, height),
            "-r".to_string(),
            format_rate(fps),
        ])
    }

    /// Emit packed RGB24 frames on the output, dropping audio and subtitles.
    pub fn raw_rgb_output(self) -> Self {
        self.output_args(["-an", "-sn", "-f", "rawvideo", "-pix_fmt", "rgb24"])
    }

    /// Set video codec.
    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    /// Set audio codec.
    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    /// Set constant quantizer quality (`-q:v`, lower is better).
    pub fn quality(self, q: u8) -> Self {
        self.output_arg("-q:v").output_arg(q.to_string())
    }

    /// Drop the video stream from the output.
    pub fn no_video(self) -> Self {
        self.output_arg("-vn")
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }

        args.push("-hide_banner".to_string());
        args.push("-nostdin".to_string());
        args.push("-v".to_string());
        args.push(self.log_level.to_string());

        args.extend(self.input_args.clone());

        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());

        args.extend(self.output_args.clone());

        args.push(self.output.to_string_lossy().to_string());

        args
    }

    /// Build a process for this command. Standard streams are left for the caller to set.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new("ffmpeg");
        command.args(self.build_args()).kill_on_drop(true);
        command
    }

    /// Whether the command reads frames from standard input.
    fn reads_stdin(&self) -> bool {
        self.input.as_os_str() == STDIN_PIPE
    }
}

/// Runner for one-shot FFmpeg commands with cancellation.
pub struct FfmpegRunner {
    /// Cancellation signal receiver
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRunner {
    /// Create a new runner.
    pub fn new() -> Self {
        Self { cancel_rx: None }
    }

    /// Set cancellation signal.
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    /// Run an FFmpeg command to completion.
    pub async fn run(&self, cmd: &FfmpegCommand) -> MediaResult<()> {
        check_ffmpeg()?;

        if cmd.reads_stdin() {
            return Err(MediaError::internal(
                "FfmpegRunner cannot feed stdin; use a frame pipe instead",
            ));
        }

        debug!("Running FFmpeg: ffmpeg {}", cmd.build_args().join(" "));

        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("FFmpeg stderr not captured"))?;
        let stderr_task = collect_output(stderr, Some(MAX_FFMPEG_STDERR_BYTES));

        let result = wait_for_exit(&mut child, self.cancel_rx.clone(), None).await;

        let stderr = stderr_task.await.unwrap_or_default();

        let status = result?;
        if status.success() {
            Ok(())
        } else {
            Err(MediaError::ffmpeg_failed(
                "FFmpeg exited with non-zero status",
                non_empty(stderr),
                status.code(),
            ))
        }
    }
}

/// Wait for a child process, killing it on cancellation or timeout.
///
/// A dropped cancellation sender never cancels.
pub async fn wait_for_exit(
    child: &mut Child,
    cancel_rx: Option<watch::Receiver<bool>>,
    timeout: Option<Duration>,
) -> MediaResult<ExitStatus> {
    let cancelled = async move {
        match cancel_rx {
            Some(mut rx) => wait_for_cancel(&mut rx).await,
            None => std::future::pending::<()>().await,
        }
    };
    let timed_out = async move {
        match timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        status = child.wait() => Ok(status?),
        _ = cancelled => {
            info!("Child process cancelled, killing it");
            if let Err(e) = child.kill().await {
                warn!("Failed to kill cancelled child process: {}", e);
            }
            Err(MediaError::Cancelled)
        }
        _ = timed_out => {
            let secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
            warn!("Child process timed out after {} seconds, killing it", secs);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out child process: {}", e);
            }
            Err(MediaError::Timeout(secs))
        }
    }
}

/// Resolve once the flag is set to `true`.
async fn wait_for_cancel(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drain a child stream in the background, keeping at most `limit` trailing bytes.
pub fn collect_output<R>(mut reader: R, limit: Option<usize>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(limit) = limit {
                        if buf.len() > limit {
                            buf.drain(..buf.len() - limit);
                        }
                    }
                }
                Err(e) => {
                    debug!("Stopped reading child output: {}", e);
                    break;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

pub(crate) fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Format a frame rate for `-r`, without trailing zeros.
fn format_rate(fps: f64) -> String {
    let s = format!("{:.6}", fps);
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}
