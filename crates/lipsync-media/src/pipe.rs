//! Raw RGB24 frame pipes through FFmpeg child processes.
//!
//! A [`FrameReader`] decodes any container FFmpeg understands into packed
//! frames on the child's stdout; a [`FrameWriter`] feeds packed frames into
//! an encoder child on its stdin. Both keep the child's stderr so a failure
//! carries FFmpeg's own diagnostics.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::command::{check_ffmpeg, collect_output, non_empty, FfmpegCommand, STDIN_PIPE, STDOUT_PIPE};
use crate::error::{MediaError, MediaResult};
use crate::frame::{frame_len, Frame};

const MAX_PIPE_STDERR_BYTES: usize = 16 * 1024;

/// Sequential frame decoder.
pub struct FrameReader {
    child: Child,
    stdout: BufReader<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    frames_read: u64,
    source: PathBuf,
}

impl FrameReader {
    /// Start decoding `path`, whose video stream is `width` x `height`.
    pub fn open(path: impl AsRef<Path>, width: u32, height: u32) -> MediaResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(MediaError::FileNotFound(path.to_path_buf()));
        }
        check_ffmpeg()?;

        // Frames must keep the stored orientation ffprobe reports.
        let cmd = FfmpegCommand::new(path, STDOUT_PIPE)
            .input_arg("-noautorotate")
            .raw_rgb_output();
        debug!("Decoding frames: ffmpeg {}", cmd.build_args().join(" "));

        let mut child = cmd
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("decoder stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .map(|s| collect_output(s, Some(MAX_PIPE_STDERR_BYTES)));

        Ok(Self {
            child,
            stdout: BufReader::new(stdout),
            stderr,
            width,
            height,
            frames_read: 0,
            source: path.to_path_buf(),
        })
    }

    /// Read the next frame, or `None` at end of stream.
    pub async fn next_frame(&mut self) -> MediaResult<Option<Frame>> {
        let mut buf = vec![0u8; frame_len(self.width, self.height)];
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.stdout.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        if filled < buf.len() {
            return Err(MediaError::InvalidVideo(format!(
                "truncated frame {} from {} ({} of {} bytes)",
                self.frames_read,
                self.source.display(),
                filled,
                buf.len()
            )));
        }

        self.frames_read += 1;
        Frame::from_raw(self.width, self.height, buf).map(Some)
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Wait for the decoder to exit and surface its failure, if any.
    pub async fn finish(mut self) -> MediaResult<u64> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if status.success() {
            Ok(self.frames_read)
        } else {
            Err(MediaError::ffmpeg_failed(
                format!("decoding {} failed", self.source.display()),
                non_empty(stderr),
                status.code(),
            ))
        }
    }
}

/// Settings for the encoder side of the pipe.
#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    /// Constant quantizer (`-q:v`)
    pub quality: u8,
}

/// Sequential frame encoder.
pub struct FrameWriter {
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
    settings: EncoderSettings,
    frames_written: u64,
    output: PathBuf,
}

impl FrameWriter {
    /// Start an encoder writing to `output`.
    pub fn create(output: impl AsRef<Path>, settings: EncoderSettings) -> MediaResult<Self> {
        let output = output.as_ref();
        check_ffmpeg()?;

        if let Some(parent) = output.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let cmd = FfmpegCommand::new(STDIN_PIPE, output)
            .raw_rgb_input(settings.width, settings.height, settings.fps)
            .video_codec(settings.codec.clone())
            .quality(settings.quality)
            .output_args(["-pix_fmt", "yuv420p"]);
        debug!("Encoding frames: ffmpeg {}", cmd.build_args().join(" "));

        let mut child = cmd
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let stderr = child
            .stderr
            .take()
            .map(|s| collect_output(s, Some(MAX_PIPE_STDERR_BYTES)));

        Ok(Self {
            child,
            stdin,
            stderr,
            settings,
            frames_written: 0,
            output: output.to_path_buf(),
        })
    }

    /// Append one frame. The frame must match the configured size.
    pub async fn write_frame(&mut self, frame: &Frame) -> MediaResult<()> {
        if frame.dimensions() != (self.settings.width, self.settings.height) {
            return Err(MediaError::FrameSizeMismatch {
                expected_width: self.settings.width,
                expected_height: self.settings.height,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MediaError::internal("encoder stdin already closed"))?;

        if let Err(e) = stdin.write_all(frame.as_raw()).await {
            // A broken pipe means the encoder died; its stderr says why.
            let status = self.child.wait().await.ok().and_then(|s| s.code());
            let stderr = self.take_stderr().await;
            return Err(MediaError::ffmpeg_failed(
                format!("encoder stopped accepting frames: {}", e),
                non_empty(stderr),
                status,
            ));
        }

        self.frames_written += 1;
        Ok(())
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Close the input and wait for the encoder to finalize the file.
    pub async fn finish(mut self) -> MediaResult<u64> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await.ok();
        }

        let status = self.child.wait().await?;
        let stderr = self.take_stderr().await;

        if status.success() {
            Ok(self.frames_written)
        } else {
            Err(MediaError::ffmpeg_failed(
                format!("encoding {} failed", self.output.display()),
                non_empty(stderr),
                status.code(),
            ))
        }
    }

    async fn take_stderr(&mut self) -> String {
        match self.stderr.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        }
    }
}
