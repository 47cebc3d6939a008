//! Audio normalisation for the inference step, which only reads WAV.

use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::info;

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};

/// File name of the converted track inside the scratch directory.
pub const NORMALIZED_AUDIO_NAME: &str = "audio.wav";

/// Whether `path` already has a WAV extension.
pub fn is_wav(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("wav"))
}

/// Return a WAV version of `input`.
///
/// WAV input is returned as is. Anything else is re-encoded to 16-bit PCM
/// at `scratch_dir/audio.wav`.
pub async fn normalize_audio(
    input: &Path,
    scratch_dir: &Path,
    cancel: Option<watch::Receiver<bool>>,
) -> MediaResult<PathBuf> {
    if !input.exists() {
        return Err(MediaError::FileNotFound(input.to_path_buf()));
    }
    if is_wav(input) {
        return Ok(input.to_path_buf());
    }

    tokio::fs::create_dir_all(scratch_dir).await?;
    let output = scratch_dir.join(NORMALIZED_AUDIO_NAME);

    let cmd = FfmpegCommand::new(input, &output)
        .no_video()
        .audio_codec("pcm_s16le");

    let mut runner = FfmpegRunner::new();
    if let Some(rx) = cancel {
        runner = runner.with_cancel(rx);
    }
    runner.run(&cmd).await?;

    info!(
        input = %input.display(),
        output = %output.display(),
        "Converted audio to WAV"
    );
    Ok(output)
}
