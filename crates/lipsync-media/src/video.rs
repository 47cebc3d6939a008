//! Frame-by-frame video preprocessing: downscale, level the face, re-encode.

use async_trait::async_trait;
use lipsync_models::defaults::{DEFAULT_PREPROCESS_CODEC, DEFAULT_TARGET_HEIGHT};
use metrics::{counter, histogram};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::align::{AlignOutcome, AlignerConfig, DetectorFactory, FaceAligner};
use crate::error::{MediaError, MediaResult};
use crate::frame::Frame;
use crate::pipe::{EncoderSettings, FrameReader, FrameWriter};
use crate::probe::probe_video;
use crate::progress::{PercentTracker, ProgressCallback};

/// Quantizer used for the intermediate video; it is decoded again right away.
pub const DEFAULT_PREPROCESS_QUALITY: u8 = 2;

/// Settings for [`VideoProcessor`].
#[derive(Debug, Clone)]
pub struct VideoProcessorConfig {
    /// Frames taller than this are downscaled to exactly this height.
    pub target_height: u32,
    pub codec: String,
    pub quality: u8,
    pub aligner: AlignerConfig,
}

impl Default for VideoProcessorConfig {
    fn default() -> Self {
        Self {
            target_height: DEFAULT_TARGET_HEIGHT,
            codec: DEFAULT_PREPROCESS_CODEC.to_string(),
            quality: DEFAULT_PREPROCESS_QUALITY,
            aligner: AlignerConfig::default(),
        }
    }
}

/// Output size for a source of `width` x `height`.
///
/// Only sources taller than `target_height` shrink; the aspect ratio is kept
/// with the width rounded to the nearest pixel.
pub fn target_dimensions(width: u32, height: u32, target_height: u32) -> (u32, u32) {
    if target_height == 0 || height <= target_height {
        return (width, height);
    }
    let scale = target_height as f64 / height as f64;
    let new_width = (width as f64 * scale).round().max(1.0) as u32;
    (new_width, target_height)
}

/// Per-outcome alignment counts for one video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AlignmentStats {
    pub rotated: u64,
    pub below_threshold: u64,
    pub exceeds_max: u64,
    pub no_face: u64,
    pub degraded: u64,
}

impl AlignmentStats {
    pub fn record(&mut self, outcome: &AlignOutcome) {
        match outcome {
            AlignOutcome::Rotated { .. } => self.rotated += 1,
            AlignOutcome::BelowThreshold { .. } => self.below_threshold += 1,
            AlignOutcome::ExceedsMax { .. } => self.exceeds_max += 1,
            AlignOutcome::NoFace => self.no_face += 1,
            AlignOutcome::Degraded { .. } => self.degraded += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.rotated + self.below_threshold + self.exceeds_max + self.no_face + self.degraded
    }
}

/// A successfully written preprocessed video.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedVideo {
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub frames: u64,
    pub alignment: AlignmentStats,
}

/// The preprocessing step as seen by the pipeline.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Write a preprocessed copy of `input` to `output`.
    ///
    /// `progress` receives monotonic percentages, 100 only once `output` is
    /// complete. Setting `cancel` to `true` aborts with [`MediaError::Cancelled`].
    async fn preprocess(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressCallback<'_>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ProcessedVideo>;
}

/// FFmpeg-backed [`Preprocessor`].
#[derive(Clone)]
pub struct VideoProcessor {
    config: VideoProcessorConfig,
    detector_factory: DetectorFactory,
}

impl VideoProcessor {
    pub fn new(config: VideoProcessorConfig, detector_factory: DetectorFactory) -> Self {
        Self {
            config,
            detector_factory,
        }
    }

    pub fn config(&self) -> &VideoProcessorConfig {
        &self.config
    }

    /// Decode `input`, resize and align every frame, encode to `output`.
    ///
    /// Errors are logged here before they are returned. A partial `output`
    /// is left on disk for the caller to clean up.
    pub async fn process(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressCallback<'_>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ProcessedVideo> {
        let start = Instant::now();
        let result = self.process_frames(input, output, progress, cancel).await;

        match &result {
            Ok(video) => {
                info!(
                    input = %input.display(),
                    output = %video.output.display(),
                    frames = video.frames,
                    rotated = video.alignment.rotated,
                    degraded = video.alignment.degraded,
                    "Preprocessed {}x{} @ {:.3} fps in {:.1}s",
                    video.width,
                    video.height,
                    video.fps,
                    start.elapsed().as_secs_f64()
                );
                counter!("lipsync_preprocess_total", "outcome" => "success").increment(1);
                histogram!("lipsync_preprocess_duration_seconds")
                    .record(start.elapsed().as_secs_f64());
            }
            Err(MediaError::Cancelled) => {
                info!(input = %input.display(), "Preprocessing cancelled");
                counter!("lipsync_preprocess_total", "outcome" => "cancelled").increment(1);
            }
            Err(e) => {
                warn!(input = %input.display(), "Preprocessing failed: {}", e);
                counter!("lipsync_preprocess_total", "outcome" => "failure").increment(1);
            }
        }

        result
    }

    async fn process_frames(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressCallback<'_>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ProcessedVideo> {
        let info = probe_video(input).await?;
        let (width, height) = target_dimensions(info.width, info.height, self.config.target_height);

        debug!(
            "Source {}x{} @ {:.3} fps, ~{} frames; writing {}x{}",
            info.width, info.height, info.fps, info.frame_count, width, height
        );

        let mut reader = FrameReader::open(input, info.width, info.height)?;
        let mut writer = FrameWriter::create(
            output,
            EncoderSettings {
                width,
                height,
                fps: info.fps,
                codec: self.config.codec.clone(),
                quality: self.config.quality,
            },
        )?;

        let mut aligner = Some(FaceAligner::new(
            (self.detector_factory)(width, height),
            self.config.aligner,
        ));
        let mut tracker = PercentTracker::new(info.frame_count);
        let mut stats = AlignmentStats::default();

        if let Some(p) = tracker.advance(0) {
            progress(p);
        }

        while let Some(frame) = reader.next_frame().await? {
            if cancel.as_ref().map_or(false, |rx| *rx.borrow()) {
                return Err(MediaError::Cancelled);
            }

            let current = aligner
                .take()
                .ok_or_else(|| MediaError::internal("face aligner lost between frames"))?;
            let (returned, frame, outcome) =
                tokio::task::spawn_blocking(move || prepare_frame(current, frame, width, height))
                    .await
                    .map_err(|e| MediaError::internal(format!("frame worker panicked: {}", e)))?;
            aligner = Some(returned);

            stats.record(&outcome);
            writer.write_frame(&frame).await?;

            if let Some(p) = tracker.advance(writer.frames_written()) {
                progress(p);
            }
        }

        let decoded = reader.finish().await?;
        let written = writer.finish().await?;

        if written == 0 {
            return Err(MediaError::InvalidVideo(format!(
                "no frames decoded from {}",
                input.display()
            )));
        }
        if decoded != written {
            return Err(MediaError::internal(format!(
                "decoded {} frames but wrote {}",
                decoded, written
            )));
        }

        counter!("lipsync_preprocess_frames_total").increment(written);
        if let Some(p) = tracker.complete() {
            progress(p);
        }

        Ok(ProcessedVideo {
            output: output.to_path_buf(),
            width,
            height,
            fps: info.fps,
            frames: written,
            alignment: stats,
        })
    }
}

/// Resize then align one frame. Runs on the blocking pool.
fn prepare_frame(
    mut aligner: FaceAligner,
    frame: Frame,
    width: u32,
    height: u32,
) -> (FaceAligner, Frame, AlignOutcome) {
    let frame = if frame.dimensions() == (width, height) {
        frame
    } else {
        frame.resized(width, height)
    };
    let (frame, outcome) = aligner.align(frame);
    (aligner, frame, outcome)
}

#[async_trait]
impl Preprocessor for VideoProcessor {
    async fn preprocess(
        &self,
        input: &Path,
        output: &Path,
        progress: ProgressCallback<'_>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ProcessedVideo> {
        self.process(input, output, progress, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_dimensions_downscales_tall_sources() {
        assert_eq!(target_dimensions(1920, 1080, 720), (1280, 720));
        assert_eq!(target_dimensions(1080, 1920, 720), (405, 720));
        assert_eq!(target_dimensions(1000, 999, 720), (721, 720));
    }

    #[test]
    fn test_target_dimensions_keeps_small_sources() {
        assert_eq!(target_dimensions(1280, 720, 720), (1280, 720));
        assert_eq!(target_dimensions(640, 360, 720), (640, 360));
    }

    #[test]
    fn test_alignment_stats_counts_every_outcome() {
        let mut stats = AlignmentStats::default();
        stats.record(&AlignOutcome::Rotated { angle: 10.0 });
        stats.record(&AlignOutcome::Rotated { angle: -20.0 });
        stats.record(&AlignOutcome::NoFace);
        stats.record(&AlignOutcome::Degraded {
            reason: "x".into(),
        });
        assert_eq!(stats.rotated, 2);
        assert_eq!(stats.no_face, 1);
        assert_eq!(stats.degraded, 1);
        assert_eq!(stats.total(), 4);
    }

    #[test]
    fn test_default_config() {
        let config = VideoProcessorConfig::default();
        assert_eq!(config.target_height, 720);
        assert_eq!(config.codec, "mpeg4");
        assert_eq!(config.aligner.max_angle, 60.0);
    }
}
