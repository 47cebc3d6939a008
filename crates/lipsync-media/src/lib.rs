#![deny(unreachable_patterns)]
//! FFmpeg-backed video preprocessing for lip-sync inference.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building with cancellation
//! - Raw RGB frame pipes in and out of FFmpeg
//! - Face tilt estimation and correction ([`FaceAligner`])
//! - The preprocessing pass ([`VideoProcessor`])
//! - Audio normalisation and filesystem helpers for run artifacts

pub mod align;
pub mod audio;
pub mod command;
pub mod error;
pub mod frame;
pub mod fs_utils;
pub mod pipe;
pub mod probe;
pub mod progress;
pub mod video;

pub use align::{
    default_detector_factory, AlignOutcome, AlignerConfig, AngleEstimate, DetectorFactory,
    EyeLandmarks, FaceAligner, LandmarkDetector, NoopDetector,
};
pub use audio::normalize_audio;
pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use frame::Frame;
pub use fs_utils::{ensure_non_empty_file, move_file, remove_dir_best_effort, CleanupOutcome};
pub use probe::{probe_video, VideoInfo};
pub use progress::{PercentTracker, ProgressCallback};
pub use video::{
    target_dimensions, AlignmentStats, Preprocessor, ProcessedVideo, VideoProcessor,
    VideoProcessorConfig,
};
