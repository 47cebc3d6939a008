//! End-to-end preprocessing through real FFmpeg children.
//!
//! Skipped when `ffmpeg` or `ffprobe` is not on PATH.

use image::{Rgb, RgbImage};
use lipsync_media::align::{DetectorFactory, EyeLandmarks, LandmarkDetector};
use lipsync_media::pipe::{EncoderSettings, FrameReader, FrameWriter};
use lipsync_media::{
    check_ffmpeg, check_ffprobe, probe_video, Frame, MediaError, MediaResult, VideoProcessor,
    VideoProcessorConfig,
};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::watch;

struct FixedTilt(f64);

impl LandmarkDetector for FixedTilt {
    fn detect_eyes(&mut self, frame: &Frame) -> MediaResult<Option<EyeLandmarks>> {
        let (s, c) = self.0.to_radians().sin_cos();
        let cx = frame.width() as f64 / 2.0;
        let cy = frame.height() as f64 / 2.0;
        Ok(Some(EyeLandmarks::new(
            (cx - 40.0 * c, cy - 40.0 * s),
            (cx + 40.0 * c, cy + 40.0 * s),
        )))
    }

    fn name(&self) -> &'static str {
        "fixed"
    }
}

fn fixed_tilt(angle: f64) -> DetectorFactory {
    Arc::new(move |_width: u32, _height: u32| -> Box<dyn LandmarkDetector> {
        Box::new(FixedTilt(angle))
    })
}

fn ffmpeg_available() -> bool {
    if check_ffmpeg().is_err() || check_ffprobe().is_err() {
        eprintln!("ffmpeg/ffprobe not found, skipping");
        return false;
    }
    true
}

/// Black frame with a white disc `offset` px from the centre along `angle`.
fn disc_frame(width: u32, height: u32, offset: f64, angle: f64, radius: f64) -> Frame {
    let (s, c) = angle.to_radians().sin_cos();
    let cx = (width as f64 - 1.0) / 2.0 + offset * c;
    let cy = (height as f64 - 1.0) / 2.0 + offset * s;
    let image = RgbImage::from_fn(width, height, |x, y| {
        let d = ((x as f64 - cx).powi(2) + (y as f64 - cy).powi(2)).sqrt();
        if d <= radius {
            Rgb([255, 255, 255])
        } else {
            Rgb([0, 0, 0])
        }
    });
    Frame::from_image(image)
}

async fn write_source(path: &Path, frame: &Frame, count: usize) {
    let mut writer = FrameWriter::create(
        path,
        EncoderSettings {
            width: frame.width(),
            height: frame.height(),
            fps: 25.0,
            codec: "mpeg4".to_string(),
            quality: 2,
        },
    )
    .unwrap();
    for _ in 0..count {
        writer.write_frame(frame).await.unwrap();
    }
    assert_eq!(writer.finish().await.unwrap(), count as u64);
}

fn bright_centroid(frame: &Frame) -> (f64, f64) {
    let (mut sx, mut sy, mut n) = (0.0, 0.0, 0.0);
    for (x, y, p) in frame.image().enumerate_pixels() {
        if p.0.iter().map(|c| *c as u32).sum::<u32>() > 600 {
            sx += x as f64;
            sy += y as f64;
            n += 1.0;
        }
    }
    assert!(n > 0.0, "no bright pixels");
    (sx / n, sy / n)
}

#[tokio::test]
async fn test_tilted_1080p_is_downscaled_and_leveled() {
    if !ffmpeg_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.mp4");
    let output = dir.path().join("preprocessed").join("face.mp4");
    write_source(&source, &disc_frame(1920, 1080, 400.0, 30.0, 30.0), 10).await;

    let processor = VideoProcessor::new(VideoProcessorConfig::default(), fixed_tilt(30.0));
    let seen = Mutex::new(Vec::new());
    let progress = |p: u8| seen.lock().unwrap().push(p);

    let result = processor
        .process(&source, &output, &progress, None)
        .await
        .unwrap();

    assert_eq!((result.width, result.height), (1280, 720));
    assert_eq!(result.frames, 10);
    assert_eq!(result.alignment.rotated, 10);

    let info = probe_video(&output).await.unwrap();
    assert_eq!((info.width, info.height), (1280, 720));
    assert!((info.fps - 25.0).abs() < 0.01);

    let mut reader = FrameReader::open(&output, 1280, 720).unwrap();
    let mut frames = 0;
    while let Some(frame) = reader.next_frame().await.unwrap() {
        // Disc was 30 degrees below the horizontal; after leveling it sits on it.
        let (x, y) = bright_centroid(&frame);
        assert!((x - (639.5 + 400.0 * 2.0 / 3.0)).abs() < 6.0, "x = {}", x);
        assert!((y - 359.5).abs() < 6.0, "y = {}", y);
        frames += 1;
    }
    assert_eq!(reader.finish().await.unwrap(), 10);
    assert_eq!(frames, 10);

    let seen = seen.into_inner().unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{:?}", seen);
    assert_eq!(seen.last(), Some(&100));
    assert_eq!(seen.iter().filter(|p| **p == 100).count(), 1);
}

#[tokio::test]
async fn test_small_source_keeps_dimensions_and_frames() {
    if !ffmpeg_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("small.mp4");
    let output = dir.path().join("small_out.mp4");
    let frame = disc_frame(640, 360, 100.0, 2.0, 20.0);
    write_source(&source, &frame, 7).await;

    let processor = VideoProcessor::new(VideoProcessorConfig::default(), fixed_tilt(2.0));
    let result = processor
        .process(&source, &output, &|_: u8| {}, None)
        .await
        .unwrap();

    assert_eq!((result.width, result.height), (640, 360));
    assert_eq!(result.frames, 7);
    assert_eq!(result.alignment.below_threshold, 7);
    assert_eq!(result.alignment.rotated, 0);
}

#[tokio::test]
async fn test_unreadable_source_fails() {
    if !ffmpeg_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("garbage.mp4");
    tokio::fs::write(&source, b"definitely not a video").await.unwrap();

    let processor = VideoProcessor::new(VideoProcessorConfig::default(), fixed_tilt(0.0));
    let result = processor
        .process(&source, &dir.path().join("out.mp4"), &|_: u8| {}, None)
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_cancelled_before_first_frame() {
    if !ffmpeg_available() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let source = dir.path().join("source.mp4");
    write_source(&source, &disc_frame(320, 240, 50.0, 20.0, 10.0), 5).await;

    let (_tx, rx) = watch::channel(true);
    let processor = VideoProcessor::new(VideoProcessorConfig::default(), fixed_tilt(20.0));
    let result = processor
        .process(&source, &dir.path().join("out.mp4"), &|_: u8| {}, Some(rx))
        .await;
    assert!(matches!(result, Err(MediaError::Cancelled)));
}
