//! OpenCV YuNet eye landmarks.
//!
//! YuNet is exposed through OpenCV's `FaceDetectorYN`. Each output row is
//! `[x, y, w, h, x_re, y_re, x_le, y_le, x_n, y_n, x_mr, y_mr, x_ml, y_ml, score]`
//! where "right" and "left" are the subject's, so the subject's right eye is
//! the one on the left of the image.
//!
//! # Requirements
//! - OpenCV 4.5+ with the DNN module (2023mar models need 4.8+)

use opencv::core::{Mat, Ptr, Scalar, Size, CV_8UC3};
use opencv::imgproc;
use opencv::objdetect::FaceDetectorYN;
use opencv::prelude::{FaceDetectorYNTrait, MatTrait, MatTraitConst};
use std::path::Path;
use tracing::{debug, info, warn};

use super::landmarks::{EyeLandmarks, LandmarkDetector};
use crate::error::{MediaError, MediaResult};
use crate::frame::Frame;

/// Candidates below this confidence are ignored.
const SCORE_THRESHOLD: f32 = 0.6;

const NMS_THRESHOLD: f32 = 0.3;

const TOP_K: i32 = 10;

/// Smallest plausible size of a real YuNet ONNX file.
const MIN_MODEL_BYTES: u64 = 50_000;

/// Eye landmark detector backed by YuNet.
pub struct YuNetDetector {
    detector: Ptr<FaceDetectorYN>,
    input_size: (i32, i32),
    frame_size: (u32, u32),
}

impl YuNetDetector {
    /// Load `model_path` for frames of `frame_width` x `frame_height`.
    pub fn new(model_path: &Path, frame_width: u32, frame_height: u32) -> MediaResult<Self> {
        let metadata = std::fs::metadata(model_path).map_err(|e| {
            MediaError::model_not_found(format!(
                "cannot read YuNet model {}: {}",
                model_path.display(),
                e
            ))
        })?;
        if metadata.len() < MIN_MODEL_BYTES {
            return Err(MediaError::detection_failed(format!(
                "YuNet model {} looks truncated ({} bytes)",
                model_path.display(),
                metadata.len()
            )));
        }

        let model = model_path.to_string_lossy();
        let (input_width, input_height) = calculate_input_size(frame_width, frame_height);
        let detector = create_detector_with_fallback(&model, input_width, input_height)?;

        info!(
            "YuNet detector initialized: frame={}x{}, input={}x{}, model={}",
            frame_width, frame_height, input_width, input_height, model
        );

        Ok(Self {
            detector,
            input_size: (input_width, input_height),
            frame_size: (frame_width, frame_height),
        })
    }

    fn to_bgr_mat(frame: &Frame) -> MediaResult<Mat> {
        let rows = frame.height() as i32;
        let cols = frame.width() as i32;
        let mut rgb = Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0))
            .map_err(|e| MediaError::detection_failed(format!("Mat allocation failed: {}", e)))?;
        rgb.data_bytes_mut()
            .map_err(|e| MediaError::detection_failed(format!("Mat is not continuous: {}", e)))?
            .copy_from_slice(frame.as_raw());

        let mut bgr = Mat::default();
        imgproc::cvt_color_def(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR)
            .map_err(|e| MediaError::detection_failed(format!("RGB to BGR failed: {}", e)))?;
        Ok(bgr)
    }

    /// Eyes of the highest-scoring face, in frame pixel coordinates.
    fn best_face(&self, faces: &Mat) -> MediaResult<Option<EyeLandmarks>> {
        if faces.rows() <= 0 {
            return Ok(None);
        }
        if faces.cols() < 15 {
            return Err(MediaError::detection_failed(format!(
                "YuNet output has {} columns, expected 15",
                faces.cols()
            )));
        }

        let scale_x = self.frame_size.0 as f64 / self.input_size.0 as f64;
        let scale_y = self.frame_size.1 as f64 / self.input_size.1 as f64;
        let at = |row: i32, col: i32| -> MediaResult<f64> {
            faces
                .at_2d::<f32>(row, col)
                .map(|v| *v as f64)
                .map_err(|e| MediaError::detection_failed(format!("YuNet output read failed: {}", e)))
        };

        let mut best: Option<(f64, EyeLandmarks)> = None;
        for row in 0..faces.rows() {
            let score = at(row, 14)?;
            if score < SCORE_THRESHOLD as f64 {
                continue;
            }
            if best.as_ref().map_or(false, |(s, _)| *s >= score) {
                continue;
            }

            let subject_right = (at(row, 4)? * scale_x, at(row, 5)? * scale_y);
            let subject_left = (at(row, 6)? * scale_x, at(row, 7)? * scale_y);
            best = Some((score, EyeLandmarks::new(subject_right, subject_left)));
        }

        Ok(best.map(|(score, eyes)| {
            debug!("YuNet face score {:.3}: {:?}", score, eyes);
            eyes
        }))
    }
}

impl LandmarkDetector for YuNetDetector {
    fn detect_eyes(&mut self, frame: &Frame) -> MediaResult<Option<EyeLandmarks>> {
        if frame.dimensions() != self.frame_size {
            return Err(MediaError::FrameSizeMismatch {
                expected_width: self.frame_size.0,
                expected_height: self.frame_size.1,
                actual_width: frame.width(),
                actual_height: frame.height(),
            });
        }

        let bgr = Self::to_bgr_mat(frame)?;
        let input = Size::new(self.input_size.0, self.input_size.1);

        let mut resized = Mat::default();
        imgproc::resize(&bgr, &mut resized, input, 0.0, 0.0, imgproc::INTER_LINEAR)
            .map_err(|e| MediaError::detection_failed(format!("resize for YuNet failed: {}", e)))?;

        if let Err(e) = self.detector.set_input_size(input) {
            debug!("Failed to set YuNet input size (may be OK): {}", e);
        }

        let mut faces = Mat::default();
        self.detector
            .detect(&resized, &mut faces)
            .map_err(|e| MediaError::detection_failed(format!("YuNet detection failed: {}", e)))?;

        self.best_face(&faces)
    }

    fn name(&self) -> &'static str {
        "yunet"
    }
}

/// Network input size: at most 960x540, multiples of 32.
fn calculate_input_size(frame_width: u32, frame_height: u32) -> (i32, i32) {
    const ALIGNMENT: i32 = 32;
    let scale = (frame_width as f64 / 960.0)
        .max(frame_height as f64 / 540.0)
        .max(1.0);

    let width = (frame_width as f64 / scale).round() as i32;
    let height = (frame_height as f64 / scale).round() as i32;
    let width = ((width + ALIGNMENT / 2) / ALIGNMENT) * ALIGNMENT;
    let height = ((height + ALIGNMENT / 2) / ALIGNMENT) * ALIGNMENT;

    (width.clamp(160, 960), height.clamp(120, 540))
}

fn create_detector_with_fallback(
    model_path: &str,
    input_width: i32,
    input_height: i32,
) -> MediaResult<Ptr<FaceDetectorYN>> {
    use opencv::dnn::{DNN_BACKEND_DEFAULT, DNN_BACKEND_OPENCV, DNN_TARGET_CPU};

    let backends = [
        (DNN_BACKEND_DEFAULT, DNN_TARGET_CPU, "default"),
        (DNN_BACKEND_OPENCV, DNN_TARGET_CPU, "opencv"),
    ];

    let mut last_error = String::new();
    for (backend_id, target_id, backend_name) in backends {
        match FaceDetectorYN::create(
            model_path,
            "",
            Size::new(input_width, input_height),
            SCORE_THRESHOLD,
            NMS_THRESHOLD,
            TOP_K,
            backend_id,
            target_id,
        ) {
            Ok(detector) => {
                debug!("YuNet created with {} backend", backend_name);
                return Ok(detector);
            }
            Err(e) => {
                warn!("YuNet {} backend failed: {}", backend_name, e);
                last_error = e.to_string();
            }
        }
    }

    Err(MediaError::detection_failed(format!(
        "failed to create YuNet detector with any backend: {}",
        last_error
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_input_size() {
        assert_eq!(calculate_input_size(1920, 1080), (960, 540));
        assert_eq!(calculate_input_size(640, 480), (640, 480));
        assert_eq!(calculate_input_size(100, 100), (160, 120));
    }

    #[test]
    fn test_missing_model_is_reported() {
        let err = YuNetDetector::new(Path::new("/nonexistent/yunet.onnx"), 640, 480)
            .err()
            .unwrap();
        assert!(matches!(err, MediaError::ModelNotFound(_)));
    }
}
