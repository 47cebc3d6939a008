//! Eye landmark detection seam.

use std::sync::Arc;

use crate::error::{MediaError, MediaResult};
use crate::frame::Frame;

/// Centres of both eyes of one face, in frame pixel coordinates.
///
/// Naming follows the subject: `right_eye` is usually on the image's left.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeLandmarks {
    pub right_eye: (f64, f64),
    pub left_eye: (f64, f64),
}

impl EyeLandmarks {
    pub fn new(right_eye: (f64, f64), left_eye: (f64, f64)) -> Self {
        Self {
            right_eye,
            left_eye,
        }
    }

    /// Tilt of the eye line from horizontal, in degrees.
    ///
    /// Measured from the eye nearer the image's left edge to the other one,
    /// in image coordinates, so a positive value means the face leans
    /// clockwise as displayed. The result lies in (-90, 90].
    pub fn tilt_degrees(&self) -> f64 {
        let (a, b) = if self.right_eye.0 <= self.left_eye.0 {
            (self.right_eye, self.left_eye)
        } else {
            (self.left_eye, self.right_eye)
        };
        (b.1 - a.1).atan2(b.0 - a.0).to_degrees()
    }
}

/// A face landmark model configured for a single face.
#[cfg_attr(test, mockall::automock)]
pub trait LandmarkDetector: Send {
    /// Eyes of the most confident face, `Ok(None)` when no face is found.
    fn detect_eyes(&mut self, frame: &Frame) -> MediaResult<Option<EyeLandmarks>>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Builds a detector for frames of the given width and height.
pub type DetectorFactory = Arc<dyn Fn(u32, u32) -> Box<dyn LandmarkDetector> + Send + Sync>;

/// Detector used when no backend is available; every call fails.
#[derive(Debug, Clone)]
pub struct NoopDetector {
    reason: String,
}

impl NoopDetector {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl LandmarkDetector for NoopDetector {
    fn detect_eyes(&mut self, _frame: &Frame) -> MediaResult<Option<EyeLandmarks>> {
        Err(MediaError::detection_failed(self.reason.clone()))
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
