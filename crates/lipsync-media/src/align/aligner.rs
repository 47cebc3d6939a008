//! Tilt correction policy.

use lipsync_models::defaults::{ALIGN_DEAD_ZONE_DEGREES, DEFAULT_MAX_ALIGN_ANGLE};
use metrics::counter;
use tracing::{debug, warn};

use super::landmarks::LandmarkDetector;
use crate::frame::Frame;

/// Slack for threshold comparisons; eye geometry round-trips through `atan2`.
const ANGLE_EPSILON: f64 = 1e-9;

/// Thresholds for tilt correction, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignerConfig {
    /// Larger tilts are assumed to be detector noise or a non-frontal face.
    pub max_angle: f64,
    /// Tilts up to this magnitude are left alone.
    pub dead_zone: f64,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            max_angle: DEFAULT_MAX_ALIGN_ANGLE,
            dead_zone: ALIGN_DEAD_ZONE_DEGREES,
        }
    }
}

impl AlignerConfig {
    pub fn with_max_angle(mut self, max_angle: f64) -> Self {
        self.max_angle = max_angle;
        self
    }
}

/// Result of measuring one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AngleEstimate {
    /// Eye-line tilt in degrees
    Detected(f64),
    /// The detector ran and found no face
    NoFace,
    /// The detector failed; the message says why
    Failed(String),
}

impl AngleEstimate {
    pub fn degrees(&self) -> Option<f64> {
        match self {
            Self::Detected(angle) => Some(*angle),
            _ => None,
        }
    }
}

/// What the aligner did to a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum AlignOutcome {
    /// Rotated by `-angle` about the centre
    Rotated { angle: f64 },
    /// Tilt inside the dead zone, frame unchanged
    BelowThreshold { angle: f64 },
    /// Tilt beyond the maximum, frame unchanged
    ExceedsMax { angle: f64 },
    /// No face, frame unchanged
    NoFace,
    /// Detection failed, frame unchanged
    Degraded { reason: String },
}

impl AlignOutcome {
    /// Rotation applied to the frame, if any.
    pub fn correction(&self) -> Option<f64> {
        match self {
            Self::Rotated { angle } => Some(-angle),
            _ => None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Rotated { .. } => "rotated",
            Self::BelowThreshold { .. } => "below_threshold",
            Self::ExceedsMax { .. } => "exceeds_max",
            Self::NoFace => "no_face",
            Self::Degraded { .. } => "degraded",
        }
    }
}

/// Corrects in-plane face tilt one frame at a time.
pub struct FaceAligner {
    detector: Box<dyn LandmarkDetector>,
    config: AlignerConfig,
    degraded_reported: bool,
}

impl FaceAligner {
    pub fn new(detector: Box<dyn LandmarkDetector>, config: AlignerConfig) -> Self {
        Self {
            detector,
            config,
            degraded_reported: false,
        }
    }

    pub fn config(&self) -> &AlignerConfig {
        &self.config
    }

    /// Measure the eye-line tilt of the most prominent face. Never fails.
    pub fn estimate_angle(&mut self, frame: &Frame) -> AngleEstimate {
        match self.detector.detect_eyes(frame) {
            Ok(Some(eyes)) => {
                let angle = eyes.tilt_degrees();
                if angle.is_finite() {
                    AngleEstimate::Detected(angle)
                } else {
                    AngleEstimate::Failed(format!("non-finite tilt from {:?}", eyes))
                }
            }
            Ok(None) => AngleEstimate::NoFace,
            Err(e) => AngleEstimate::Failed(e.to_string()),
        }
    }

    /// Apply the correction policy to a measurement.
    pub fn decide(&self, estimate: AngleEstimate) -> AlignOutcome {
        match estimate {
            AngleEstimate::Detected(angle) if angle.abs() > self.config.max_angle + ANGLE_EPSILON => {
                AlignOutcome::ExceedsMax { angle }
            }
            AngleEstimate::Detected(angle) if angle.abs() <= self.config.dead_zone + ANGLE_EPSILON => {
                AlignOutcome::BelowThreshold { angle }
            }
            AngleEstimate::Detected(angle) => AlignOutcome::Rotated { angle },
            AngleEstimate::NoFace => AlignOutcome::NoFace,
            AngleEstimate::Failed(reason) => AlignOutcome::Degraded { reason },
        }
    }

    /// Level the face in `frame` if its tilt is worth correcting.
    ///
    /// Unless the outcome is [`AlignOutcome::Rotated`] the returned frame is
    /// the input, untouched.
    pub fn align(&mut self, frame: Frame) -> (Frame, AlignOutcome) {
        let estimate = self.estimate_angle(&frame);
        let outcome = self.decide(estimate);

        counter!("lipsync_align_outcomes_total", "outcome" => outcome.label()).increment(1);

        match &outcome {
            AlignOutcome::Rotated { angle } => {
                let aligned = frame.rotated_about_center(-angle);
                (aligned, outcome)
            }
            AlignOutcome::Degraded { reason } => {
                if !self.degraded_reported {
                    warn!(
                        detector = self.detector.name(),
                        "Face detection failed, leaving frames unaligned: {}", reason
                    );
                    self.degraded_reported = true;
                } else {
                    debug!(detector = self.detector.name(), "Face detection failed: {}", reason);
                }
                (frame, outcome)
            }
            _ => (frame, outcome),
        }
    }
}
