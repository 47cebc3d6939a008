//! Face tilt estimation and correction.
//!
//! The aligner asks a [`LandmarkDetector`] for the two eye centres of the
//! most prominent face, measures the tilt of the line between them and, when
//! the tilt is worth correcting, rotates the frame back to level. Detection
//! problems never fail a frame: they come back as
//! [`AlignOutcome::Degraded`] and the frame passes through untouched.

mod aligner;
mod landmarks;
#[cfg(feature = "opencv")]
pub mod yunet;

pub use aligner::{AlignOutcome, AlignerConfig, AngleEstimate, FaceAligner};
pub use landmarks::{DetectorFactory, EyeLandmarks, LandmarkDetector, NoopDetector};

#[cfg(test)]
pub use landmarks::MockLandmarkDetector;

use std::path::PathBuf;
use std::sync::Arc;

/// Pick the best detector backend compiled into this build.
///
/// With the `opencv` feature and a readable YuNet model at `face_model`, each
/// run gets its own YuNet instance sized for the run's frames. Otherwise every
/// frame reports a degraded detection and is left unchanged.
pub fn default_detector_factory(face_model: Option<PathBuf>) -> DetectorFactory {
    #[cfg(feature = "opencv")]
    if let Some(model) = face_model {
        return Arc::new(move |width: u32, height: u32| -> Box<dyn LandmarkDetector> {
            match yunet::YuNetDetector::new(&model, width, height) {
                Ok(detector) => Box::new(detector),
                Err(e) => {
                    tracing::warn!("YuNet unavailable, face alignment disabled: {}", e);
                    Box::new(NoopDetector::new(e.to_string()))
                }
            }
        });
    }

    #[cfg(feature = "opencv")]
    let reason = "no face model configured";

    #[cfg(not(feature = "opencv"))]
    let reason = {
        if face_model.is_some() {
            tracing::debug!("Face model configured but the opencv feature is not enabled");
        }
        "no face detector backend compiled in"
    };

    Arc::new(move |_width: u32, _height: u32| -> Box<dyn LandmarkDetector> {
        Box::new(NoopDetector::new(reason))
    })
}
