//! Per-run inference options.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ModelVariant;

/// Options chosen by the caller for one inference run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InferenceOptions {
    /// Use the GAN weights (better quality, slower)
    #[serde(default)]
    pub use_gan: bool,

    /// Pass `--nosmooth` to disable frame-to-frame face box smoothing
    #[serde(default = "default_smoothing_disabled")]
    pub smoothing_disabled: bool,
}

fn default_smoothing_disabled() -> bool {
    true
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            use_gan: false,
            smoothing_disabled: default_smoothing_disabled(),
        }
    }
}

impl InferenceOptions {
    /// Weights selected by these options.
    pub fn variant(&self) -> ModelVariant {
        if self.use_gan {
            ModelVariant::Gan
        } else {
            ModelVariant::Standard
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_disable_smoothing() {
        let options = InferenceOptions::default();
        assert!(!options.use_gan);
        assert!(options.smoothing_disabled);
        assert_eq!(options.variant(), ModelVariant::Standard);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let options: InferenceOptions = serde_json::from_str(r#"{"use_gan": true}"#).unwrap();
        assert!(options.use_gan);
        assert!(options.smoothing_disabled);
        assert_eq!(options.variant(), ModelVariant::Gan);
    }
}
