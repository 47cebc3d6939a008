//! Lip-sync model weight variants.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Default download location of the standard weights.
pub const STANDARD_MODEL_URL: &str =
    "https://github.com/justinjohn0306/Wav2Lip/releases/download/models/wav2lip.pth";

/// Default download location of the GAN weights.
pub const GAN_MODEL_URL: &str =
    "https://github.com/justinjohn0306/Wav2Lip/releases/download/models/wav2lip_gan.pth";

/// Which pretrained weights the inference program loads.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    /// Baseline weights, faster
    #[default]
    Standard,
    /// GAN-refined weights, better visual quality but slower
    Gan,
}

impl ModelVariant {
    pub const ALL: &'static [Self] = &[Self::Standard, Self::Gan];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Gan => "gan",
        }
    }

    /// File name of the weights inside the checkpoint directory.
    pub const fn file_name(&self) -> &'static str {
        match self {
            Self::Standard => "wav2lip.pth",
            Self::Gan => "wav2lip_gan.pth",
        }
    }

    pub const fn default_url(&self) -> &'static str {
        match self {
            Self::Standard => STANDARD_MODEL_URL,
            Self::Gan => GAN_MODEL_URL,
        }
    }
}

impl fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Returned when a variant name cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown model variant: {0} (expected \"standard\" or \"gan\")")]
pub struct UnknownVariant(pub String);

impl FromStr for ModelVariant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "wav2lip" | "default" => Ok(Self::Standard),
            "gan" | "wav2lip_gan" | "hq" => Ok(Self::Gan),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_names() {
        assert_eq!(ModelVariant::Standard.file_name(), "wav2lip.pth");
        assert_eq!(ModelVariant::Gan.file_name(), "wav2lip_gan.pth");
    }

    #[test]
    fn test_parse_variant() {
        assert_eq!("gan".parse::<ModelVariant>().unwrap(), ModelVariant::Gan);
        assert_eq!(" Standard ".parse::<ModelVariant>().unwrap(), ModelVariant::Standard);
        assert!("turbo".parse::<ModelVariant>().is_err());
    }

    #[test]
    fn test_urls_differ_per_variant() {
        assert_ne!(
            ModelVariant::Standard.default_url(),
            ModelVariant::Gan.default_url()
        );
        assert!(ModelVariant::Gan.default_url().ends_with(ModelVariant::Gan.file_name()));
    }
}
