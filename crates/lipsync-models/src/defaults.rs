//! Pipeline defaults shared by the media, worker and API crates.

/// Frames taller than this are downscaled before inference.
pub const DEFAULT_TARGET_HEIGHT: u32 = 720;

/// Tilts beyond this (in degrees) are treated as detector noise and left alone.
pub const DEFAULT_MAX_ALIGN_ANGLE: f64 = 60.0;

/// Tilts at or below this (in degrees) are not corrected.
pub const ALIGN_DEAD_ZONE_DEGREES: f64 = 5.0;

/// Codec used for the intermediate preprocessed video.
pub const DEFAULT_PREPROCESS_CODEC: &str = "mpeg4";

/// Where the inference program leaves its artifact, relative to its working directory.
pub const DEFAULT_RESULT_RELATIVE_PATH: &str = "results/result_voice.mp4";

/// MIME type of the produced artifact.
pub const RESULT_MIME_TYPE: &str = "video/mp4";

/// File name offered when the artifact is downloaded.
pub const RESULT_DOWNLOAD_NAME: &str = "lip_sync_result.mp4";

/// Default checkpoint directory for model weights.
pub const DEFAULT_CHECKPOINT_DIR: &str = "checkpoints";
