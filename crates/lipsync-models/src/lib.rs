//! Shared data models for the lip-sync pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Run identifiers and run status
//! - Model weight variants
//! - Inference options
//! - Progress events streamed to callers
//! - Pipeline-wide defaults (target height, alignment thresholds, artifact naming)

pub mod defaults;
pub mod event;
pub mod options;
pub mod run;
pub mod variant;

// Re-export common types
pub use event::RunEvent;
pub use options::InferenceOptions;
pub use run::{RunId, RunStatus};
pub use variant::{ModelVariant, UnknownVariant};
