//! Lip-sync pipeline worker.
//!
//! This crate provides:
//! - Model weight provisioning with download-once semantics
//! - Per-run scratch namespaces
//! - External inference program invocation with streamed output
//! - The end-to-end run orchestrator
//! - Run-scoped logging and metrics

pub mod config;
pub mod error;
pub mod inference;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod provision;
pub mod scratch;

pub use config::{InferenceConfig, PipelineConfig, ProvisionerConfig};
pub use error::{PipelineError, PipelineResult};
pub use inference::InferenceCommand;
pub use logging::RunLogger;
pub use orchestrator::{
    EventSender, InferenceArtifact, InferenceOrchestrator, RunReport, RunRequest,
};
pub use provision::ModelProvisioner;
pub use scratch::RunScratch;
