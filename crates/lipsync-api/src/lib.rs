//! Axum HTTP API server.
//!
//! This crate provides:
//! - Multipart upload of a face video and an audio track
//! - Background lip-sync runs with polling and cancellation
//! - Preview and download of the result
//! - Expiry of finished runs and their results
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod retention;
pub mod routes;
pub mod runner;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use retention::RetentionSweeper;
pub use routes::create_router;
pub use state::{AppState, RunRegistry, RunView};
