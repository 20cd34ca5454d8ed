//! Request pipeline: configuration, failure classification, and middleware.

pub mod config;
pub mod failure;
pub mod middleware;

// Re-export key types for convenient access.
pub use config::{RateLimitConfig, ServiceConfig};
pub use failure::{CaughtFailure, FailureKind, RequestFailure};
pub use middleware::{build_pipeline, Pipeline};
