//! HTTP handler definitions and the application router.
//!
//! Handlers are plain axum functions; the router mounts them under
//! [`API_PREFIX`] and is handed to the middleware pipeline as-is.

pub mod echo;

pub use echo::echo_ip_handler;

use axum::routing::get;
use axum::Router;

/// Common path prefix for every application route.
pub const API_PREFIX: &str = "/api";

/// Assembles the application router.
///
/// Routes:
/// - `GET /api/ip` -- the caller's resolved address as plain text
pub fn api_router() -> Router {
    Router::new().nest(API_PREFIX, Router::new().route("/ip", get(echo_ip_handler)))
}
