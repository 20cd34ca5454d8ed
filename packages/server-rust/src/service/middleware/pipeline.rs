//! Pipeline composition: combines all middleware layers around the router.

use axum::Router;
use tower::ServiceBuilder;

use super::access_log::{AccessLogLayer, AccessLogService};
use super::panic_guard::{PanicGuardLayer, PanicGuardService};
use super::rate_limit::{RateLimitLayer, RateLimitService};
use crate::service::config::ServiceConfig;

/// The composed request pipeline, outermost service first.
pub type Pipeline = RateLimitService<AccessLogService<PanicGuardService<Router>>>;

/// Build the request pipeline by wrapping the application router with
/// middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `RateLimitLayer` -- reject over-limit requests before doing any work
/// 2. `AccessLogLayer` -- time the request and log its final outcome
/// 3. `PanicGuardLayer` -- turn handler panics into a 500 or an aborted
///    connection (closest to the handlers, so the logger sees the
///    substituted status)
///
/// The returned service is cheap to clone; every clone shares one token
/// bucket.
#[must_use]
pub fn build_pipeline(router: Router, config: &ServiceConfig) -> Pipeline {
    ServiceBuilder::new()
        .layer(RateLimitLayer::new(config.rate_limit))
        .layer(AccessLogLayer::new(config.trust_forwarded_headers))
        .layer(PanicGuardLayer::new(config.verbose_panics))
        .service(router)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
