//! Tower middleware layers for the request pipeline.
//!
//! - [`rate_limit`]: Token-bucket admission control
//! - [`access_log`]: One structured record per completed request
//! - [`panic_guard`]: Panic isolation and failure classification
//! - [`pipeline`]: Composes all layers around the router

pub mod access_log;
pub mod panic_guard;
pub mod pipeline;
pub mod rate_limit;

pub use access_log::{AccessLogLayer, RequestContext, RequestErrors};
pub use panic_guard::{install_backtrace_hook, PanicGuardLayer};
pub use pipeline::{build_pipeline, Pipeline};
pub use rate_limit::{RateLimitLayer, TokenBucket};
