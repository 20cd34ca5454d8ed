//! Database connectivity. The pool is one of the resources released during
//! teardown.

pub mod postgres;

pub use postgres::{connect, register_pool_release, DatabaseConfig, POOL_RELEASE_NAME};
