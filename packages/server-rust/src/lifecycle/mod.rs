//! Coordinated teardown: the release-callback registry and the coordinator
//! that drains the server before running it.

pub mod coordinator;
pub mod registry;

pub use coordinator::{ShutdownCoordinator, ShutdownError, ShutdownReport};
pub use registry::{RegistryError, ReleaseFailure, ReleaseReport, ShutdownRegistry};
