//! Networking types, configuration, server lifecycle, and shutdown control.

pub mod client_ip;
pub mod config;
pub mod handlers;
pub mod module;
pub mod shutdown;
pub mod signals;

pub use client_ip::{resolve_client_ip, ClientIp};
pub use config::NetworkConfig;
pub use handlers::api_router;
pub use module::{NetworkModule, ServerError, ServerHandle};
pub use shutdown::{InFlightGuard, LifecycleState, ShutdownController};
pub use signals::{install_signal_handlers, ShutdownTrigger, TriggerStage};
