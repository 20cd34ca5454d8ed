//! Drives `Running -> Draining -> Terminated` once a termination is requested.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use super::registry::{ReleaseFailure, ShutdownRegistry};
use crate::network::{ServerError, ServerHandle, ShutdownTrigger};

/// Why the drain phase did not finish cleanly.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("drain abandoned by a repeated termination signal")]
    Forced,

    #[error("failed to stop server: {0}")]
    Server(#[from] ServerError),
}

/// Result of a completed teardown.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// The drain did not complete: it timed out or was abandoned.
    pub forced: bool,
    /// The drain failure, if any. "Already closed" is not a failure.
    pub drain_error: Option<ShutdownError>,
    /// Release callbacks that completed, in the order they ran.
    pub released: Vec<String>,
    /// Release callbacks that failed. Recorded only; does not affect success.
    pub failed: Vec<ReleaseFailure>,
}

impl ShutdownReport {
    /// Returns `true` when the process should exit with status 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.drain_error.is_none()
    }
}

/// Stops the server and then runs every release callback.
pub struct ShutdownCoordinator {
    registry: Arc<ShutdownRegistry>,
    server: ServerHandle,
    timeout: Duration,
}

impl ShutdownCoordinator {
    #[must_use]
    pub fn new(registry: Arc<ShutdownRegistry>, server: ServerHandle, timeout: Duration) -> Self {
        Self {
            registry,
            server,
            timeout,
        }
    }

    /// Waits for the first termination request, then tears down.
    pub async fn run(self, trigger: ShutdownTrigger) -> ShutdownReport {
        trigger.requested().await;
        self.shutdown(&trigger).await
    }

    /// Drains the server, bounded by the shutdown timeout, then releases
    /// resources.
    ///
    /// A forced request on `trigger` abandons the drain immediately. Release
    /// callbacks run in every case, after the drain has ended.
    pub async fn shutdown(&self, trigger: &ShutdownTrigger) -> ShutdownReport {
        info!(timeout = ?self.timeout, "shutting down server gracefully");

        let drained = tokio::select! {
            biased;
            () = trigger.forced() => Err(ShutdownError::Forced),
            result = self.server.stop(self.timeout) => result.map_err(ShutdownError::from),
        };

        let drain_error = match drained {
            Ok(()) => None,
            Err(ShutdownError::Server(ServerError::AlreadyClosed)) => {
                info!("server already closed");
                None
            }
            Err(e) => {
                error!(error = %e, "server shutdown failed");
                Some(e)
            }
        };
        let forced = matches!(
            drain_error,
            Some(ShutdownError::Forced | ShutdownError::Server(ServerError::DrainTimeout { .. }))
        );
        if forced {
            warn!(
                in_flight = self.server.shutdown_controller().in_flight_count(),
                "forced shutdown, releasing resources with connections still open"
            );
        }

        self.server.shutdown_controller().mark_terminated();
        let release = self.registry.release_all().await;

        info!(
            forced,
            released = release.released.len(),
            failed = release.failed.len(),
            "shutdown complete"
        );

        ShutdownReport {
            forced,
            drain_error,
            released: release.released,
            failed: release.failed,
        }
    }
}
