//! Termination signal listener.
//!
//! The first SIGINT or SIGTERM cancels the graceful token; a second one
//! cancels the force token, abandoning any drain still in progress.

use std::io;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Which stage a termination request reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStage {
    /// First request: drain and tear down.
    Graceful,
    /// Repeated request: stop waiting for in-flight work.
    Forced,
}

/// Pair of one-shot tokens observed by the shutdown coordinator.
#[derive(Debug, Clone, Default)]
pub struct ShutdownTrigger {
    graceful: CancellationToken,
    force: CancellationToken,
}

impl ShutdownTrigger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one termination request and reports which stage it reached.
    ///
    /// The first call cancels the graceful token; every later call cancels
    /// the force token.
    pub fn request(&self) -> TriggerStage {
        if self.graceful.is_cancelled() {
            self.force.cancel();
            TriggerStage::Forced
        } else {
            self.graceful.cancel();
            TriggerStage::Graceful
        }
    }

    /// Cancels both tokens at once, skipping the drain.
    pub fn force(&self) {
        self.graceful.cancel();
        self.force.cancel();
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.graceful.is_cancelled()
    }

    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.force.is_cancelled()
    }

    /// Resolves once a termination has been requested.
    pub async fn requested(&self) {
        self.graceful.cancelled().await;
    }

    /// Resolves once a forced stop has been requested.
    pub async fn forced(&self) {
        self.force.cancelled().await;
    }
}

/// Installs SIGINT and SIGTERM handlers that feed `trigger`.
///
/// Handlers are registered before this returns so that a signal arriving
/// right after startup is not lost. The listener task exits after the
/// second signal.
///
/// # Errors
///
/// Returns an error if the OS refuses the handler registration.
pub fn install_signal_handlers(trigger: ShutdownTrigger) -> io::Result<JoinHandle<()>> {
    let mut signals = TerminationSignals::register()?;

    Ok(tokio::spawn(async move {
        loop {
            let signal = signals.recv().await;
            match trigger.request() {
                TriggerStage::Graceful => {
                    info!(signal, "termination signal received, shutting down server gracefully");
                }
                TriggerStage::Forced => {
                    warn!(signal, "second termination signal received, abandoning drain");
                    break;
                }
            }
        }
    }))
}

#[cfg(unix)]
struct TerminationSignals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl TerminationSignals {
    fn register() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            Some(()) = self.sigint.recv() => "SIGINT",
            Some(()) = self.sigterm.recv() => "SIGTERM",
            else => std::future::pending().await,
        }
    }
}

#[cfg(not(unix))]
struct TerminationSignals;

#[cfg(not(unix))]
impl TerminationSignals {
    fn register() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        "CTRL_C"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn new_trigger_is_idle() {
        let trigger = ShutdownTrigger::new();
        assert!(!trigger.is_requested());
        assert!(!trigger.is_forced());
    }

    #[test]
    fn first_request_is_graceful_second_is_forced() {
        let trigger = ShutdownTrigger::new();
        assert_eq!(trigger.request(), TriggerStage::Graceful);
        assert!(trigger.is_requested());
        assert!(!trigger.is_forced());

        assert_eq!(trigger.request(), TriggerStage::Forced);
        assert!(trigger.is_forced());
        assert_eq!(trigger.request(), TriggerStage::Forced);
    }

    #[test]
    fn clones_share_tokens() {
        let trigger = ShutdownTrigger::new();
        let observer = trigger.clone();
        trigger.request();
        assert!(observer.is_requested());
    }

    #[test]
    fn force_cancels_both_tokens() {
        let trigger = ShutdownTrigger::new();
        trigger.force();
        assert!(trigger.is_requested());
        assert!(trigger.is_forced());
    }

    #[tokio::test]
    async fn requested_resolves_after_request() {
        let trigger = ShutdownTrigger::new();
        let waiter = {
            let trigger = trigger.clone();
            tokio::spawn(async move { trigger.requested().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        trigger.request();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn signal_handlers_install() {
        let handle = install_signal_handlers(ShutdownTrigger::new()).unwrap();
        assert!(!handle.is_finished());
        handle.abort();
    }
}
