//! Process lifecycle state with in-flight connection tracking.
//!
//! Lifecycle transitions go through `ArcSwap`. Open connections are counted
//! by RAII guards; the last guard to drop wakes anyone waiting for the drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Process lifecycle state, transitioned by the shutdown controller.
///
/// State machine: Running -> Draining -> Terminated. Transitions never go
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// Listener is accepting connections and requests are admitted.
    Running,
    /// Listener is closed; in-flight connections are finishing.
    Draining,
    /// Drain finished or was abandoned; resources are being released.
    Terminated,
}

impl LifecycleState {
    /// Lowercase name used in structured log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }
}

/// Coordinates the stop of the accept loop with in-flight tracking.
///
/// 1. The accept loop selects on `shutdown_receiver()` to stop accepting
/// 2. Each accepted connection holds an [`InFlightGuard`]
/// 3. `begin_draining()` moves to Draining and signals all receivers
/// 4. `wait_for_drain()` waits until every guard has been dropped
/// 5. `mark_terminated()` records that teardown has started
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<ConnectionTracker>,
    state: Arc<ArcSwap<LifecycleState>>,
}

impl ShutdownController {
    /// Creates a new controller in the `Running` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(ConnectionTracker::default()),
            state: Arc::new(ArcSwap::from_pointee(LifecycleState::Running)),
        }
    }

    /// Returns a receiver that flips to `true` once draining begins.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Moves `Running -> Draining` and signals all shutdown receivers.
    ///
    /// Returns `true` only for the call that performed the transition; any
    /// later call is a no-op returning `false`.
    pub fn begin_draining(&self) -> bool {
        let previous = self.state.rcu(|current| match **current {
            LifecycleState::Running => Arc::new(LifecycleState::Draining),
            _ => Arc::clone(current),
        });
        if *previous != LifecycleState::Running {
            return false;
        }
        // send_replace stores the value even when no receiver is alive yet.
        self.shutdown_signal.send_replace(true);
        true
    }

    /// Moves to `Terminated`, passing through `Draining` if needed.
    pub fn mark_terminated(&self) {
        self.begin_draining();
        self.state.store(Arc::new(LifecycleState::Terminated));
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Returns `true` while new work may still be admitted.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lifecycle_state() == LifecycleState::Running
    }

    /// Creates an RAII guard that tracks one open connection.
    ///
    /// The count drops again when the guard is dropped, even if the
    /// connection task panics.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.open.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            tracker: Arc::clone(&self.in_flight),
        }
    }

    /// Number of connections currently open.
    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.open.load(Ordering::Acquire)
    }

    /// Waits until every in-flight guard has been dropped.
    ///
    /// Returns `false` if connections are still open when `timeout`
    /// elapses.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                // Register interest before checking, so a guard dropped in
                // between still wakes us.
                let notified = self.in_flight.drained.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Open-connection count plus a wakeup for whoever waits on it reaching 0.
#[derive(Debug, Default)]
struct ConnectionTracker {
    open: AtomicU64,
    drained: Notify,
}

/// RAII guard for one open connection.
#[derive(Debug)]
pub struct InFlightGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.open.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.drained.notify_waiters();
        }
    }
}
