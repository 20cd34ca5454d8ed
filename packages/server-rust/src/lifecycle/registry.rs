use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::service::CaughtFailure;

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors returned when registering a release callback.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("cannot register release callback {name:?}: teardown already started")]
    Closed { name: String },
}

// ---------------------------------------------------------------------------
// ReleaseReport
// ---------------------------------------------------------------------------

/// A release callback that returned an error or panicked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseFailure {
    pub name: String,
    pub error: String,
}

/// Outcome of [`ShutdownRegistry::release_all`], in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    pub released: Vec<String>,
    pub failed: Vec<ReleaseFailure>,
}

impl ReleaseReport {
    /// Returns `true` when every callback completed without error.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ShutdownRegistry
// ---------------------------------------------------------------------------

/// Ordered collection of release callbacks run once during teardown.
///
/// Callbacks are appended at startup and run in registration order by
/// [`release_all`](Self::release_all). Registration is lock-protected, so
/// late registration from another task is safe until teardown starts;
/// after that it is refused.
pub struct ShutdownRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    callbacks: Vec<(String, ReleaseFn)>,
    closed: bool,
}

impl ShutdownRegistry {
    /// Creates an empty, open registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                callbacks: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Appends a named release callback.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Closed`] once `release_all()` has started.
    pub fn register<F, Fut>(&self, name: impl Into<String>, callback: F) -> Result<(), RegistryError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RegistryError::Closed { name });
        }
        let callback: ReleaseFn = Box::new(move || callback().boxed());
        inner.callbacks.push((name, callback));
        Ok(())
    }

    /// Number of callbacks waiting to run.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` once teardown has started.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Closes the registry and runs every callback once, first registered
    /// first.
    ///
    /// A callback that fails or panics is logged and recorded; the remaining
    /// callbacks still run. Calling this again returns an empty report.
    pub async fn release_all(&self) -> ReleaseReport {
        let callbacks = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.callbacks)
        };

        let mut report = ReleaseReport::default();
        for (name, callback) in callbacks {
            match run_callback(callback).await {
                Ok(()) => {
                    info!(callback = %name, "resource released");
                    report.released.push(name);
                }
                Err(error) => {
                    error!(callback = %name, error = %error, "failed to release resource");
                    report.failed.push(ReleaseFailure { name, error });
                }
            }
        }
        report
    }
}

async fn run_callback(callback: ReleaseFn) -> Result<(), String> {
    let future = panic::catch_unwind(AssertUnwindSafe(callback))
        .map_err(|payload| panicked(payload.as_ref()))?;

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(format!("{e:#}")),
        Err(payload) => Err(panicked(payload.as_ref())),
    }
}

fn panicked(payload: &(dyn std::any::Any + Send)) -> String {
    format!("panicked: {}", CaughtFailure::from_panic(payload).message)
}

impl Default for ShutdownRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let names: Vec<&str> = inner.callbacks.iter().map(|(name, _)| name.as_str()).collect();
        f.debug_struct("ShutdownRegistry")
            .field("callbacks", &names)
            .field("closed", &inner.closed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
