//! Panic-isolation middleware.
//!
//! Catches panics raised while handling a request and converts them into a
//! typed outcome: `Ok(500)` for handler failures, or
//! `Err(RequestFailure::Transport)` when the peer connection is already
//! gone and no response should be written.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::convert::Infallible;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Once;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::http::header::{AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, SET_COOKIE};
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::FutureExt;
use tower::{Layer, Service};

use crate::service::failure::{CaughtFailure, FailureKind, RequestFailure};

thread_local! {
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static INSTALL_HOOK: Once = Once::new();

/// Installs a panic hook that records the panicking thread's call stack.
///
/// The recorded stack is picked up by the guard when it recovers on the
/// same thread. The previously installed hook still runs afterwards.
/// Calling this more than once has no further effect.
pub fn install_backtrace_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
            previous(info);
        }));
    });
}

fn take_backtrace() -> String {
    PANIC_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(Backtrace::force_capture)
        .to_string()
}

fn is_sensitive(name: &HeaderName) -> bool {
    [AUTHORIZATION, PROXY_AUTHORIZATION, COOKIE, SET_COOKIE].contains(name)
}

/// Renders the request line and headers, with credential values redacted.
/// The body is never included.
#[must_use]
pub fn dump_request(req: &Request) -> String {
    let target = req
        .uri()
        .path_and_query()
        .map_or_else(|| req.uri().path(), |pq| pq.as_str());
    let mut dump = format!("{} {} {:?}\r\n", req.method(), target, req.version());
    for (name, value) in req.headers() {
        let value = if is_sensitive(name) {
            "[redacted]"
        } else {
            value.to_str().unwrap_or("[binary]")
        };
        dump.push_str(name.as_str());
        dump.push_str(": ");
        dump.push_str(value);
        dump.push_str("\r\n");
    }
    dump.push_str("\r\n");
    dump
}

// ---------------------------------------------------------------------------
// PanicGuardLayer
// ---------------------------------------------------------------------------

/// Tower layer that isolates handler panics to the request that raised them.
#[derive(Debug, Clone)]
pub struct PanicGuardLayer {
    verbose: bool,
}

impl PanicGuardLayer {
    /// With `verbose` set, recovered panics are logged with a call stack.
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl<S> Layer<S> for PanicGuardLayer {
    type Service = PanicGuardService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PanicGuardService {
            inner,
            verbose: self.verbose,
        }
    }
}

// ---------------------------------------------------------------------------
// PanicGuardService
// ---------------------------------------------------------------------------

/// Service wrapper that catches panics from `call` and from the response
/// future.
#[derive(Debug, Clone)]
pub struct PanicGuardService<S> {
    inner: S,
    verbose: bool,
}

impl<S> Service<Request> for PanicGuardService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = RequestFailure;
    type Future = Pin<Box<dyn Future<Output = Result<Response, RequestFailure>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|never| match never {})
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let path = req.uri().path().to_string();
        let dump = dump_request(&req);
        let verbose = self.verbose;

        let fut = match panic::catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(fut) => fut,
            Err(payload) => {
                let outcome = recover(&path, &dump, verbose, payload);
                return Box::pin(async move { outcome });
            }
        };

        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(never)) => match never {},
                Err(payload) => recover(&path, &dump, verbose, payload),
            }
        })
    }
}

fn recover(
    path: &str,
    dump: &str,
    verbose: bool,
    payload: Box<dyn Any + Send>,
) -> Result<Response, RequestFailure> {
    let caught = CaughtFailure::from_panic(payload.as_ref());

    match caught.kind {
        FailureKind::Transport => {
            // Discard any stack recorded by the hook for this panic.
            PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take());
            tracing::error!(
                path = path,
                error = %caught.message,
                failure = FailureKind::Transport.as_str(),
                request = dump,
                "connection closed by peer"
            );
            Err(RequestFailure::Transport {
                message: caught.message,
            })
        }
        FailureKind::Handler => {
            if verbose {
                let stack = take_backtrace();
                tracing::error!(
                    path = path,
                    error = %caught.message,
                    failure = FailureKind::Handler.as_str(),
                    request = dump,
                    stack = %stack,
                    "recovered from panic"
                );
            } else {
                PANIC_BACKTRACE.with(|slot| slot.borrow_mut().take());
                tracing::error!(
                    path = path,
                    error = %caught.message,
                    failure = FailureKind::Handler.as_str(),
                    request = dump,
                    "recovered from panic"
                );
            }
            Ok(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
