//! Access-log middleware.
//!
//! Emits exactly one `access` record per completed request with method,
//! path, query, client address, user agent, final status, and latency.
//! Requests that accumulated non-fatal errors get one error record per
//! error instead of the summary.

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request};
use axum::http::header::USER_AGENT;
use axum::http::{Method, StatusCode};
use axum::response::Response;
use parking_lot::Mutex;
use tower::{Layer, Service};

use crate::network::client_ip::{resolve_client_ip, ClientIp};
use crate::service::failure::RequestFailure;

// ---------------------------------------------------------------------------
// RequestErrors
// ---------------------------------------------------------------------------

/// Per-request sink for non-fatal errors.
///
/// The access logger inserts one into the request extensions; handlers
/// extract it with `Extension<RequestErrors>` and push errors that should be
/// reported without failing the response.
#[derive(Debug, Clone, Default)]
pub struct RequestErrors {
    errors: Arc<Mutex<Vec<String>>>,
}

impl RequestErrors {
    pub fn push(&self, error: impl fmt::Display) {
        self.errors.lock().push(error.to_string());
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Drains the accumulated errors.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.errors.lock())
    }
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// Request attributes captured at entry, before the request is consumed.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub started: Instant,
    pub method: Method,
    pub path: String,
    pub query: String,
    pub client_ip: ClientIp,
    pub user_agent: String,
}

impl RequestContext {
    #[must_use]
    pub fn capture(req: &Request, trust_forwarded: bool) -> Self {
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Self {
            started: Instant::now(),
            method: req.method().clone(),
            path: req.uri().path().to_string(),
            query: req.uri().query().unwrap_or_default().to_string(),
            client_ip: resolve_client_ip(req.headers(), peer, trust_forwarded),
            user_agent: req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        }
    }

    /// Emits the completion record(s) for this request.
    pub fn finish(&self, status: Option<StatusCode>, latency: Duration, errors: &RequestErrors) {
        let errors = errors.take();
        if !errors.is_empty() {
            for error in &errors {
                tracing::error!(
                    target: "access",
                    method = %self.method,
                    path = %self.path,
                    error = %error,
                    "request error"
                );
            }
            return;
        }

        tracing::info!(
            target: "access",
            method = %self.method,
            status = status.map_or(0, |s| s.as_u16()),
            path = %self.path,
            query = %self.query,
            ip = %self.client_ip,
            user_agent = %self.user_agent,
            latency = ?latency,
            "request completed"
        );
    }
}

// ---------------------------------------------------------------------------
// AccessLogLayer
// ---------------------------------------------------------------------------

/// Tower layer that records one access record per request.
#[derive(Debug, Clone)]
pub struct AccessLogLayer {
    trust_forwarded: bool,
}

impl AccessLogLayer {
    #[must_use]
    pub fn new(trust_forwarded: bool) -> Self {
        Self { trust_forwarded }
    }
}

impl<S> Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService {
            inner,
            trust_forwarded: self.trust_forwarded,
        }
    }
}

// ---------------------------------------------------------------------------
// AccessLogService
// ---------------------------------------------------------------------------

/// Service wrapper that times the request and logs its outcome.
#[derive(Debug, Clone)]
pub struct AccessLogService<S> {
    inner: S,
    trust_forwarded: bool,
}

impl<S> Service<Request> for AccessLogService<S>
where
    S: Service<Request, Response = Response, Error = RequestFailure> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = RequestFailure;
    type Future = Pin<Box<dyn Future<Output = Result<Response, RequestFailure>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let ctx = RequestContext::capture(&req, self.trust_forwarded);
        let errors = RequestErrors::default();
        req.extensions_mut().insert(errors.clone());
        req.extensions_mut().insert(ctx.client_ip);

        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            let latency = ctx.started.elapsed();

            let status = match &result {
                Ok(response) => Some(response.status()),
                Err(failure) => {
                    errors.push(failure);
                    None
                }
            };
            ctx.finish(status, latency, &errors);

            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
