//! Server lifecycle with deferred startup and graceful stop.
//!
//! Implements the deferred startup pattern: `new()` creates shared state,
//! `start()` binds the TCP listener, and `serve()` runs the accept loop.
//! A [`ServerHandle`] taken before `serve()` stops the loop and waits for
//! in-flight connections with a bounded deadline.

use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request};
use axum::response::Response;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower::{Service, ServiceExt};
use tracing::{debug, error, info};

use super::config::NetworkConfig;
use super::shutdown::{LifecycleState, ShutdownController};

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Errors produced by the server lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serve() called before start()")]
    NotStarted,

    #[error("server already closed")]
    AlreadyClosed,

    #[error("drain timed out after {timeout:?} with {remaining} connection(s) still open")]
    DrainTimeout { timeout: Duration, remaining: u64 },
}

/// Manages the HTTP server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- allocates the shutdown controller
/// 2. `start()` -- binds the TCP listener to the configured address
/// 3. `serve()` -- accepts connections until a stop is requested
///
/// `serve()` returning `Ok(())` always means a stop was requested. Bind
/// failures surface from `start()`.
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    shutdown: Arc<ShutdownController>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            listener: None,
            shutdown: Arc::new(ShutdownController::new()),
        }
    }

    /// Returns a shared reference to the shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }

    /// Returns a handle that can stop this server once it is serving.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound address, whose port may differ from the
    /// configured one when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound (e.g.,
    /// port in use).
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info!(address = %local_addr, "TCP listener bound");

        self.listener = Some(listener);
        Ok(local_addr)
    }

    /// Accepts connections and dispatches every request to `service` until
    /// a stop is requested through a [`ServerHandle`].
    ///
    /// Each connection runs on its own task and holds an in-flight guard
    /// until it closes. When the stop signal fires the listener is dropped
    /// immediately and every open connection is asked to finish its current
    /// request and close.
    ///
    /// An `Err` from `service` aborts the connection without writing a
    /// response.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotStarted`] if `start()` was not called, or
    /// [`ServerError::Io`] if the listener's address cannot be read. Accept
    /// failures are retried with backoff.
    pub async fn serve<S>(self, service: S) -> Result<(), ServerError>
    where
        S: Service<Request, Response = Response> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let listener = self.listener.ok_or(ServerError::NotStarted)?;
        let shutdown_ctrl = self.shutdown;
        let local_addr = listener.local_addr()?;

        info!(address = %local_addr, "server starting: http://{local_addr}");

        let mut stop = pin!(stop_requested(shutdown_ctrl.shutdown_receiver()));
        let mut backoff = Duration::ZERO;
        loop {
            tokio::select! {
                () = &mut stop => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff = Duration::ZERO;
                        debug!(peer = %peer, "connection accepted");
                        spawn_connection(stream, peer, service.clone(), &shutdown_ctrl);
                    }
                    Err(e) if is_connection_error(&e) => {
                        debug!(error = %e, "pending connection dropped before accept");
                    }
                    Err(e) => {
                        // Resource exhaustion (e.g. EMFILE): back off and retry.
                        backoff = (backoff * 2).clamp(MIN_ACCEPT_BACKOFF, MAX_ACCEPT_BACKOFF);
                        error!(error = %e, retry_in = ?backoff, "failed to accept connection");
                        tokio::time::sleep(backoff).await;
                    }
                },
            }
        }

        drop(listener);
        info!(
            in_flight = shutdown_ctrl.in_flight_count(),
            "listener closed, no longer accepting connections"
        );
        Ok(())
    }
}

/// Cloneable handle used to stop a serving [`NetworkModule`].
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: Arc<ShutdownController>,
}

impl ServerHandle {
    /// Requests a graceful stop and waits for in-flight connections.
    ///
    /// Moves the lifecycle to `Draining`, which closes the listener, then
    /// waits up to `timeout` for every open connection to finish.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::AlreadyClosed`] if a stop was already
    /// requested, or [`ServerError::DrainTimeout`] if connections were still
    /// open when `timeout` elapsed.
    pub async fn stop(&self, timeout: Duration) -> Result<(), ServerError> {
        if !self.shutdown.begin_draining() {
            return Err(ServerError::AlreadyClosed);
        }

        info!(
            in_flight = self.shutdown.in_flight_count(),
            timeout = ?timeout,
            "draining connections"
        );

        if self.shutdown.wait_for_drain(timeout).await {
            info!("all connections drained");
            Ok(())
        } else {
            Err(ServerError::DrainTimeout {
                timeout,
                remaining: self.shutdown.in_flight_count(),
            })
        }
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn lifecycle_state(&self) -> LifecycleState {
        self.shutdown.lifecycle_state()
    }

    /// Returns the shared shutdown controller.
    #[must_use]
    pub fn shutdown_controller(&self) -> Arc<ShutdownController> {
        Arc::clone(&self.shutdown)
    }
}

/// Resolves once the controller signals that draining has begun.
async fn stop_requested(mut rx: watch::Receiver<bool>) {
    // A dropped controller can never signal; treat it as a stop.
    let _ = rx.wait_for(|stopping| *stopping).await;
}

/// Errors that affect a single pending connection rather than the listener.
fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// Serves one HTTP/1.1 connection on its own task.
fn spawn_connection<S>(
    stream: TcpStream,
    peer: SocketAddr,
    service: S,
    shutdown_ctrl: &ShutdownController,
) where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let guard = shutdown_ctrl.in_flight_guard();
    let stop_rx = shutdown_ctrl.shutdown_receiver();

    tokio::spawn(async move {
        let _guard = guard;

        let hyper_service = hyper::service::service_fn(move |req: hyper::Request<Incoming>| {
            let mut req = req.map(Body::new);
            req.extensions_mut().insert(ConnectInfo(peer));
            service.clone().oneshot(req)
        });

        let mut conn = pin!(http1::Builder::new().serve_connection(TokioIo::new(stream), hyper_service));
        let mut stop = pin!(stop_requested(stop_rx));
        let mut stopping = false;

        loop {
            tokio::select! {
                result = conn.as_mut() => {
                    if let Err(e) = result {
                        debug!(peer = %peer, error = %e, "connection closed with error");
                    }
                    break;
                }
                () = &mut stop, if !stopping => {
                    stopping = true;
                    conn.as_mut().graceful_shutdown();
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use tokio::sync::Notify;

    use super::*;
    use crate::network::handlers::api_router;
    use crate::service::{build_pipeline, ServiceConfig};

    fn local_config() -> NetworkConfig {
        NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        }
    }

    async fn started(router: Router) -> (SocketAddr, ServerHandle, tokio::task::JoinHandle<Result<(), ServerError>>) {
        let mut module = NetworkModule::new(local_config());
        let addr = module.start().await.expect("start should succeed");
        let handle = module.handle();
        let pipeline = build_pipeline(router, &ServiceConfig::default());
        let serving = tokio::spawn(module.serve(pipeline));
        (addr, handle, serving)
    }

    #[test]
    fn new_creates_module_without_binding() {
        let module = NetworkModule::new(NetworkConfig::default());
        assert!(module.listener.is_none());
        assert_eq!(module.handle().lifecycle_state(), LifecycleState::Running);
    }

    #[test]
    fn handles_share_one_controller() {
        let module = NetworkModule::new(NetworkConfig::default());
        let s1 = module.shutdown_controller();
        let s2 = module.handle().shutdown_controller();
        assert!(Arc::ptr_eq(&s1, &s2));
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = NetworkModule::new(local_config());
        let addr = module.start().await.expect("start should succeed");
        assert!(addr.port() > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn start_reports_bind_failure() {
        let mut first = NetworkModule::new(local_config());
        let addr = first.start().await.unwrap();

        let mut second = NetworkModule::new(NetworkConfig {
            host: "127.0.0.1".to_string(),
            port: addr.port(),
            ..NetworkConfig::default()
        });
        let err = second.start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = NetworkModule::new(NetworkConfig::default());
        let pipeline = build_pipeline(api_router(), &ServiceConfig::default());
        let err = module.serve(pipeline).await.unwrap_err();
        assert!(matches!(err, ServerError::NotStarted));
    }

    #[tokio::test]
    async fn serves_requests_and_stops_gracefully() {
        let (addr, handle, serving) = started(api_router()).await;

        let body = reqwest::get(format!("http://{addr}/api/ip"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "127.0.0.1");

        handle.stop(Duration::from_secs(5)).await.unwrap();
        serving.await.unwrap().unwrap();
        assert_eq!(handle.lifecycle_state(), LifecycleState::Draining);

        // The listener is gone.
        assert!(TcpStream::connect(addr).await.is_err());

        let err = handle.stop(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ServerError::AlreadyClosed));
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_requests() {
        let entered = Arc::new(Notify::new());
        let finished = Arc::new(AtomicBool::new(false));
        let router = {
            let entered = Arc::clone(&entered);
            let finished = Arc::clone(&finished);
            Router::new().route(
                "/api/slow",
                get(move || {
                    let entered = Arc::clone(&entered);
                    let finished = Arc::clone(&finished);
                    async move {
                        entered.notify_one();
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        finished.store(true, Ordering::SeqCst);
                        "done"
                    }
                }),
            )
        };
        let (addr, handle, serving) = started(router).await;

        let request = tokio::spawn(reqwest::get(format!("http://{addr}/api/slow")));
        entered.notified().await;

        handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(finished.load(Ordering::SeqCst));

        let response = request.await.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "done");
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stop_reports_drain_timeout() {
        let entered = Arc::new(Notify::new());
        let router = {
            let entered = Arc::clone(&entered);
            Router::new().route(
                "/api/stuck",
                get(move || {
                    let entered = Arc::clone(&entered);
                    async move {
                        entered.notify_one();
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        "late"
                    }
                }),
            )
        };
        let (addr, handle, serving) = started(router).await;

        let _request = tokio::spawn(reqwest::get(format!("http://{addr}/api/stuck")));
        entered.notified().await;

        let err = handle.stop(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ServerError::DrainTimeout { remaining: 1, .. }));
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn transport_failure_closes_connection_without_response() {
        let router = Router::new().route(
            "/api/peer-gone",
            get(|| async {
                if true {
                    std::panic::panic_any(io::Error::from(io::ErrorKind::BrokenPipe));
                }
                "unreachable"
            }),
        );
        let (addr, handle, serving) = started(router).await;

        let result = reqwest::get(format!("http://{addr}/api/peer-gone")).await;
        assert!(result.is_err(), "no response should be written");

        // The server is still healthy afterwards.
        let ok = reqwest::get(format!("http://{addr}/api/missing")).await.unwrap();
        assert_eq!(ok.status(), StatusCode::NOT_FOUND);

        handle.stop(Duration::from_secs(5)).await.unwrap();
        serving.await.unwrap().unwrap();
    }
}
