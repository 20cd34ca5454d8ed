//! Token-bucket admission control for requests.
//!
//! Rejects requests with `429 Too Many Requests` when the shared bucket is
//! empty. Excess requests are dropped, never queued.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tokio::time::Instant;
use tower::{Layer, Service};

use crate::service::config::RateLimitConfig;

// ---------------------------------------------------------------------------
// TokenBucket
// ---------------------------------------------------------------------------

/// Token bucket refilled lazily from elapsed time.
///
/// Credit is kept in nanoseconds of refill time so accrual is exact: one
/// token equals `refill_interval` worth of credit, and the bucket holds at
/// most `burst` tokens.
#[derive(Debug)]
pub struct TokenBucket {
    token_cost: u128,
    capacity: u128,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    credit: u128,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// A zero `burst` is treated as 1 and a zero `refill_interval` as one
    /// nanosecond so the bucket can always admit eventually.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    /// Creates a full bucket whose refill clock starts at `now`.
    #[must_use]
    pub fn new_at(config: RateLimitConfig, now: Instant) -> Self {
        let token_cost = config.refill_interval.as_nanos().max(1);
        let capacity = token_cost * u128::from(config.burst.max(1));
        Self {
            token_cost,
            capacity,
            state: Mutex::new(BucketState {
                credit: capacity,
                last_refill: now,
            }),
        }
    }

    /// Takes one token if available. Never blocks.
    pub fn admit(&self) -> bool {
        self.admit_at(Instant::now())
    }

    /// Takes one token if available, refilling up to `now` first.
    pub fn admit_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if state.credit >= self.token_cost {
            state.credit -= self.token_cost;
            true
        } else {
            false
        }
    }

    /// Whole tokens available at `now`.
    #[must_use]
    pub fn available_at(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        u64::try_from(state.credit / self.token_cost).unwrap_or(u64::MAX)
    }

    /// Time until the next token accrues, zero if one is available.
    #[must_use]
    pub fn wait_time_at(&self, now: Instant) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        let missing = self.token_cost.saturating_sub(state.credit);
        Duration::from_nanos(u64::try_from(missing).unwrap_or(u64::MAX))
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // Clock readings from concurrent callers can arrive out of order.
        if now <= state.last_refill {
            return;
        }
        let elapsed = (now - state.last_refill).as_nanos();
        state.credit = (state.credit + elapsed).min(self.capacity);
        state.last_refill = now;
    }
}

// ---------------------------------------------------------------------------
// RateLimitLayer
// ---------------------------------------------------------------------------

/// Tower layer that admits requests through a shared [`TokenBucket`].
///
/// Every service produced by this layer shares the same bucket, so the
/// limit is process-wide.
#[derive(Debug, Clone)]
pub struct RateLimitLayer {
    bucket: Arc<TokenBucket>,
}

impl RateLimitLayer {
    /// Create a new `RateLimitLayer` with a full bucket.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            bucket: Arc::new(TokenBucket::new(config)),
        }
    }

    /// Returns the shared bucket.
    #[must_use]
    pub fn bucket(&self) -> Arc<TokenBucket> {
        Arc::clone(&self.bucket)
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            bucket: Arc::clone(&self.bucket),
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitService
// ---------------------------------------------------------------------------

/// Service wrapper that short-circuits with 429 when the bucket is empty.
#[derive(Debug, Clone)]
pub struct RateLimitService<S> {
    inner: S,
    bucket: Arc<TokenBucket>,
}

impl<S> Service<Request> for RateLimitService<S>
where
    S: Service<Request, Response = Response> + Send,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        if !self.bucket.admit() {
            tracing::debug!(
                method = %req.method(),
                path = req.uri().path(),
                "rate limit exceeded"
            );
            return Box::pin(async { Ok(StatusCode::TOO_MANY_REQUESTS.into_response()) });
        }

        Box::pin(self.inner.call(req))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
