use super::{Middleware, Next, panic_message};
use crate::context::CallContext;
use crate::error::HandlerError;
use crate::handler::{HandlerResult, Request};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

/// Fails the call with `timeout` if the rest of the chain runs longer than the
/// configured duration. Zero disables the limit.
#[derive(Debug, Clone, Copy)]
pub struct Timeout(pub Duration);

#[async_trait]
impl Middleware for Timeout {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        if self.0.is_zero() {
            return next.run(ctx, req).await;
        }
        let ctx = ctx.with_timeout(self.0);
        match tokio::time::timeout(self.0, next.run(ctx, req)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::timeout(format!(
                "request timed out after {}ms",
                self.0.as_millis()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Stops calling a failing downstream after `max_failures` consecutive errors.
///
/// While open every call fails fast with `unavailable`. Once `reset_timeout`
/// has passed since the last failure the next call is let through as a trial:
/// success closes the circuit, failure opens it again.
#[derive(Debug)]
pub struct CircuitBreaker {
    max_failures: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: Duration) -> Self {
        Self {
            max_failures: max_failures.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    fn admit(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return true;
        }
        let cooled = inner
            .last_failure
            .is_none_or(|at| at.elapsed() > self.reset_timeout);
        if cooled {
            inner.state = CircuitState::HalfOpen;
        }
        cooled
    }

    fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        if success {
            if inner.state == CircuitState::HalfOpen {
                tracing::info!("circuit breaker closed");
            }
            inner.state = CircuitState::Closed;
            inner.failures = 0;
            return;
        }
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        if inner.state == CircuitState::HalfOpen || inner.failures >= self.max_failures {
            if inner.state != CircuitState::Open {
                tracing::warn!(failures = inner.failures, "circuit breaker opened");
            }
            inner.state = CircuitState::Open;
        }
    }
}

#[async_trait]
impl Middleware for CircuitBreaker {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        if !self.admit() {
            return Err(HandlerError::unavailable("circuit breaker is open"));
        }
        let result = next.run(ctx, req).await;
        self.record(result.is_ok());
        result
    }
}

/// Turns a panic in the rest of the chain into an `internal_error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Recovery;

#[async_trait]
impl Middleware for Recovery {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        let request_id = ctx.request_id().to_string();
        let service = req.service.clone();
        let method = req.method.clone();
        match AssertUnwindSafe(next.run(ctx, req)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(%request_id, %service, %method, panic = %message, "handler panicked");
                Err(HandlerError::internal(format!("panic: {message}")))
            }
        }
    }
}
