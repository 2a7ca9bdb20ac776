use super::{Middleware, Next};
use crate::context::CallContext;
use crate::handler::{HandlerResult, Request};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Logs each call's start and outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct Logging;

#[async_trait]
impl Middleware for Logging {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        let start = Instant::now();
        let request_id = ctx.request_id().to_string();
        let service = req.service.clone();
        let method = req.method.clone();
        tracing::debug!(%request_id, %service, %method, "request started");

        let result = next.run(ctx, req).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(_) => {
                tracing::info!(%request_id, %service, %method, elapsed_ms, "request completed")
            }
            Err(err) => tracing::warn!(
                %request_id,
                %service,
                %method,
                elapsed_ms,
                code = %err.code,
                error = %err.message,
                "request failed"
            ),
        }
        result
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub requests: u64,
    pub errors: u64,
    pub total_duration: Duration,
}

/// Counts calls per `service.method` and forwards them to the `metrics` facade.
#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    errors: AtomicU64,
    per_method: Mutex<BTreeMap<String, MethodStats>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Stats for one `service.method` key.
    pub fn stats(&self, key: &str) -> Option<MethodStats> {
        self.per_method.lock().get(key).copied()
    }
}

#[async_trait]
impl Middleware for Metrics {
    async fn handle(&self, ctx: CallContext, req: Request, next: Next<'_>) -> HandlerResult {
        let key = format!("{}.{}", req.service, req.method);
        let service = req.service.clone();
        let method = req.method.clone();
        let start = Instant::now();
        let result = next.run(ctx, req).await;
        let elapsed = start.elapsed();

        self.requests.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "nrpc_middleware_requests_total",
            "service" => service.clone(),
            "method" => method.clone()
        )
        .increment(1);
        metrics::histogram!(
            "nrpc_middleware_duration_seconds",
            "service" => service.clone(),
            "method" => method.clone()
        )
        .record(elapsed.as_secs_f64());
        if result.is_err() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                "nrpc_middleware_errors_total",
                "service" => service,
                "method" => method
            )
            .increment(1);
        }

        let mut per_method = self.per_method.lock();
        let stats = per_method.entry(key).or_default();
        stats.requests += 1;
        stats.total_duration += elapsed;
        if result.is_err() {
            stats.errors += 1;
        }
        drop(per_method);
        result
    }
}
