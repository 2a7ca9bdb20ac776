//! Tracing subscriber and Prometheus recorder setup, plus the HTTP listener
//! serving `/metrics`, `/live` and `/ready`.
//!
//! In tests the recorder is installed once and its handle cached, and the
//! subscriber is installed with `try_init`.
use anyhow::{Context, Result};
use axum::http::StatusCode;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use nrpc_broker::Broker;
use std::net::SocketAddr;
use std::sync::Arc;
#[cfg(test)]
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[cfg(test)]
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the tracing subscriber (`RUST_LOG`, default `info`) and the
/// Prometheus recorder. Returns the handle used to render metrics.
pub fn init_observability() -> Result<PrometheusHandle> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    init_subscriber(registry)?;
    install_metrics_recorder()
}

/// Serves metrics and probes on `addr`. `/ready` answers 503 once the
/// broker stops accepting traffic.
pub async fn serve_metrics(
    handle: PrometheusHandle,
    addr: SocketAddr,
    broker: Arc<Broker>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "metrics listener started");
    axum::serve(listener, router(handle, broker).into_make_service()).await
}

fn router(handle: PrometheusHandle, broker: Arc<Broker>) -> axum::Router {
    axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/live", axum::routing::get(|| async { "ok" }))
        .route(
            "/ready",
            axum::routing::get(move || async move {
                if broker.is_closed() {
                    (StatusCode::SERVICE_UNAVAILABLE, "closed")
                } else {
                    (StatusCode::OK, "ok")
                }
            }),
        )
}

fn install_metrics_recorder() -> Result<PrometheusHandle> {
    #[cfg(test)]
    {
        if let Some(handle) = METRICS_HANDLE.get() {
            return Ok(handle.clone());
        }
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")?;
        let _ = METRICS_HANDLE.set(handle.clone());
        Ok(handle)
    }
    #[cfg(not(test))]
    {
        PrometheusBuilder::new()
            .install_recorder()
            .context("install metrics recorder")
    }
}

fn init_subscriber<S>(subscriber: S) -> Result<()>
where
    S: tracing::Subscriber + Send + Sync + 'static,
{
    #[cfg(test)]
    {
        let _ = subscriber.try_init();
        Ok(())
    }
    #[cfg(not(test))]
    {
        subscriber.try_init().context("install tracing subscriber")
    }
}
