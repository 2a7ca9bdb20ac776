//! nrpc daemon library crate.
//!
//! Hosts an in-process broker and a server with the bundled services, and
//! exposes Prometheus metrics plus liveness and readiness probes.
pub mod config;
pub mod observability;
pub mod services;

use anyhow::{Context, Result};
use nrpc_broker::Broker;
use nrpc_server::middleware::{Logging, Metrics, Recovery};
use nrpc_server::{Server, ServerConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Builds the server for `config` on top of `broker`, with the bundled
/// services registered and the default middleware installed.
pub fn build_server(config: &config::NrpcdConfig, broker: Arc<Broker>) -> Result<Server> {
    let server_config = ServerConfig {
        name: config.server_name.clone(),
        namespace: config.namespace.clone(),
        timeout: Duration::from_millis(config.request_timeout_ms),
        max_concurrency: config.max_concurrency,
        ..ServerConfig::default()
    };
    let server = Server::new(broker, server_config);
    // Recovery is outermost so a panicking middleware is contained too.
    server.use_middleware(Arc::new(Recovery));
    server.use_middleware(Arc::new(Logging));
    server.use_middleware(Arc::new(Metrics::new()));
    services::registry(&config.server_name)?
        .install(&server)
        .context("register services")?;
    Ok(server)
}

/// Runs the daemon until `shutdown` resolves.
pub async fn run_with_shutdown<F>(shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let metrics_handle = observability::init_observability()?;
    let config = config::NrpcdConfig::from_env_or_yaml()?;

    let broker = Arc::new(
        Broker::new()
            .with_queue_capacity(config.queue_capacity)
            .context("configure broker")?,
    );
    tracing::info!("broker started");

    let metrics_task = {
        let broker = Arc::clone(&broker);
        let bind = config.metrics_bind;
        tokio::spawn(async move {
            if let Err(err) = observability::serve_metrics(metrics_handle, bind, broker).await {
                tracing::warn!(error = %err, "metrics listener exited");
            }
        })
    };

    let server = build_server(&config, Arc::clone(&broker))?;
    server.start().await.context("start server")?;
    tracing::info!(
        namespace = %config.namespace,
        services = ?server.handler_names(),
        "nrpc server started"
    );

    shutdown.await;
    server.stop().await;
    broker.close();
    metrics_task.abort();
    tracing::info!("nrpcd stopped");
    Ok(())
}
