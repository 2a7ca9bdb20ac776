//! Client side of nrpc: request/reply with retries, streaming calls and
//! event publish/subscribe over any [`Transport`](nrpc_transport::Transport).
//!
//! ```
//! use nrpc_broker::Broker;
//! use nrpc_client::{Client, ClientConfig};
//! use nrpc_server::{Server, ServerConfig};
//! use std::sync::Arc;
//!
//! let rt = tokio::runtime::Runtime::new().expect("rt");
//! rt.block_on(async {
//!     let broker = Arc::new(Broker::new());
//!     let server = Server::new(broker.clone(), ServerConfig::default());
//!     server.start().await.expect("start");
//!
//!     let client = Client::new(broker, ClientConfig::default());
//!     let health = client.health_check().await.expect("health");
//!     assert_eq!(health["status"], "healthy");
//!     client.close();
//!     server.stop().await;
//! });
//! ```
mod client;
mod config;
mod error;
mod pending;
mod stream;

pub use client::{CallOptions, Client, EventSubscription, IDEMPOTENCY_KEY, Response};
pub use config::{
    ClientConfig, DEFAULT_CALL_TIMEOUT, DEFAULT_MAX_RETRIES, DEFAULT_NAMESPACE,
    DEFAULT_RETRY_DELAY, DEFAULT_STREAM_QUEUE_CAPACITY, DEFAULT_SWEEP_INTERVAL,
};
pub use error::{ClientError, Result};
pub use stream::MessageStream;
