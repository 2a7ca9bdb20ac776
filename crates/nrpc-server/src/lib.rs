//! Server side of nrpc: service registration, subject routing, middleware
//! and the control plane.
//!
//! ```
//! use nrpc_broker::Broker;
//! use nrpc_server::{Response, Server, ServerConfig, ServiceBuilder};
//! use std::sync::Arc;
//!
//! let rt = tokio::runtime::Runtime::new().expect("rt");
//! rt.block_on(async {
//!     let server = Server::new(Arc::new(Broker::new()), ServerConfig::default());
//!     let echo = ServiceBuilder::new("echo")
//!         .method("echo", "returns its input", |_ctx, req| async move {
//!             Ok(Response::new(req.data))
//!         })
//!         .build()
//!         .expect("service");
//!     server.register_handler(Arc::new(echo)).expect("register");
//!     server.start().await.expect("start");
//!     assert!(server.is_started());
//!     server.stop().await;
//! });
//! ```
mod config;
mod context;
mod control;
mod error;
mod handler;
pub mod middleware;
mod server;
mod service;

pub use config::{
    DEFAULT_MAX_CONCURRENCY, DEFAULT_NAMESPACE, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SERVER_NAME,
    DEFAULT_SERVER_VERSION, ServerConfig,
};
pub use context::{CallContext, StreamSink};
pub use error::{HandlerError, Result, ServerError};
pub use handler::{HandlerResult, MethodInfo, Request, Response, ServiceHandler};
pub use middleware::{Middleware, Next};
pub use server::Server;
pub use service::{Service, ServiceBuilder, ServiceRegistry};

// Service and method names become single subject tokens.
pub(crate) fn is_valid_token(name: &str) -> bool {
    !name.is_empty()
        && !name
            .chars()
            .any(|c| c == '.' || c == '*' || c == '>' || c.is_whitespace())
}
