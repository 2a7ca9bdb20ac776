use std::time::Duration;

pub const DEFAULT_SERVER_NAME: &str = "nrpc-server";
pub const DEFAULT_SERVER_VERSION: &str = "2.0.0";
pub const DEFAULT_NAMESPACE: &str = "nrpc";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONCURRENCY: usize = 1000;

/// Server identity and dispatch limits.
///
/// A zero `timeout` disables the per-call deadline; a zero
/// `max_concurrency` is treated as one.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub version: String,
    pub namespace: String,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub enable_streaming: bool,
    pub enable_metrics: bool,
    // Wrap each dispatch in a span carrying service/method/request id.
    pub enable_tracing: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            version: DEFAULT_SERVER_VERSION.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            enable_streaming: true,
            enable_metrics: true,
            enable_tracing: false,
        }
    }
}

impl ServerConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
