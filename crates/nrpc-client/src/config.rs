// Client defaults plus env and YAML overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

pub const DEFAULT_NAMESPACE: &str = "nrpc";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_STREAM_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub namespace: String,
    // Per-attempt reply timeout; also the idle limit between stream messages.
    pub timeout: Duration,
    pub max_retries: u32,
    // Backoff before attempt n is `retry_delay * n`.
    pub retry_delay: Duration,
    // Items buffered per stream before new ones are dropped.
    pub stream_queue_capacity: usize,
    pub sweep_interval: Duration,
    pub enable_metrics: bool,
    pub enable_tracing: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            timeout: DEFAULT_CALL_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            stream_queue_capacity: DEFAULT_STREAM_QUEUE_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            enable_metrics: true,
            enable_tracing: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    namespace: Option<String>,
    timeout_ms: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    stream_queue_capacity: Option<usize>,
    sweep_interval_ms: Option<u64>,
    enable_metrics: Option<bool>,
    enable_tracing: Option<bool>,
}

impl ClientConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Defaults overlaid with `NRPC_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("NRPC_NAMESPACE")
            && !value.is_empty()
        {
            config.namespace = value;
        }
        if let Some(value) = read_u64_env("NRPC_CLIENT_TIMEOUT_MS") {
            config.timeout = Duration::from_millis(value);
        }
        // Zero is meaningful here: no retries.
        if let Some(value) = std::env::var("NRPC_CLIENT_MAX_RETRIES")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
        {
            config.max_retries = value;
        }
        if let Some(value) = read_u64_env("NRPC_CLIENT_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("NRPC_CLIENT_STREAM_QUEUE") {
            config.stream_queue_capacity = value;
        }
        if let Some(value) = read_u64_env("NRPC_CLIENT_SWEEP_INTERVAL_MS") {
            config.sweep_interval = Duration::from_millis(value);
        }
        if let Some(value) = read_bool_env("NRPC_CLIENT_METRICS") {
            config.enable_metrics = value;
        }
        if let Some(value) = read_bool_env("NRPC_CLIENT_TRACING") {
            config.enable_tracing = value;
        }
        config
    }

    /// `from_env` plus a YAML override file from `config_path` or
    /// `NRPC_CLIENT_CONFIG`.
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("NRPC_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }
}

impl ClientConfigOverride {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(value) = &self.namespace
            && !value.is_empty()
        {
            config.namespace = value.clone();
        }
        if let Some(value) = self.timeout_ms
            && value > 0
        {
            config.timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.max_retries {
            config.max_retries = value;
        }
        if let Some(value) = self.retry_delay_ms
            && value > 0
        {
            config.retry_delay = Duration::from_millis(value);
        }
        if let Some(value) = self.stream_queue_capacity
            && value > 0
        {
            config.stream_queue_capacity = value;
        }
        if let Some(value) = self.sweep_interval_ms
            && value > 0
        {
            config.sweep_interval = Duration::from_millis(value);
        }
        if let Some(value) = self.enable_metrics {
            config.enable_metrics = value;
        }
        if let Some(value) = self.enable_tracing {
            config.enable_tracing = value;
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn read_bool_env(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
}
