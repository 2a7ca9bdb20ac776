use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;

const DEFAULT_METRICS_BIND: &str = "0.0.0.0:8080";
const DEFAULT_NAMESPACE: &str = "nrpc";
const DEFAULT_SERVER_NAME: &str = "nrpcd";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_CONCURRENCY: usize = 1000;
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

// Daemon configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct NrpcdConfig {
    // Subject namespace served by this daemon.
    pub namespace: String,
    // Metrics and probe HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Per-call handler deadline.
    pub request_timeout_ms: u64,
    // Handlers allowed to run at once.
    pub max_concurrency: usize,
    // Per-subscriber broker queue depth.
    pub queue_capacity: usize,
    // Reported by the info control command.
    pub server_name: String,
}

#[derive(Debug, Deserialize)]
struct NrpcdConfigOverride {
    namespace: Option<String>,
    metrics_bind: Option<String>,
    request_timeout_ms: Option<u64>,
    max_concurrency: Option<usize>,
    queue_capacity: Option<usize>,
    server_name: Option<String>,
}

impl NrpcdConfig {
    pub fn from_env() -> Result<Self> {
        let metrics_bind = std::env::var("NRPC_METRICS_BIND")
            .unwrap_or_else(|_| DEFAULT_METRICS_BIND.to_string())
            .parse()
            .with_context(|| "parse NRPC_METRICS_BIND")?;
        let namespace = std::env::var("NRPC_NAMESPACE")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let server_name = std::env::var("NRPC_SERVER_NAME")
            .ok()
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_NAME.to_string());
        let request_timeout_ms = std::env::var("NRPC_REQUEST_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        let max_concurrency = std::env::var("NRPC_MAX_CONCURRENCY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENCY);
        let queue_capacity = std::env::var("NRPC_QUEUE_CAPACITY")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_QUEUE_CAPACITY);
        Ok(Self {
            namespace,
            metrics_bind,
            request_timeout_ms,
            max_concurrency,
            queue_capacity,
            server_name,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("NRPC_CONFIG") {
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read NRPC_CONFIG: {path}"))?;
            let override_cfg: NrpcdConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse nrpcd config yaml")?;
            if let Some(value) = override_cfg.namespace
                && !value.is_empty()
            {
                config.namespace = value;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.request_timeout_ms
                && value > 0
            {
                config.request_timeout_ms = value;
            }
            if let Some(value) = override_cfg.max_concurrency
                && value > 0
            {
                config.max_concurrency = value;
            }
            if let Some(value) = override_cfg.queue_capacity
                && value > 0
            {
                config.queue_capacity = value;
            }
            if let Some(value) = override_cfg.server_name
                && !value.is_empty()
            {
                config.server_name = value;
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    struct EnvGuard {
        key: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn unset(key: &'static str) -> Self {
            let prev = std::env::var(key).ok();
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => unsafe {
                    std::env::set_var(self.key, value);
                },
                None => unsafe {
                    std::env::remove_var(self.key);
                },
            }
        }
    }

    const KEYS: [&str; 7] = [
        "NRPC_NAMESPACE",
        "NRPC_METRICS_BIND",
        "NRPC_REQUEST_TIMEOUT_MS",
        "NRPC_MAX_CONCURRENCY",
        "NRPC_QUEUE_CAPACITY",
        "NRPC_SERVER_NAME",
        "NRPC_CONFIG",
    ];

    fn clear_env() -> Vec<EnvGuard> {
        KEYS.into_iter().map(EnvGuard::unset).collect()
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        let _guards = clear_env();
        let config = NrpcdConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.namespace, "nrpc");
        assert_eq!(config.server_name, "nrpcd");
        assert_eq!(config.metrics_bind, "0.0.0.0:8080".parse().expect("addr"));
        assert_eq!(config.request_timeout_ms, 30_000);
        assert_eq!(config.max_concurrency, 1000);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    #[serial]
    fn env_overrides_and_ignores_zero() {
        let _guards = clear_env();
        let _ns = EnvGuard::set("NRPC_NAMESPACE", "orders");
        let _timeout = EnvGuard::set("NRPC_REQUEST_TIMEOUT_MS", "250");
        let _concurrency = EnvGuard::set("NRPC_MAX_CONCURRENCY", "0");
        let _queue = EnvGuard::set("NRPC_QUEUE_CAPACITY", "not-a-number");

        let config = NrpcdConfig::from_env().expect("config");
        assert_eq!(config.namespace, "orders");
        assert_eq!(config.request_timeout_ms, 250);
        assert_eq!(config.max_concurrency, 1000);
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    #[serial]
    fn bad_metrics_bind_is_an_error() {
        let _guards = clear_env();
        let _bind = EnvGuard::set("NRPC_METRICS_BIND", "nowhere");
        let err = NrpcdConfig::from_env().expect_err("bad bind");
        assert!(err.to_string().contains("NRPC_METRICS_BIND"));
    }

    #[test]
    #[serial]
    fn yaml_overrides_env() {
        let _guards = clear_env();
        let _ns = EnvGuard::set("NRPC_NAMESPACE", "from-env");
        let path = std::env::temp_dir().join(format!("nrpcd-config-{}.yaml", std::process::id()));
        fs::write(
            &path,
            "namespace: from-yaml\nmetrics_bind: 127.0.0.1:9100\nqueue_capacity: 0\nserver_name: edge\n",
        )
        .expect("write yaml");
        let _config = EnvGuard::set("NRPC_CONFIG", path.to_str().expect("utf-8 path"));

        let config = NrpcdConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.namespace, "from-yaml");
        assert_eq!(config.metrics_bind.port(), 9100);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.server_name, "edge");
        let _ = fs::remove_file(&path);
    }

    #[test]
    #[serial]
    fn missing_yaml_file_is_an_error() {
        let _guards = clear_env();
        let _config = EnvGuard::set("NRPC_CONFIG", "/nonexistent/nrpcd.yaml");
        assert!(NrpcdConfig::from_env_or_yaml().is_err());
    }
}
