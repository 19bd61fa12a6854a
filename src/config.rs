use std::net::SocketAddr;
use std::time::Duration;

use secrecy::SecretString;

/// Worker discovery and cache settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Containers whose name equals or contains this marker are workers.
    pub worker_name_marker: String,
    /// How long a successful refresh stays fresh.
    pub cache_ttl: Duration,
    /// Period of the background refresh loop.
    pub refresh_interval: Duration,
    /// Consider stopped containers during discovery.
    pub include_stopped: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            worker_name_marker: "deployment-worker".to_string(),
            cache_ttl: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(30),
            include_stopped: false,
        }
    }
}

impl RegistryConfig {
    pub fn with_marker(mut self, marker: impl Into<String>) -> Self {
        self.worker_name_marker = marker.into();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }
}

/// Container runtime (docker CLI) settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Path or name of the docker binary
    pub docker_bin: String,
    /// Upper bound on a single runtime invocation, including `exec`
    pub exec_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            exec_timeout: Duration::from_secs(600),
        }
    }
}

/// Options passed to `ssh` for every synthesized command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    pub strict_host_key_checking: bool,
    pub connect_timeout_secs: u32,
    pub server_alive_interval_secs: u32,
    pub server_alive_count_max: u32,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            strict_host_key_checking: false,
            connect_timeout_secs: 30,
            server_alive_interval_secs: 60,
            server_alive_count_max: 3,
        }
    }
}

/// In-memory execution log settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionLogConfig {
    /// Maximum number of tracked executions; the oldest are evicted first.
    pub capacity: usize,
}

impl Default for ExecutionLogConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen_addr: SocketAddr,
    /// Hex-encoded 32-byte AES key.
    pub encryption_key: SecretString,
    pub registry: RegistryConfig,
    pub runtime: RuntimeConfig,
    pub ssh: SshOptions,
    pub executions: ExecutionLogConfig,
}

impl ServiceConfig {
    pub fn new(listen_addr: SocketAddr, encryption_key: SecretString) -> Self {
        Self {
            listen_addr,
            encryption_key,
            registry: RegistryConfig::default(),
            runtime: RuntimeConfig::default(),
            ssh: SshOptions::default(),
            executions: ExecutionLogConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn registry_config_default() {
        let cfg = RegistryConfig::default();
        assert_eq!(cfg.worker_name_marker, "deployment-worker");
        assert_eq!(cfg.cache_ttl, Duration::from_secs(60));
        assert_eq!(cfg.refresh_interval, Duration::from_secs(30));
        assert!(!cfg.include_stopped);
    }

    #[test]
    fn registry_config_builders() {
        let cfg = RegistryConfig::default()
            .with_marker("runner")
            .with_ttl(Duration::from_secs(5))
            .with_refresh_interval(Duration::from_millis(500));
        assert_eq!(cfg.worker_name_marker, "runner");
        assert_eq!(cfg.cache_ttl, Duration::from_secs(5));
        assert_eq!(cfg.refresh_interval, Duration::from_millis(500));
    }

    #[test]
    fn ssh_options_default() {
        let opts = SshOptions::default();
        assert!(!opts.strict_host_key_checking);
        assert_eq!(opts.connect_timeout_secs, 30);
        assert_eq!(opts.server_alive_interval_secs, 60);
        assert_eq!(opts.server_alive_count_max, 3);
    }

    #[test]
    fn runtime_config_default() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.docker_bin, "docker");
        assert_eq!(cfg.exec_timeout, Duration::from_secs(600));
    }

    #[test]
    fn service_config_new() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = ServiceConfig::new(addr, SecretString::from("00".repeat(32)))
            .with_registry(RegistryConfig::default().with_marker("w"));
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.encryption_key.expose_secret().len(), 64);
        assert_eq!(cfg.registry.worker_name_marker, "w");
        assert_eq!(cfg.executions.capacity, 10_000);
    }
}
