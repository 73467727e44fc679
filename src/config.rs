use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::registry::Instance;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Inbound server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Backend client configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Services seeding the built-in static registry
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path segment that precedes the service name in inbound URIs
    #[serde(default = "default_gateway_prefix")]
    pub gateway_prefix: String,

    /// Fixed Host header sent to every backend
    #[serde(default = "default_backend_host_header")]
    pub backend_host_header: String,

    /// Chunks a pump may queue toward its sink before pausing the source
    #[serde(default = "default_pump_buffer_chunks")]
    pub pump_buffer_chunks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            gateway_prefix: default_gateway_prefix(),
            backend_host_header: default_backend_host_header(),
            pump_buffer_chunks: default_pump_buffer_chunks(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    /// Connect timeout in milliseconds, also the default per-request setup timeout
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// TCP keepalive interval in seconds (0 disables)
    #[serde(default = "default_tcp_keepalive")]
    pub tcp_keepalive_secs: u64,

    /// Reuse backend connections across requests (default: true)
    #[serde(default = "default_keep_alive")]
    pub keep_alive: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            tcp_keepalive_secs: default_tcp_keepalive(),
            keep_alive: default_keep_alive(),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }

    pub fn tcp_keepalive(&self) -> Option<Duration> {
        (self.tcp_keepalive_secs > 0).then(|| Duration::from_secs(self.tcp_keepalive_secs))
    }
}

/// Static instance list for one service
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceConfig {
    pub host: String,
    pub port: u16,

    /// Free-form metadata; a `timeout` key (milliseconds) overrides the default setup timeout
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InstanceConfig {
    pub fn to_instance(&self) -> Instance {
        Instance::new(self.host.clone(), self.port).with_metadata(self.metadata.clone())
    }

    fn validate(&self, service: &str) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err(format!("Service '{}': instance 'host' must not be empty", service));
        }
        if self.port == 0 {
            return Err(format!(
                "Service '{}': instance '{}' port must be greater than 0",
                service, self.host
            ));
        }
        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_prefix() -> String {
    "gateway".to_string()
}

fn default_backend_host_header() -> String {
    "localhost".to_string()
}

fn default_pump_buffer_chunks() -> usize {
    8
}

fn default_connect_timeout() -> u64 {
    3000 // 3 seconds
}

fn default_pool_max_idle_per_host() -> usize {
    10 // Keep up to 10 idle connections per backend
}

fn default_pool_idle_timeout() -> u64 {
    90 // Close idle connections after 90 seconds
}

fn default_tcp_keepalive() -> u64 {
    60
}

fn default_keep_alive() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let prefix = &self.server.gateway_prefix;
        if prefix.is_empty() {
            errors.push("server.gateway_prefix must not be empty".to_string());
        } else if prefix.contains('/') {
            errors.push(format!(
                "server.gateway_prefix '{}' must be a single path segment",
                prefix
            ));
        }

        if self.server.backend_host_header.trim().is_empty() {
            errors.push("server.backend_host_header must not be empty".to_string());
        }

        if self.server.pump_buffer_chunks == 0 {
            errors.push("server.pump_buffer_chunks must be greater than 0".to_string());
        }

        for (name, service) in &self.services {
            for instance in &service.instances {
                if let Err(e) = instance.validate(name) {
                    errors.push(e);
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"
gateway_prefix = "gw"

[client]
connect_timeout_ms = 1500
pool_max_idle_per_host = 4

[services.orders]
instances = [
    { host = "10.0.0.5", port = 8080 },
    { host = "10.0.0.6", port = 8080, metadata = { timeout = "150" } },
]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.gateway_prefix, "gw");
        assert_eq!(config.client.connect_timeout(), Duration::from_millis(1500));
        assert_eq!(config.client.pool_max_idle_per_host, 4);

        let orders = config.services.get("orders").unwrap();
        assert_eq!(orders.instances.len(), 2);
        assert_eq!(
            orders.instances[1].metadata.get("timeout").map(String::as_str),
            Some("150")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_server_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.gateway_prefix, "gateway");
        assert_eq!(config.backend_host_header, "localhost");
        assert_eq!(config.pump_buffer_chunks, 8);
    }

    #[test]
    fn test_default_client_config() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout_ms, 3000);
        assert_eq!(config.pool_max_idle_per_host, 10);
        assert_eq!(config.pool_idle_timeout(), Duration::from_secs(90));
        assert_eq!(config.tcp_keepalive(), Some(Duration::from_secs(60)));
        assert!(config.keep_alive);
    }

    #[test]
    fn test_zero_keepalive_disables() {
        let config: ClientConfig = toml::from_str("tcp_keepalive_secs = 0").unwrap();
        assert_eq!(config.tcp_keepalive(), None);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let toml = r#"
[server]
gateway_prefix = "a/b"
backend_host_header = " "
pump_buffer_chunks = 0

[services.orders]
instances = [{ host = "", port = 0 }]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let err = config.validate().unwrap_err().to_string();

        assert!(err.contains("single path segment"), "{}", err);
        assert!(err.contains("backend_host_header"), "{}", err);
        assert!(err.contains("pump_buffer_chunks"), "{}", err);
        assert!(err.contains("'host' must not be empty"), "{}", err);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
gateway_prefix = "api"

[services.users]
instances = [{{ host = "127.0.0.1", port = 7000 }}]
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.gateway_prefix, "api");
        let instance = config.services["users"].instances[0].to_instance();
        assert_eq!(instance.authority(), "127.0.0.1:7000");
    }

    #[test]
    fn test_load_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\ngateway_prefix = \"\"").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
