use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the listen port
pub const PORT_ENV: &str = "NODEGATE_PORT";
/// Environment variable overriding the container runtime command
pub const RUNTIME_ENV: &str = "NODEGATE_RUNTIME";
/// Environment variable naming a configuration file
pub const CONFIG_ENV: &str = "NODEGATE_CONFIG";

/// Upper bound for every timeout and TTL setting, in seconds
pub const MAX_DURATION_SECS: u64 = 24 * 60 * 60;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Container runtime settings
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Container resolution cache settings
    #[serde(default)]
    pub resolver: ResolverConfig,

    /// Web UI ports exposed by every cluster node
    #[serde(default)]
    pub ports: NodePorts,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 15080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address, must be a loopback address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Upper bound for resolving, fetching and rewriting one request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Path to PID file (default: <temp dir>/nodegate.pid)
    pub pid_file: Option<String>,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn pid_file_path(&self) -> PathBuf {
        self.pid_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("nodegate.pid"))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Container runtime CLI (default: docker)
    #[serde(default = "default_runtime_command")]
    pub command: String,

    /// Prefix shared by all cluster containers: `<prefix>-<cluster>-node<N>`
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,

    /// Timeout for runtime inspection commands such as `ps`
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,

    /// curl --connect-timeout inside the container
    #[serde(default = "default_fetch_connect_timeout")]
    pub fetch_connect_timeout_secs: u64,

    /// curl --max-time inside the container
    #[serde(default = "default_fetch_max_time")]
    pub fetch_max_time_secs: u64,
}

impl RuntimeConfig {
    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            container_prefix: default_container_prefix(),
            exec_timeout_secs: default_exec_timeout(),
            fetch_connect_timeout_secs: default_fetch_connect_timeout(),
            fetch_max_time_secs: default_fetch_max_time(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    /// How long a resolution (including "not found") stays cached
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

impl ResolverConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

/// Internal ports of the web UIs linked from the landing page
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct NodePorts {
    #[serde(default = "default_master_ui")]
    pub master_ui: u16,
    #[serde(default = "default_tserver_ui")]
    pub tserver_ui: u16,
    #[serde(default = "default_db_ui")]
    pub db_ui: u16,
    #[serde(default = "default_master_rpc")]
    pub master_rpc: u16,
    #[serde(default = "default_tserver_rpc")]
    pub tserver_rpc: u16,
}

impl NodePorts {
    /// Labelled ports in landing page order
    pub fn labelled(&self) -> [(&'static str, u16); 5] {
        [
            ("Master UI", self.master_ui),
            ("TServer UI", self.tserver_ui),
            ("DB UI", self.db_ui),
            ("Master RPC", self.master_rpc),
            ("TServer RPC", self.tserver_rpc),
        ]
    }
}

impl Default for NodePorts {
    fn default() -> Self {
        Self {
            master_ui: default_master_ui(),
            tserver_ui: default_tserver_ui(),
            db_ui: default_db_ui(),
            master_rpc: default_master_rpc(),
            tserver_rpc: default_tserver_rpc(),
        }
    }
}

fn default_listen_port() -> u16 {
    15080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_runtime_command() -> String {
    "docker".to_string()
}

fn default_container_prefix() -> String {
    "yb".to_string()
}

fn default_exec_timeout() -> u64 {
    10
}

fn default_fetch_connect_timeout() -> u64 {
    5
}

fn default_fetch_max_time() -> u64 {
    30
}

fn default_cache_ttl() -> u64 {
    10
}

fn default_master_ui() -> u16 {
    7000
}

fn default_tserver_ui() -> u16 {
    9000
}

fn default_db_ui() -> u16 {
    15433
}

fn default_master_rpc() -> u16 {
    7100
}

fn default_tserver_rpc() -> u16 {
    9100
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, then apply environment overrides.
    ///
    /// Without a path the built-in defaults are used.
    pub fn load_with_env(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
                })?;
                toml::from_str(&content)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `NODEGATE_*` overrides using the given variable lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(PORT_ENV).filter(|v| !v.trim().is_empty()) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid {} '{}': {}", PORT_ENV, port, e))?;
        }
        if let Some(command) = lookup(RUNTIME_ENV).filter(|v| !v.trim().is_empty()) {
            self.runtime.command = command.trim().to_string();
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        match self.server.bind.parse::<IpAddr>() {
            Ok(ip) if ip.is_loopback() => {}
            Ok(ip) => errors.push(format!("server.bind must be a loopback address, got {}", ip)),
            Err(e) => errors.push(format!("server.bind '{}' is invalid: {}", self.server.bind, e)),
        }
        if self.server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs must be greater than 0".to_string());
        }
        if self.runtime.command.trim().is_empty() {
            errors.push("runtime.command must not be empty".to_string());
        }
        let prefix = &self.runtime.container_prefix;
        if prefix.is_empty()
            || !prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            errors.push(format!(
                "runtime.container_prefix '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                prefix
            ));
        }
        if self.runtime.exec_timeout_secs == 0 || self.runtime.fetch_max_time_secs == 0 {
            errors.push("runtime timeouts must be greater than 0".to_string());
        }
        for (name, secs) in [
            ("server.request_timeout_secs", self.server.request_timeout_secs),
            ("runtime.exec_timeout_secs", self.runtime.exec_timeout_secs),
            ("runtime.fetch_connect_timeout_secs", self.runtime.fetch_connect_timeout_secs),
            ("runtime.fetch_max_time_secs", self.runtime.fetch_max_time_secs),
            ("resolver.cache_ttl_secs", self.resolver.cache_ttl_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                errors.push(format!(
                    "{} must be at most {} (one day), got {}",
                    name, MAX_DURATION_SECS, secs
                ));
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
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 18080
bind = "127.0.0.1"
request_timeout_secs = 20

[runtime]
command = "podman"
container_prefix = "db"
fetch_max_time_secs = 15

[resolver]
cache_ttl_secs = 3

[ports]
db_ui = 15000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 18080);
        assert_eq!(config.server.request_timeout(), Duration::from_secs(20));
        assert_eq!(config.runtime.command, "podman");
        assert_eq!(config.runtime.container_prefix, "db");
        assert_eq!(config.runtime.fetch_max_time_secs, 15);
        assert_eq!(config.runtime.fetch_connect_timeout_secs, 5);
        assert_eq!(config.resolver.cache_ttl(), Duration::from_secs(3));
        assert_eq!(config.ports.db_ui, 15000);
        assert_eq!(config.ports.master_ui, 7000);
        config.validate().unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.port, 15080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.request_timeout_secs, 60);
        assert_eq!(config.runtime.command, "docker");
        assert_eq!(config.runtime.container_prefix, "yb");
        assert_eq!(config.resolver.cache_ttl_secs, 10);
        assert_eq!(
            config.ports.labelled().map(|(_, port)| port),
            [7000, 9000, 15433, 7100, 9100]
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 15080);
        assert_eq!(config.ports, NodePorts::default());
    }

    #[test]
    fn test_default_pid_file_in_temp_dir() {
        let config = ServerConfig::default();
        assert_eq!(
            config.pid_file_path(),
            std::env::temp_dir().join("nodegate.pid")
        );

        let config = ServerConfig {
            pid_file: Some("/run/custom.pid".to_string()),
            ..ServerConfig::default()
        };
        assert_eq!(config.pid_file_path(), PathBuf::from("/run/custom.pid"));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> =
            [(PORT_ENV, "19090"), (RUNTIME_ENV, "podman")].into_iter().collect();
        let mut config = Config::default();
        config
            .apply_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.server.port, 19090);
        assert_eq!(config.runtime.command, "podman");
    }

    #[test]
    fn test_env_override_ignores_blank_values() {
        let mut config = Config::default();
        config
            .apply_env_overrides(|_| Some("  ".to_string()))
            .unwrap();
        assert_eq!(config.server.port, 15080);
        assert_eq!(config.runtime.command, "docker");
    }

    #[test]
    fn test_env_override_rejects_bad_port() {
        let mut config = Config::default();
        let err = config
            .apply_env_overrides(|key| (key == PORT_ENV).then(|| "not-a-port".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(PORT_ENV));
    }

    #[test]
    fn test_validate_rejects_public_bind() {
        let mut config = Config::default();
        config.server.bind = "0.0.0.0".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("loopback"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.runtime.command = String::new();
        config.runtime.container_prefix = "bad prefix".to_string();
        config.server.request_timeout_secs = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("runtime.command"));
        assert!(err.contains("container_prefix"));
        assert!(err.contains("request_timeout_secs"));
    }

    #[test]
    fn test_validate_rejects_oversized_durations() {
        let mut config = Config::default();
        config.resolver.cache_ttl_secs = u64::MAX;
        config.runtime.fetch_max_time_secs = MAX_DURATION_SECS + 1;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("resolver.cache_ttl_secs"));
        assert!(err.contains("runtime.fetch_max_time_secs"));
        assert!(!err.contains("server.request_timeout_secs"));

        config.resolver.cache_ttl_secs = MAX_DURATION_SECS;
        config.runtime.fetch_max_time_secs = MAX_DURATION_SECS;
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 15999").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 15999);
    }

    #[test]
    fn test_load_with_env_missing_file() {
        let err = Config::load_with_env(Some(Path::new("/nonexistent/nodegate.toml")))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to read config file"));
    }
}
