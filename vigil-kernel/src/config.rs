//! Node configuration (TOML)
//!
//! Every section and field has a default, so a partial file or no file at
//! all yields a runnable node. The path comes from `VIGIL_CONFIG`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vigil/vigil.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub global: GlobalConfig,
    pub remote_nodes: RemoteNodesConfig,
    pub push_server: PushServerConfig,
    pub push_client: PushClientConfig,
    pub notifications: NotificationsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Empty means the machine hostname.
    pub hostname: String,
    pub group: String,
    pub uuid_file: PathBuf,
    pub listen_address: String,
    pub listen_port: u16,
    pub probes_directory: PathBuf,
    /// Seconds before a probe process is killed.
    pub probe_timeout: u64,
    /// Seconds without update before a child is marked down.
    pub alive_timeout: i64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            group: "local".into(),
            uuid_file: "/var/lib/vigil/uuid".into(),
            listen_address: "0.0.0.0".into(),
            listen_port: 4000,
            probes_directory: "/usr/local/vigil/probes".into(),
            probe_timeout: 10,
            alive_timeout: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteNodesConfig {
    pub check_interval: u64,
    pub check_tries: u32,
    /// Short entries, `host` or `host:port`.
    pub list: Vec<String>,
    pub advanced: Vec<AdvancedRemoteNode>,
}

impl Default for RemoteNodesConfig {
    fn default() -> Self {
        Self {
            check_interval: 10,
            check_tries: 3,
            list: Vec::new(),
            advanced: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvancedRemoteNode {
    pub hostname: String,
    #[serde(default)]
    pub port: Option<u16>,
    /// Levels kept from the peer's tree, 0 for all.
    #[serde(default)]
    pub check_remotes_depth: i32,
    #[serde(default)]
    pub check_interval: Option<u64>,
    #[serde(default)]
    pub check_tries: Option<u32>,
}

/// Fully resolved peer to poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub hostname: String,
    pub port: u16,
    pub depth: i32,
    pub check_interval: u64,
    pub check_tries: u32,
}

impl RemoteNodesConfig {
    /// Normalizes short and advanced entries, filling gaps from the section
    /// defaults and `default_port`.
    pub fn targets(&self, default_port: u16) -> Vec<RemoteTarget> {
        let short = self.list.iter().filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (hostname, port) = match entry.rsplit_once(':') {
                Some((host, port)) => match port.parse::<u16>() {
                    Ok(port) => (host.to_string(), Some(port)),
                    Err(_) => {
                        warn!(entry, "ignoring invalid port in remote entry");
                        (host.to_string(), None)
                    }
                },
                None => (entry.to_string(), None),
            };
            Some(AdvancedRemoteNode {
                hostname,
                port,
                check_remotes_depth: 0,
                check_interval: None,
                check_tries: None,
            })
        });

        short
            .chain(self.advanced.iter().cloned())
            .map(|node| RemoteTarget {
                port: node.port.unwrap_or(default_port),
                depth: node.check_remotes_depth,
                check_interval: node.check_interval.unwrap_or(self.check_interval).max(1),
                check_tries: node.check_tries.unwrap_or(self.check_tries).max(1),
                hostname: node.hostname,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushServerConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub ssl_enabled: bool,
    pub ssl_cert: PathBuf,
    pub ssl_key: PathBuf,
    pub allowed_clients_file: PathBuf,
    pub max_waiting_clients: usize,
    pub auto_accept_clients: bool,
}

impl Default for PushServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "0.0.0.0".into(),
            port: 4001,
            ssl_enabled: true,
            ssl_cert: "/etc/vigil/ssl/vigil.crt".into(),
            ssl_key: "/etc/vigil/ssl/vigil.key".into(),
            allowed_clients_file: "/var/lib/vigil/allowed_clients".into(),
            max_waiting_clients: 100,
            auto_accept_clients: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PushClientConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub ssl_enabled: bool,
    /// Local copy of the server certificate, fetched on first contact.
    pub ssl_cert: PathBuf,
    /// Persisted signature of our uuid.
    pub uuid_sig: PathBuf,
    /// RPC timeout in seconds.
    pub timeout: u64,
    pub push_interval: u64,
}

impl Default for PushClientConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: String::new(),
            port: 4001,
            ssl_enabled: true,
            ssl_cert: "/var/lib/vigil/master.crt".into(),
            uuid_sig: "/var/lib/vigil/uuid.sig".into(),
            timeout: 5,
            push_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub min_level_to_send: i32,
    pub on_node_change: bool,
    pub on_probe_change: bool,
    pub http_enabled: bool,
    pub http_url: String,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            min_level_to_send: 101,
            on_node_change: true,
            on_probe_change: true,
            http_enabled: false,
            http_url: String::new(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.global.alive_timeout <= 0 {
            return Err(ConfigError::Invalid("global.alive_timeout must be positive".into()));
        }
        if self.push_client.enabled && self.push_client.address.is_empty() {
            return Err(ConfigError::Invalid("push_client.address is required".into()));
        }
        if self.notifications.http_enabled && self.notifications.http_url.is_empty() {
            return Err(ConfigError::Invalid("notifications.http_url is required".into()));
        }
        Ok(())
    }

    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Hostname to report, from the file or the machine.
    pub fn resolved_hostname(&self) -> String {
        if !self.global.hostname.is_empty() {
            return self.global.hostname.clone();
        }
        match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                warn!(error = %e, "cannot read machine hostname, using localhost");
                "localhost".into()
            }
        }
    }
}

/// Loads the file named by `VIGIL_CONFIG`. A missing or invalid file falls
/// back to defaults.
pub async fn load_config() -> Config {
    let path = std::env::var("VIGIL_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let path = PathBuf::from(path);
    if !path.exists() {
        warn!(path = %path.display(), "no configuration file, using defaults");
        return Config::default();
    }
    match Config::load_from(&path).await {
        Ok(config) => {
            info!(path = %path.display(), "configuration loaded");
            config
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid configuration, using defaults");
            Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.global.listen_port, 4000);
        assert_eq!(config.push_server.port, 4001);
        assert_eq!(config.global.alive_timeout, 60);
        assert_eq!(config.remote_nodes.check_tries, 3);
        assert_eq!(config.push_server.max_waiting_clients, 100);
        assert_eq!(config.notifications.min_level_to_send, 101);
        assert_eq!(config.push_client.timeout, 5);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [global]
            hostname = "gw-1"

            [push_server]
            enabled = true
            auto_accept_clients = true
            "#,
        )
        .unwrap();
        assert_eq!(config.global.hostname, "gw-1");
        assert_eq!(config.global.group, "local");
        assert!(config.push_server.enabled);
        assert_eq!(config.push_server.port, 4001);
        assert_eq!(config.resolved_hostname(), "gw-1");
    }

    #[test]
    fn test_remote_targets_are_normalized() {
        let config = Config::from_toml(
            r#"
            [remote_nodes]
            check_interval = 30
            list = ["db-1", "web-1:4100", "bad:port"]

            [[remote_nodes.advanced]]
            hostname = "edge"
            port = 4200
            check_remotes_depth = 1
            check_tries = 5
            "#,
        )
        .unwrap();
        let targets = config.remote_nodes.targets(config.global.listen_port);
        assert_eq!(targets.len(), 4);
        assert_eq!((targets[0].hostname.as_str(), targets[0].port), ("db-1", 4000));
        assert_eq!((targets[1].hostname.as_str(), targets[1].port), ("web-1", 4100));
        assert_eq!((targets[2].hostname.as_str(), targets[2].port), ("bad", 4000));
        assert_eq!(targets[3].depth, 1);
        assert_eq!(targets[3].check_tries, 5);
        assert_eq!(targets[3].check_interval, 30);
    }

    #[test]
    fn test_invalid_sections_are_rejected() {
        let err = Config::from_toml("[push_client]\nenabled = true\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(matches!(Config::from_toml("global = 3"), Err(ConfigError::Parse(_))));
    }
}
