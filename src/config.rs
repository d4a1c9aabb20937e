//! Configuration management for quidnode

use crate::currency::Currency;
use crate::error::{NodeError, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub network: NetConfig,
    #[serde(default)]
    pub currency: Currency,
}

/// Which backend a wallet talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    #[default]
    Remote,
    #[serde(alias = "in-process", alias = "inprocess")]
    Local,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeSettings {
    #[serde(default)]
    pub mode: NodeMode,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_host")]
    pub host: String,
    #[serde(default = "default_rpc_port")]
    pub port: u16,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: default_remote_host(),
            port: default_rpc_port(),
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl RemoteConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Refuse blocks contradicting the compiled-in checkpoints.
    #[serde(default = "default_true")]
    pub enforce_checkpoints: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            enforce_checkpoints: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_network_id")]
    pub network_id: String,
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            network_id: default_network_id(),
            seeds: Vec::new(),
            max_peers: default_max_peers(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl NetConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| NodeError::ConfigError(format!("network.listen \"{}\": {}", self.listen, e)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            remote: RemoteConfig::default(),
            core: CoreConfig::default(),
            network: NetConfig::default(),
            currency: Currency::default(),
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote.host.is_empty() {
            return Err(NodeError::ConfigError("remote.host must be set".to_string()));
        }
        if self.remote.port == 0 {
            return Err(NodeError::ConfigError("remote.port must be non-zero".to_string()));
        }
        if self.remote.poll_interval_secs == 0 {
            return Err(NodeError::ConfigError(
                "remote.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.core.data_dir.as_os_str().is_empty() {
            return Err(NodeError::ConfigError("core.data_dir must be set".to_string()));
        }
        if self.network.max_peers == 0 {
            return Err(NodeError::ConfigError("network.max_peers must be at least 1".to_string()));
        }
        self.network.listen_addr()?;
        Ok(())
    }
}

/// Load `config.toml` from the working directory, falling back to defaults
/// when the file is absent.
pub fn load_config() -> Result<Config> {
    let path = Path::new(DEFAULT_CONFIG_PATH);
    if !path.exists() {
        return Ok(Config::default());
    }
    load_config_from(path)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    let text = fs::read_to_string(path)
        .map_err(|e| NodeError::ConfigError(format!("{}: {}", path.display(), e)))?;
    Config::from_toml(&text)
}

fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rpc_port() -> u16 {
    16000
}

fn default_poll_interval() -> u64 {
    5
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_true() -> bool {
    true
}

fn default_listen() -> String {
    "0.0.0.0:16001".to_string()
}

fn default_network_id() -> String {
    "quid-mainnet".to_string()
}

fn default_max_peers() -> usize {
    8
}

fn default_connect_timeout() -> u64 {
    5
}
