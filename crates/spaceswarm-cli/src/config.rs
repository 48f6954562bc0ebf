//! Configuration file for the `spaceswarm` binary.

use serde::{Deserialize, Serialize};
use spaceswarm_core::{FirewallClass, KeyPair, NodeConfig};
use spaceswarm_dht::BOOTSTRAP_NODES;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Spaceswarm CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Identity
    #[serde(default)]
    pub identity: IdentityConfig,
    /// DHT participation
    #[serde(default)]
    pub network: NetworkConfig,
    /// Peer connections
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Identity configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IdentityConfig {
    /// 32-byte key pair seed (hex); a fresh key pair is generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Primary DHT socket address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Bootstrap entries (`host:port` or `suggestedIP@host:port`)
    #[serde(default = "default_bootstrap")]
    pub bootstrap: Vec<String>,
    /// Extra seed addresses
    #[serde(default)]
    pub known_nodes: Vec<String>,
    /// Stay out of other nodes' routing tables
    #[serde(default)]
    pub ephemeral: bool,
    /// Pinned firewall class (`open`, `consistent`, `random`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firewall: Option<String>,
    /// Serve as a blind relay
    #[serde(default)]
    pub relay: bool,
}

/// Connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Keep-alive interval in milliseconds; 0 disables it
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    /// Seconds `close` waits for ended connections
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_listen_addr() -> String {
    "0.0.0.0:0".to_string()
}

fn default_bootstrap() -> Vec<String> {
    BOOTSTRAP_NODES.iter().map(|s| (*s).to_string()).collect()
}

fn default_keep_alive_ms() -> u64 {
    5000
}

fn default_close_grace_secs() -> u64 {
    2
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap: default_bootstrap(),
            known_nodes: Vec::new(),
            ephemeral: false,
            firewall: None,
            relay: false,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            keep_alive_ms: default_keep_alive_ms(),
            close_grace_secs: default_close_grace_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("spaceswarm/config.toml")
    }

    /// Load `path`, or the defaults when it does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.listen_addr()?;
        self.known_nodes()?;
        self.firewall()?;
        self.key_pair()?;

        for entry in &self.network.bootstrap {
            entry
                .parse::<spaceswarm_dht::BootstrapNode>()
                .map_err(|e| anyhow::anyhow!("Bootstrap node '{}': {}", entry, e))?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }

    /// Parse the listen address
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.network
            .listen_addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid listen address: {}", self.network.listen_addr))
    }

    fn known_nodes(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.network
            .known_nodes
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| anyhow::anyhow!("Invalid known node address: {}", s))
            })
            .collect()
    }

    fn firewall(&self) -> anyhow::Result<Option<FirewallClass>> {
        let Some(name) = &self.network.firewall else {
            return Ok(None);
        };
        match name.to_lowercase().as_str() {
            "open" => Ok(Some(FirewallClass::Open)),
            "consistent" => Ok(Some(FirewallClass::Consistent)),
            "random" => Ok(Some(FirewallClass::Random)),
            other => anyhow::bail!(
                "Invalid firewall class: {}. Must be one of: open, consistent, random",
                other
            ),
        }
    }

    /// Key pair from the configured seed, or a fresh one
    ///
    /// # Errors
    ///
    /// Returns an error if the seed is not 32 bytes of hex.
    pub fn key_pair(&self) -> anyhow::Result<KeyPair> {
        let Some(seed) = &self.identity.seed else {
            return Ok(KeyPair::generate());
        };
        let bytes = hex::decode(seed.trim())?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Identity seed must be 32 bytes"))?;
        Ok(KeyPair::from_seed(seed))
    }

    /// Node configuration for these settings
    ///
    /// # Errors
    ///
    /// Returns an error if an address or the firewall class is invalid.
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let keep_alive = match self.connection.keep_alive_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        Ok(NodeConfig {
            listen_addr: self.listen_addr()?,
            bootstrap: self.network.bootstrap.clone(),
            known_nodes: self.known_nodes()?,
            ephemeral: self.network.ephemeral,
            firewall: self.firewall()?,
            connection_keep_alive: keep_alive,
            relay: self.network.relay,
            close_grace: Duration::from_secs(self.connection.close_grace_secs),
            ..NodeConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.listen_addr, "0.0.0.0:0");
        assert_eq!(config.network.bootstrap.len(), BOOTSTRAP_NODES.len());
        assert_eq!(config.connection.keep_alive_ms, 5000);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "debug".to_string();

        config.network.firewall = Some("porous".to_string());
        assert!(config.validate().is_err());
        config.network.firewall = Some("Consistent".to_string());
        assert!(config.validate().is_ok());

        config.identity.seed = Some("abcd".to_string());
        assert!(config.validate().is_err());
        config.identity.seed = None;

        config.network.bootstrap = vec!["not a node".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [network]
            listen_addr = "127.0.0.1:49737"
            relay = true
            "#,
        )
        .unwrap();
        assert!(config.network.relay);
        assert_eq!(config.network.bootstrap, default_bootstrap());
        assert_eq!(config.connection.keep_alive_ms, 5000);
        assert_eq!(
            config.listen_addr().unwrap(),
            "127.0.0.1:49737".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_node_config_mapping() {
        let mut config = Config::default();
        config.network.firewall = Some("open".to_string());
        config.network.known_nodes = vec!["10.0.0.1:49737".to_string()];
        config.connection.keep_alive_ms = 0;

        let node = config.node_config().unwrap();
        assert_eq!(node.firewall, Some(FirewallClass::Open));
        assert_eq!(node.known_nodes.len(), 1);
        assert_eq!(node.keep_alive(), None);
        assert!(!node.relay);
    }

    #[test]
    fn test_seeded_identity_is_stable() {
        let mut config = Config::default();
        config.identity.seed = Some(hex::encode([7u8; 32]));
        let a = config.key_pair().unwrap();
        let b = config.key_pair().unwrap();
        assert_eq!(a.public_key(), b.public_key());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.network.ephemeral = true;
        config.connection.keep_alive_ms = 1500;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.network.ephemeral);
        assert_eq!(loaded.connection.keep_alive_ms, 1500);
        assert!(loaded.identity.seed.is_none());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.network.listen_addr, "0.0.0.0:0");
    }
}
