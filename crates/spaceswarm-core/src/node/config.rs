//! Node configuration

use crate::node::error::{NodeError, Result};
use spaceswarm_dht::bootstrap::default_bootstrap;
use spaceswarm_dht::firewall::DEFAULT_REPROBE_INTERVAL;
use spaceswarm_dht::{
    DhtConfig, FirewallClass, HolepunchConfig, KNOWN_NODES, RpcConfig, StoreConfig,
};
use std::net::SocketAddr;
use std::time::Duration;

/// Default connection keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_millis(5000);

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address of the primary DHT socket
    pub listen_addr: SocketAddr,

    /// Bootstrap entries (`host:port` or `suggestedIP@host:port`)
    pub bootstrap: Vec<String>,

    /// Extra seed addresses
    pub known_nodes: Vec<SocketAddr>,

    /// Keep the node id out of DHT messages
    pub ephemeral: bool,

    /// Probe fewer nodes when classifying the firewall
    pub quick_firewall: bool,

    /// Fixed firewall class; disables probing
    pub firewall: Option<FirewallClass>,

    /// Keep-alive interval for connections; `None` or zero disables it
    pub connection_keep_alive: Option<Duration>,

    /// RPC and lookup tuning
    pub rpc: RpcConfig,

    /// Holepunch timing
    pub holepunch: HolepunchConfig,

    /// Record store limits
    pub store: StoreConfig,

    /// Interval between firewall re-probes
    pub firewall_probe_interval: Duration,

    /// Failed connects that trigger an early re-probe
    pub failures_before_reprobe: u32,

    /// Serve as a blind relay for other peers
    pub relay: bool,

    /// How long `close` waits for ended connections to drain
    pub close_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            bootstrap: default_bootstrap(),
            known_nodes: KNOWN_NODES.to_vec(),
            ephemeral: false,
            quick_firewall: true,
            firewall: None,
            connection_keep_alive: Some(DEFAULT_KEEP_ALIVE),
            rpc: RpcConfig::default(),
            holepunch: HolepunchConfig::default(),
            store: StoreConfig::default(),
            firewall_probe_interval: DEFAULT_REPROBE_INTERVAL,
            failures_before_reprobe: 3,
            relay: false,
            close_grace: Duration::from_secs(2),
        }
    }
}

impl NodeConfig {
    /// Configuration for a node on a private network seeded by `bootstrap`
    #[must_use]
    pub fn with_bootstrap(bootstrap: Vec<String>) -> Self {
        Self {
            bootstrap,
            ..Self::default()
        }
    }

    /// Reject settings no node can run with.
    ///
    /// # Errors
    /// [`NodeError::InvalidConfig`] naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.rpc.k == 0 {
            return Err(NodeError::invalid_config("k must be at least 1"));
        }
        if self.rpc.alpha == 0 {
            return Err(NodeError::invalid_config("alpha must be at least 1"));
        }
        if self.rpc.timeout.is_zero() {
            return Err(NodeError::invalid_config("rpc timeout must be non-zero"));
        }
        if self.holepunch.round_window.is_zero() {
            return Err(NodeError::invalid_config("holepunch round window must be non-zero"));
        }
        if self.store.max_value_size == 0 {
            return Err(NodeError::invalid_config("max value size must be non-zero"));
        }
        for entry in &self.bootstrap {
            entry
                .parse::<spaceswarm_dht::BootstrapNode>()
                .map_err(|e| NodeError::InvalidConfig(e.to_string().into()))?;
        }
        Ok(())
    }

    /// Effective keep-alive interval
    #[must_use]
    pub fn keep_alive(&self) -> Option<Duration> {
        self.connection_keep_alive.filter(|d| !d.is_zero())
    }

    pub(crate) fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            bootstrap: self.bootstrap.clone(),
            known_nodes: self.known_nodes.clone(),
            ephemeral: self.ephemeral,
            quick_firewall: self.quick_firewall,
            firewall: self.firewall,
            rpc: self.rpc.clone(),
            store: self.store.clone(),
            holepunch: self.holepunch.clone(),
            firewall_probe_interval: self.firewall_probe_interval,
            failures_before_reprobe: self.failures_before_reprobe,
            ..DhtConfig::default()
        }
    }
}
