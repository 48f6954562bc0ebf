//! Shared fixtures for Spaceswarm integration tests.
//!
//! [`Testnet`] runs a private swarm on `127.0.0.1`: one bootstrap node with
//! its firewall pinned open, plus any number of nodes seeded by it.

use spaceswarm_core::{FirewallClass, Node, NodeConfig};
use spaceswarm_dht::RpcConfig;
use std::time::Duration;

/// RPC timeout used by every testnet node
pub const TEST_RPC_TIMEOUT: Duration = Duration::from_millis(300);

/// A private swarm on the loopback interface
pub struct Testnet {
    /// Bootstrap node
    pub bootstrap: Node,
    /// Nodes seeded by `bootstrap`
    pub nodes: Vec<Node>,
}

impl Testnet {
    /// Start a bootstrap node and `size` nodes, all fully bootstrapped.
    pub async fn new(size: usize) -> Self {
        Self::with_config(size, |_| {}).await
    }

    /// Like [`new`](Self::new), with `tweak` applied to each node's config.
    pub async fn with_config(size: usize, tweak: impl Fn(&mut NodeConfig)) -> Self {
        let bootstrap = Node::new(NodeConfig {
            firewall: Some(FirewallClass::Open),
            ..base_config(Vec::new())
        })
        .await
        .expect("bootstrap node");
        bootstrap.fully_bootstrapped().await.expect("bootstrap ready");

        let mut testnet = Self {
            bootstrap,
            nodes: Vec::new(),
        };
        for _ in 0..size {
            let mut config = testnet.config();
            tweak(&mut config);
            testnet.spawn(config).await;
        }
        testnet
    }

    /// Bootstrap entries pointing at this testnet
    pub fn bootstrap_entries(&self) -> Vec<String> {
        vec![format!("127.0.0.1:{}", self.bootstrap.address().port)]
    }

    /// Default config for a node joining this testnet
    pub fn config(&self) -> NodeConfig {
        base_config(self.bootstrap_entries())
    }

    /// Start a node with `config`, add it to the testnet and return it.
    pub async fn spawn(&mut self, config: NodeConfig) -> Node {
        let node = Node::new(config).await.expect("testnet node");
        node.fully_bootstrapped().await.expect("testnet node ready");
        self.nodes.push(node.clone());
        node
    }

    /// Destroy every node.
    pub async fn destroy(self) {
        for node in &self.nodes {
            node.destroy().await;
        }
        self.bootstrap.destroy().await;
    }
}

fn base_config(bootstrap: Vec<String>) -> NodeConfig {
    NodeConfig {
        listen_addr: "127.0.0.1:0".parse().expect("loopback address"),
        bootstrap,
        known_nodes: Vec::new(),
        rpc: RpcConfig {
            timeout: TEST_RPC_TIMEOUT,
            ..RpcConfig::default()
        },
        close_grace: Duration::from_millis(100),
        ..NodeConfig::default()
    }
}
