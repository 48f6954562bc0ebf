//! Node facade: one DHT node plus servers, clients and an optional relay.

use crate::node::config::NodeConfig;
use crate::node::connect::{ConnectHandle, ConnectOptions, KeyInput};
use crate::node::connection::Connection;
use crate::node::error::{NodeError, Result};
use crate::node::relay::{RelayChannel, RelayClient, RelayService};
use crate::node::server::{Server, ServerInner, ServerOptions};
use crate::node::socket_pool::SocketPool;
use dashmap::DashMap;
use spaceswarm_crypto::{KeyPair, PublicKey};
use spaceswarm_dht::{
    Dht, FirewallClass, FoundPeer, HolepunchSession, LookupReply, MutableGetResult, PeerAddr,
    RelayInfo,
};
use spaceswarm_transport::MuxStream;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

/// Where a node or server can be reached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAddress {
    /// Identity key
    pub public_key: PublicKey,
    /// Public host as observed by other nodes, or the bound host
    pub host: IpAddr,
    /// Port matching `host`
    pub port: u16,
}

pub(crate) struct NodeInner {
    dht: Dht,
    config: NodeConfig,
    key_pair: KeyPair,
    servers: DashMap<PublicKey, Weak<ServerInner>>,
    pool: SocketPool,
    relay_client: RelayClient,
    relay_server: Mutex<Option<Server>>,
    destroyed: watch::Sender<bool>,
    ready: watch::Sender<bool>,
}

/// A peer-to-peer node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Start a node with a fresh key pair.
    ///
    /// # Errors
    /// [`NodeError::InvalidConfig`] or a bind failure.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        Self::with_key_pair(config, KeyPair::generate()).await
    }

    /// Start a node whose servers and clients default to `key_pair`.
    ///
    /// # Errors
    /// [`NodeError::InvalidConfig`] or a bind failure.
    pub async fn with_key_pair(config: NodeConfig, key_pair: KeyPair) -> Result<Self> {
        config.validate()?;
        let dht = Dht::bind(config.listen_addr, key_pair.public_key(), config.dht_config()).await?;
        let (destroyed, _) = watch::channel(false);
        let (ready, _) = watch::channel(!config.relay);
        let node = Self {
            inner: Arc::new(NodeInner {
                dht,
                config,
                key_pair,
                servers: DashMap::new(),
                pool: SocketPool::default(),
                relay_client: RelayClient::default(),
                relay_server: Mutex::new(None),
                destroyed,
                ready,
            }),
        };
        if node.inner.config.relay {
            tokio::spawn(node.clone().start_relay());
        }
        Ok(node)
    }

    async fn start_relay(self) {
        if self.inner.dht.fully_bootstrapped().await.is_err() {
            return;
        }
        let server = self.create_server(ServerOptions::default());
        if let Err(e) = server.listen().await {
            tracing::warn!("relay server failed to listen: {}", e);
            self.inner.ready.send_replace(true);
            return;
        }
        *self.inner.relay_server.lock().unwrap_or_else(|e| e.into_inner()) = Some(server.clone());
        self.inner.ready.send_replace(true);
        tracing::info!("relaying as {}", server.public_key());

        let service = Arc::new(RelayService::default());
        drop(self);
        while let Ok(connection) = server.accept().await {
            tokio::spawn(Arc::clone(&service).serve(connection));
        }
    }

    pub(crate) fn from_inner(inner: Arc<NodeInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<NodeInner> {
        Arc::downgrade(&self.inner)
    }

    // ------------------------------------------------------------------
    // Static helpers
    // ------------------------------------------------------------------

    /// Key pair from `seed`, or a random one
    #[must_use]
    pub fn key_pair(seed: Option<[u8; 32]>) -> KeyPair {
        seed.map_or_else(KeyPair::generate, KeyPair::from_seed)
    }

    /// BLAKE3 digest used for topics and immutable keys
    #[must_use]
    pub fn hash(data: &[u8]) -> [u8; 32] {
        spaceswarm_crypto::hash(data)
    }

    /// Topic a server with `public_key` announces under
    #[must_use]
    pub fn server_target(public_key: &PublicKey) -> [u8; 32] {
        spaceswarm_dht::server_target(public_key)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Default identity key
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.inner.key_pair.public_key()
    }

    /// Default key pair
    #[must_use]
    pub fn default_key_pair(&self) -> &KeyPair {
        &self.inner.key_pair
    }

    /// Public address when observed, otherwise the bound one
    #[must_use]
    pub fn address(&self) -> NodeAddress {
        let addr = self
            .inner
            .dht
            .observed_address()
            .or_else(|| self.inner.dht.local_addr().ok());
        NodeAddress {
            public_key: self.public_key(),
            host: addr.map_or(IpAddr::from([0, 0, 0, 0]), |a| a.ip()),
            port: addr.map_or(0, |a| a.port()),
        }
    }

    /// Current firewall classification
    #[must_use]
    pub fn firewall(&self) -> FirewallClass {
        self.inner.dht.firewall()
    }

    /// Routing table snapshot
    #[must_use]
    pub fn to_array(&self) -> Vec<PeerAddr> {
        self.inner.dht.to_array()
    }

    /// Configuration the node runs with
    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Underlying DHT node
    #[must_use]
    pub fn dht(&self) -> &Dht {
        &self.inner.dht
    }

    /// True after [`destroy`](Self::destroy)
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        *self.inner.destroyed.borrow()
    }

    /// Relay server key, when this node relays
    #[must_use]
    pub fn relay_key(&self) -> Option<PublicKey> {
        self.inner
            .relay_server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(Server::public_key)
    }

    pub(crate) fn destroyed_signal(&self) -> watch::Receiver<bool> {
        self.inner.destroyed.subscribe()
    }

    pub(crate) fn socket_pool(&self) -> &SocketPool {
        &self.inner.pool
    }

    /// Wait for bootstrap, the first firewall probe and relay setup.
    ///
    /// # Errors
    /// [`NodeError::Destroyed`] if the node is destroyed first.
    pub async fn fully_bootstrapped(&self) -> Result<()> {
        self.inner.dht.fully_bootstrapped().await?;
        let mut ready = self.inner.ready.subscribe();
        let mut destroyed = self.destroyed_signal();
        tokio::select! {
            result = ready.wait_for(|r| *r) => result.map(|_| ()).map_err(|_| NodeError::Destroyed),
            _ = destroyed.wait_for(|d| *d) => Err(NodeError::Destroyed),
        }
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(NodeError::Destroyed);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Announce record of a server key.
    ///
    /// # Errors
    /// [`NodeError::InvalidKey`], [`NodeError::NoNodes`] or [`NodeError::Destroyed`].
    pub async fn find_peer(&self, key: impl Into<KeyInput>) -> Result<Option<FoundPeer>> {
        let key = key.into().resolve()?;
        self.check_alive()?;
        Ok(self.inner.dht.find_peer(&key).await?)
    }

    /// Peers announced under `topic`.
    ///
    /// # Errors
    /// [`NodeError::NoNodes`] or [`NodeError::Destroyed`].
    pub async fn lookup(&self, topic: [u8; 32]) -> Result<Vec<LookupReply>> {
        self.check_alive()?;
        Ok(self.inner.dht.lookup(topic).await?)
    }

    /// Announce `key_pair` under `topic`. Returns the storing nodes.
    ///
    /// # Errors
    /// [`NodeError::NoNodes`] or [`NodeError::Destroyed`].
    pub async fn announce(&self, topic: [u8; 32], key_pair: &KeyPair) -> Result<Vec<PeerAddr>> {
        self.check_alive()?;
        Ok(self.inner.dht.announce(topic, key_pair, Vec::new()).await?)
    }

    /// Withdraw an announcement.
    ///
    /// # Errors
    /// [`NodeError::NoNodes`] or [`NodeError::Destroyed`].
    pub async fn unannounce(&self, topic: [u8; 32], key_pair: &KeyPair) -> Result<()> {
        self.check_alive()?;
        Ok(self.inner.dht.unannounce(topic, key_pair).await?)
    }

    /// Store a content-addressed value; returns `hash(value)`.
    ///
    /// # Errors
    /// [`NodeError::ValueTooLarge`], [`NodeError::NoNodes`] or [`NodeError::Destroyed`].
    pub async fn immutable_put(&self, value: &[u8]) -> Result<[u8; 32]> {
        self.check_alive()?;
        Ok(self.inner.dht.immutable_put(value).await?)
    }

    /// Fetch a content-addressed value.
    ///
    /// # Errors
    /// [`NodeError::NoNodes`] or [`NodeError::Destroyed`].
    pub async fn immutable_get(&self, key: [u8; 32]) -> Result<Option<Vec<u8>>> {
        self.check_alive()?;
        Ok(self.inner.dht.immutable_get(key).await?)
    }

    /// Store a signed value under `key_pair` and `salt`.
    ///
    /// # Errors
    /// [`NodeError::SeqTooLow`], [`NodeError::SeqReused`], [`NodeError::ValueTooLarge`],
    /// [`NodeError::NoNodes`] or [`NodeError::Destroyed`].
    pub async fn mutable_put(
        &self,
        key_pair: &KeyPair,
        value: &[u8],
        seq: u64,
        salt: Option<&[u8]>,
    ) -> Result<[u8; 32]> {
        self.check_alive()?;
        Ok(self.inner.dht.mutable_put(key_pair, value, seq, salt).await?)
    }

    /// Newest signed value of `key` with `seq >= min_seq`.
    ///
    /// # Errors
    /// [`NodeError::InvalidKey`], [`NodeError::NoNodes`] or [`NodeError::Destroyed`].
    pub async fn mutable_get(
        &self,
        key: impl Into<KeyInput>,
        salt: Option<&[u8]>,
        min_seq: u64,
    ) -> Result<Option<MutableGetResult>> {
        let key = key.into().resolve()?;
        self.check_alive()?;
        Ok(self.inner.dht.mutable_get(&key, salt, min_seq).await?)
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Start connecting to the server announced by `key`.
    ///
    /// Key validation happens here; everything else runs in the background
    /// and is reported by awaiting the handle.
    ///
    /// # Errors
    /// [`NodeError::InvalidKey`] or [`NodeError::Destroyed`].
    pub fn connect(&self, key: impl Into<KeyInput>, options: ConnectOptions) -> Result<ConnectHandle> {
        let remote = key.into().resolve()?;
        self.check_alive()?;
        Ok(ConnectHandle::spawn(self.clone(), remote, options))
    }

    /// Connect with default options and wait for the connection.
    ///
    /// # Errors
    /// As [`connect`](Self::connect) and the awaited handle.
    pub async fn dial(&self, key: impl Into<KeyInput>) -> Result<Connection> {
        self.connect(key, ConnectOptions::default())?.await
    }

    /// Create a server; call [`Server::listen`] to start it.
    #[must_use]
    pub fn create_server(&self, options: ServerOptions) -> Server {
        Server::new(self, options)
    }

    /// Unconnected reliable stream on the primary socket, for use with
    /// [`Connection::connect_raw_stream`].
    #[must_use]
    pub fn create_raw_stream(&self) -> MuxStream {
        self.inner.dht.socket().create_stream()
    }

    pub(crate) fn register_server(&self, public_key: PublicKey, server: Weak<ServerInner>) -> bool {
        if self.local_server(&public_key).is_some() {
            return false;
        }
        self.inner.servers.insert(public_key, server);
        true
    }

    pub(crate) fn unregister_server(&self, public_key: &PublicKey) {
        self.inner.servers.remove(public_key);
    }

    pub(crate) fn local_server(&self, public_key: &PublicKey) -> Option<Arc<ServerInner>> {
        self.inner
            .servers
            .get(public_key)
            .and_then(|server| server.value().upgrade())
    }

    /// Open a relay channel, connecting to the relay node if needed.
    pub(crate) fn relay_channel(
        &self,
        relay: RelayInfo,
        initiator: bool,
        reusable_socket: bool,
    ) -> Pin<Box<dyn Future<Output = Result<RelayChannel>> + Send + '_>> {
        Box::pin(async move {
            let options = ConnectOptions {
                reusable_socket,
                ..ConnectOptions::default()
            };
            let link = async move {
                let session = HolepunchSession::new();
                crate::node::connect::connect(self, relay.relay_key, options, &session).await
            };
            self.inner
                .relay_client
                .channel(relay.relay_key, relay.token, initiator, link)
                .await
        })
    }

    /// Close every server, drop relay links and stop the DHT node.
    ///
    /// Pending connects fail with [`NodeError::Destroyed`].
    pub async fn destroy(&self) {
        if self.inner.destroyed.send_replace(true) {
            return;
        }
        tracing::debug!("destroying node {}", self.public_key());
        let servers: Vec<Arc<ServerInner>> = self
            .inner
            .servers
            .iter()
            .filter_map(|s| s.value().upgrade())
            .collect();
        self.inner.servers.clear();
        for server in servers {
            server.close(false).await;
        }
        let relay_server = self
            .inner
            .relay_server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(server) = relay_server {
            server.close().await;
        }
        self.inner.relay_client.close().await;
        self.inner.dht.destroy().await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("public_key", &self.public_key())
            .field("dht", &self.inner.dht)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::IntoFuture;
    use std::time::Duration;

    async fn lonely() -> Node {
        Node::new(NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..NodeConfig::with_bootstrap(Vec::new())
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_static_helpers() {
        let a = Node::key_pair(Some([1u8; 32]));
        let b = Node::key_pair(Some([1u8; 32]));
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(Node::key_pair(None).public_key(), a.public_key());
        assert_eq!(Node::hash(b"x"), spaceswarm_crypto::hash(b"x"));
        assert_eq!(
            Node::server_target(&a.public_key()),
            spaceswarm_dht::server_target(&a.public_key())
        );
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = NodeConfig::with_bootstrap(Vec::new());
        config.rpc.k = 0;
        assert!(matches!(Node::new(config).await, Err(NodeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_keys_synchronously() {
        let node = lonely().await;
        assert!(matches!(
            node.connect("wrong-id", ConnectOptions::default()),
            Err(NodeError::InvalidKey(_))
        ));
        assert!(matches!(
            node.connect(None::<PublicKey>, ConnectOptions::default()),
            Err(NodeError::InvalidKey(_))
        ));
        node.destroy().await;
    }

    #[tokio::test]
    async fn test_same_node_connection() {
        let node = lonely().await;
        let server = node.create_server(ServerOptions::default());
        server.listen().await.unwrap();
        assert_eq!(server.public_key(), node.public_key());

        let client = node.dial(server.public_key()).await.unwrap();
        let accepted = server.accept().await.unwrap();
        assert_eq!(client.mode(), crate::node::connection::ConnectionMode::Local);
        assert_eq!(accepted.remote_public_key(), node.public_key());

        client.write(b"hi").await.unwrap();
        assert_eq!(accepted.read().await.unwrap(), Some(b"hi".to_vec()));
        node.destroy().await;
    }

    #[tokio::test]
    async fn test_second_server_for_same_key_refused() {
        let node = lonely().await;
        let first = node.create_server(ServerOptions::default());
        first.listen().await.unwrap();
        let second = node.create_server(ServerOptions::default());
        assert_eq!(second.listen().await, Err(NodeError::ServerClosed));
        first.close().await;
        assert!(!first.is_listening());
        assert!(matches!(first.accept().await, Err(NodeError::ServerClosed)));
        node.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_fails_pending_and_new_work() {
        // A peer that never answers keeps lookups waiting on replies.
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let node = Node::new(NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            known_nodes: vec![silent.local_addr().unwrap()],
            ..NodeConfig::with_bootstrap(Vec::new())
        })
        .await
        .unwrap();

        let stranger = KeyPair::generate().public_key();
        let handle = node.connect(stranger, ConnectOptions::default()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while node.dht().rpc().pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        node.destroy().await;
        let result = tokio::time::timeout(Duration::from_secs(2), handle.into_future())
            .await
            .unwrap();
        assert_eq!(result.err(), Some(NodeError::Destroyed));
        assert_eq!(node.dht().rpc().pending_count(), 0);
        assert_eq!(node.dht().holepuncher().active_sessions(), 0);

        assert!(node.is_destroyed());
        assert!(matches!(
            node.connect(stranger, ConnectOptions::default()),
            Err(NodeError::Destroyed)
        ));
        assert_eq!(node.immutable_get([0u8; 32]).await, Err(NodeError::Destroyed));
        assert_eq!(node.fully_bootstrapped().await, Err(NodeError::Destroyed));
    }

    #[tokio::test]
    async fn test_graceful_close_waits_one_grace_window() {
        let grace = Duration::from_millis(400);
        let node = Node::new(NodeConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            close_grace: grace,
            ..NodeConfig::with_bootstrap(Vec::new())
        })
        .await
        .unwrap();
        let server = node.create_server(ServerOptions::default());
        server.listen().await.unwrap();

        // Clients that never end their side.
        let mut clients = Vec::new();
        let mut accepted = Vec::new();
        for _ in 0..3 {
            clients.push(node.dial(server.public_key()).await.unwrap());
            accepted.push(server.accept().await.unwrap());
        }

        let started = std::time::Instant::now();
        server.close().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= grace);
        assert!(elapsed < grace * 2, "close took {elapsed:?}");
        assert!(accepted.iter().all(Connection::is_closed));
        drop(clients);
        node.destroy().await;
    }
}
