//! DHT runtime.
//!
//! [`Dht`] owns the primary socket, the RPC engine, the record store, the
//! firewall classifier and the holepunch dispatcher. A dispatch task routes
//! inbound datagrams; a maintenance task sweeps the store, refreshes the
//! routing table and re-probes the firewall.
//!
//! Client operations (`find_peer`, `lookup`, `announce`, puts and gets) are
//! iterative queries followed, for writes, by a commit to the closest nodes.
//! [`Dht::connect_peer`] drives the client side of the signaling and
//! holepunch exchange.

use crate::bootstrap::{KNOWN_NODES, default_bootstrap, resolve_all};
use crate::firewall::{DEFAULT_REPROBE_INTERVAL, FirewallClassifier};
use crate::holepunch::{
    ConnectionPolicy, HolepunchConfig, HolepunchError, HolepunchInfo, HolepunchSession,
    HolepunchState, Holepuncher, punch_candidates,
};
use crate::messages::{
    AnnounceRequest, Command, ErrorCode, FirewallClass, HandshakePayload, HolepunchPayload,
    InternalCommand, Message, MessageError, MutablePutRequest, MutableValue, PeerAddr, PeerRecord,
    PunchPhase, RelayInfo, Signal, SignalMode, SignedPayload, UnannounceRequest, decode, encode,
    next_stamp, verify_mutable,
};
use crate::node_id::NodeId;
use crate::query::{Query, QueryResult};
use crate::rpc::{Call, RpcConfig, RpcEngine, RpcError};
use crate::store::{RecordStore, StoreConfig, StoreError, immutable_key, mutable_key};
use async_trait::async_trait;
use dashmap::DashMap;
use spaceswarm_crypto::{KeyPair, PublicKey, Signature};
use spaceswarm_transport::{
    CHANNEL_DHT, CHANNEL_HOLEPUNCH, CHANNEL_NAT_PROBE, Datagram, StreamRegistry, UdpMux,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Announce target of a server key
#[must_use]
pub fn server_target(public_key: &PublicKey) -> [u8; 32] {
    let tag = Command::Announce
        .namespace_tag()
        .copied()
        .unwrap_or_default();
    spaceswarm_crypto::hash::hash_batch(&[tag.as_slice(), public_key.as_bytes().as_slice()])
}

/// DHT settings
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Bootstrap entries (`host:port` or `suggestedIP@host:port`)
    pub bootstrap: Vec<String>,
    /// Seed addresses used in addition to the bootstrap list
    pub known_nodes: Vec<SocketAddr>,
    /// Keep the node id out of messages
    pub ephemeral: bool,
    /// Probe fewer nodes when classifying the firewall
    pub quick_firewall: bool,
    /// Fixed firewall class; skips probing
    pub firewall: Option<FirewallClass>,
    /// RPC and lookup tuning
    pub rpc: RpcConfig,
    /// Record store limits
    pub store: StoreConfig,
    /// Holepunch timing
    pub holepunch: HolepunchConfig,
    /// Interval between firewall re-probes
    pub firewall_probe_interval: Duration,
    /// Failed connects that trigger an early re-probe
    pub failures_before_reprobe: u32,
    /// Interval between routing table refreshes
    pub refresh_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap: default_bootstrap(),
            known_nodes: KNOWN_NODES.to_vec(),
            ephemeral: false,
            quick_firewall: true,
            firewall: None,
            rpc: RpcConfig::default(),
            store: StoreConfig::default(),
            holepunch: HolepunchConfig::default(),
            firewall_probe_interval: DEFAULT_REPROBE_INTERVAL,
            failures_before_reprobe: 3,
            refresh_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Server-side signaling endpoint registered under an announce target
#[async_trait]
pub trait SignalHandler: Send + Sync {
    /// Answer a PEER_HANDSHAKE from a client reported at `peer_address`.
    async fn handshake(
        &self,
        request: SignedPayload,
        peer_address: SocketAddr,
    ) -> Result<SignedPayload, ErrorCode>;

    /// Answer a PEER_HOLEPUNCH from a client reported at `peer_address`.
    async fn holepunch(
        &self,
        request: SignedPayload,
        peer_address: SocketAddr,
    ) -> Result<SignedPayload, ErrorCode>;
}

/// Announce record found for a key, with the nodes that store it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundPeer {
    /// Announced record
    pub record: PeerRecord,
    /// Nodes able to forward signaling to the peer
    pub rendezvous: Vec<SocketAddr>,
}

/// Peers one node returned for a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupReply {
    /// Answering node
    pub from: SocketAddr,
    /// Announced peers
    pub peers: Vec<PeerRecord>,
}

/// Result of a mutable get
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableGetResult {
    /// Sequence number
    pub seq: u64,
    /// Value
    pub value: Vec<u8>,
    /// Record signature
    pub signature: Signature,
    /// Node that returned it
    pub from: SocketAddr,
}

/// Everything the client side of a connect needs
pub struct PeerConnectRequest {
    /// Socket the connection will use
    pub socket: UdpMux,
    /// Client key pair
    pub key_pair: KeyPair,
    /// Server key
    pub remote_public_key: PublicKey,
    /// Client stream id on `socket`
    pub stream_id: u32,
    /// Client relay offer
    pub relay: Option<RelayInfo>,
    /// Client LAN addresses
    pub local_addresses: Vec<SocketAddr>,
    /// Try the server's LAN addresses when both share a public IP
    pub local_connection: bool,
    /// Client hooks
    pub policy: Arc<dyn ConnectionPolicy>,
}

/// Path established by [`Dht::connect_peer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerPath {
    /// Server is reachable as is
    Direct {
        /// Server address
        remote: SocketAddr,
        /// Server stream id
        stream_id: u32,
    },
    /// Path opened by probing
    Holepunched {
        /// Verified server address
        remote: SocketAddr,
        /// Server stream id
        stream_id: u32,
    },
    /// Path over the LAN
    Local {
        /// Server LAN address
        remote: SocketAddr,
        /// Server stream id
        stream_id: u32,
    },
    /// Meet at a relay
    Relayed {
        /// Relay and pairing token
        relay: RelayInfo,
        /// Server stream id
        stream_id: u32,
    },
}

pub(crate) struct DhtInner {
    pub(crate) rpc: Arc<RpcEngine>,
    pub(crate) store: Mutex<RecordStore>,
    pub(crate) firewall: FirewallClassifier,
    pub(crate) holepuncher: Holepuncher,
    pub(crate) servers: DashMap<[u8; 32], Arc<dyn SignalHandler>>,
    pub(crate) config: DhtConfig,
    sink: mpsc::UnboundedSender<Datagram>,
    registry: StreamRegistry,
    sockets: DashMap<u64, UdpMux>,
    bootstrapped: watch::Sender<bool>,
}

/// A running DHT node
#[derive(Clone)]
pub struct Dht {
    pub(crate) inner: Arc<DhtInner>,
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("id", &self.id())
            .field("addr", &self.local_addr().ok())
            .field("firewall", &self.firewall())
            .finish()
    }
}

impl Dht {
    /// Bind the primary socket on `listen` and start the node.
    ///
    /// Bootstrapping runs in the background; await
    /// [`fully_bootstrapped`](Self::fully_bootstrapped) to wait for it.
    ///
    /// # Errors
    /// [`RpcError::Transport`] if the socket cannot be bound.
    pub async fn bind(
        listen: SocketAddr,
        public_key: PublicKey,
        config: DhtConfig,
    ) -> Result<Self, RpcError> {
        let registry = StreamRegistry::new();
        let (sink, inbound) = mpsc::unbounded_channel();
        let mux = UdpMux::bind_shared(listen, sink.clone(), registry.clone())
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let local_id = if config.ephemeral {
            NodeId::random()
        } else {
            NodeId::from_public_key(&public_key)
        };
        let rpc = Arc::new(RpcEngine::new(
            mux,
            local_id,
            config.ephemeral,
            config.rpc.clone(),
        ));
        let (bootstrapped, _) = watch::channel(false);

        let dht = Self {
            inner: Arc::new(DhtInner {
                rpc,
                store: Mutex::new(RecordStore::new(config.store.clone())),
                firewall: FirewallClassifier::new(
                    config.firewall,
                    config.quick_firewall,
                    config.failures_before_reprobe,
                ),
                holepuncher: Holepuncher::new(config.holepunch.clone()),
                servers: DashMap::new(),
                config,
                sink,
                registry,
                sockets: DashMap::new(),
                bootstrapped,
            }),
        };
        tracing::info!(
            "dht node {} listening on {:?}",
            local_id,
            dht.local_addr().ok()
        );

        tokio::spawn(dht.clone().dispatch_loop(inbound));
        tokio::spawn(dht.clone().maintenance_loop());
        tokio::spawn(dht.clone().bootstrap());
        Ok(dht)
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Local node id
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.inner.rpc.local_id()
    }

    /// Bound address of the primary socket
    ///
    /// # Errors
    /// Propagates the socket error.
    pub fn local_addr(&self) -> Result<SocketAddr, RpcError> {
        self.inner
            .rpc
            .mux()
            .local_addr()
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    /// Primary socket
    #[must_use]
    pub fn socket(&self) -> &UdpMux {
        self.inner.rpc.mux()
    }

    /// Stream registry shared by every socket of this node
    #[must_use]
    pub fn registry(&self) -> &StreamRegistry {
        &self.inner.registry
    }

    /// Current firewall class
    #[must_use]
    pub fn firewall(&self) -> FirewallClass {
        self.inner.firewall.current()
    }

    /// Subscribe to firewall class changes
    #[must_use]
    pub fn firewall_watch(&self) -> watch::Receiver<FirewallClass> {
        self.inner.firewall.subscribe()
    }

    /// RPC engine
    #[must_use]
    pub fn rpc(&self) -> &Arc<RpcEngine> {
        &self.inner.rpc
    }

    /// Holepunch dispatcher
    #[must_use]
    pub fn holepuncher(&self) -> &Holepuncher {
        &self.inner.holepuncher
    }

    /// Settings
    #[must_use]
    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    /// Known contacts
    #[must_use]
    pub fn to_array(&self) -> Vec<PeerAddr> {
        self.inner
            .rpc
            .routing()
            .contacts()
            .map(|c| PeerAddr {
                id: c.id,
                addr: c.addr,
            })
            .collect()
    }

    /// Our address as most remote nodes report it
    #[must_use]
    pub fn observed_address(&self) -> Option<SocketAddr> {
        let mut counts: HashMap<SocketAddr, usize> = HashMap::new();
        for (_, observed) in self.inner.rpc.observations() {
            *counts.entry(observed).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(addr, _)| addr)
    }

    /// LAN addresses for `port`
    #[must_use]
    pub fn local_addresses(&self, port: u16) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        if let Ok(bound) = self.local_addr() {
            if !bound.ip().is_unspecified() {
                out.push(SocketAddr::new(bound.ip(), port));
                return out;
            }
        }
        // Connecting a UDP socket sends nothing; it only picks the outbound interface.
        let probe = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|s| s.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).map(|()| s))
            .and_then(|s| s.local_addr());
        if let Ok(addr) = probe {
            let ip: IpAddr = addr.ip();
            if !ip.is_loopback() && !ip.is_unspecified() {
                out.push(SocketAddr::new(ip, port));
            }
        }
        out
    }

    /// True after [`destroy`](Self::destroy)
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.rpc.is_closed()
    }

    pub(crate) fn store(&self) -> MutexGuard<'_, RecordStore> {
        self.inner.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Wait until the first self-lookup and firewall probe have finished.
    ///
    /// # Errors
    /// [`RpcError::Destroyed`] if the node is destroyed first.
    pub async fn fully_bootstrapped(&self) -> Result<(), RpcError> {
        if self.is_destroyed() {
            return Err(RpcError::Destroyed);
        }
        let mut ready = self.inner.bootstrapped.subscribe();
        let mut shutdown = self.inner.rpc.shutdown_signal();
        tokio::select! {
            result = ready.wait_for(|done| *done) => result.map(|_| ()).map_err(|_| RpcError::Destroyed),
            _ = shutdown.wait_for(|closed| *closed) => Err(RpcError::Destroyed),
        }
    }

    /// Bind an extra socket that shares this node's dispatch and stream registry.
    ///
    /// # Errors
    /// [`RpcError::Transport`] if binding fails.
    pub async fn create_socket(&self) -> Result<UdpMux, RpcError> {
        if self.is_destroyed() {
            return Err(RpcError::Destroyed);
        }
        let ip = self.local_addr()?.ip();
        let mux = UdpMux::bind_shared(
            SocketAddr::new(ip, 0),
            self.inner.sink.clone(),
            self.inner.registry.clone(),
        )
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;
        self.inner.sockets.insert(mux.id(), mux.clone());
        Ok(mux)
    }

    /// Close an extra socket created by [`create_socket`](Self::create_socket).
    pub async fn release_socket(&self, id: u64) {
        if let Some((_, mux)) = self.inner.sockets.remove(&id) {
            mux.close().await;
        }
    }

    /// Stop every task, fail in-flight requests and close all sockets.
    pub async fn destroy(&self) {
        if self.is_destroyed() {
            return;
        }
        tracing::debug!("destroying dht node {}", self.id());
        self.inner.rpc.close();
        self.inner.servers.clear();
        let sockets: Vec<UdpMux> = self.inner.sockets.iter().map(|e| e.value().clone()).collect();
        self.inner.sockets.clear();
        for mux in sockets {
            mux.close().await;
        }
        self.inner.rpc.mux().close().await;
    }

    async fn bootstrap(self) {
        let mut seeds = resolve_all(&self.inner.config.bootstrap).await;
        for node in &self.inner.config.known_nodes {
            if !seeds.contains(node) {
                seeds.push(*node);
            }
        }
        if let Ok(own) = self.local_addr() {
            seeds.retain(|s| *s != own);
        }

        if !seeds.is_empty() {
            let call = Call::internal(InternalCommand::FindNode);
            match Query::new(self.inner.rpc.clone(), *self.id().as_bytes(), call, &seeds)
                .run()
                .await
            {
                Ok(result) => tracing::debug!(
                    "bootstrap lookup reached {} nodes",
                    result.closest.len()
                ),
                Err(e) => tracing::warn!("bootstrap lookup failed: {}", e),
            }
            self.probe_firewall(&seeds).await;
        }
        let _ = self.inner.bootstrapped.send(true);
    }

    async fn probe_firewall(&self, fallback: &[SocketAddr]) -> FirewallClass {
        let mut targets: Vec<SocketAddr> = self
            .inner
            .rpc
            .routing()
            .closest(&self.id(), self.inner.config.rpc.k)
            .into_iter()
            .map(|c| c.addr)
            .collect();
        for addr in fallback {
            if !targets.contains(addr) {
                targets.push(*addr);
            }
        }
        self.inner.firewall.probe(&self.inner.rpc, &targets).await
    }

    /// Report a failed connect attempt; enough of them trigger a re-probe.
    pub fn report_connect_failure(&self) {
        if self.inner.firewall.record_failure() {
            let dht = self.clone();
            tokio::spawn(async move {
                dht.probe_firewall(&[]).await;
            });
        }
    }

    /// Report a successful connect
    pub fn report_connect_success(&self) {
        self.inner.firewall.record_success();
    }

    async fn dispatch_loop(self, mut inbound: mpsc::UnboundedReceiver<Datagram>) {
        let mut shutdown = self.inner.rpc.shutdown_signal();
        loop {
            let datagram = tokio::select! {
                () = shut_down(&mut shutdown) => break,
                datagram = inbound.recv() => match datagram {
                    Some(datagram) => datagram,
                    None => break,
                },
            };
            match datagram.channel {
                CHANNEL_DHT => match Message::decode(&datagram.payload) {
                    Ok(Message::Response(response)) => {
                        self.inner.rpc.on_response(response, datagram.from);
                    }
                    Ok(Message::Request(request)) => self.on_request(request, datagram).await,
                    Err(e) => tracing::trace!("bad dht message from {}: {}", datagram.from, e),
                },
                CHANNEL_HOLEPUNCH => self.inner.holepuncher.on_probe(&datagram).await,
                CHANNEL_NAT_PROBE => self
                    .inner
                    .firewall
                    .on_nat_probe(&datagram.payload, datagram.from),
                _ => {}
            }
        }
        tracing::debug!("dht dispatch for {} stopped", self.id());
    }

    async fn maintenance_loop(self) {
        let config = &self.inner.config;
        let mut sweep = tokio::time::interval(config.store.sweep_interval);
        let mut refresh = tokio::time::interval(config.refresh_interval);
        let mut reprobe = tokio::time::interval(config.firewall_probe_interval);
        // First ticks fire immediately; bootstrap covers them.
        sweep.tick().await;
        refresh.tick().await;
        reprobe.tick().await;

        let mut shutdown = self.inner.rpc.shutdown_signal();
        loop {
            tokio::select! {
                () = shut_down(&mut shutdown) => break,
                _ = sweep.tick() => {
                    let removed = self.store().sweep();
                    if removed > 0 {
                        tracing::debug!("expired {} records", removed);
                    }
                }
                _ = refresh.tick() => self.refresh().await,
                _ = reprobe.tick() => {
                    if !self.inner.firewall.is_pinned() {
                        self.probe_firewall(&[]).await;
                    }
                }
            }
        }
    }

    /// Ping the least recently seen contact and look up a random id in the deepest bucket.
    async fn refresh(&self) {
        let (oldest, target) = {
            let table = self.inner.rpc.routing();
            let oldest = table.contacts().min_by_key(|c| c.last_seen).cloned();
            (oldest, self.id().random_at_depth(table.depth()))
        };
        if let Some(contact) = oldest {
            let _ = self
                .inner
                .rpc
                .request(contact.addr, &Call::internal(InternalCommand::Ping))
                .await;
        }
        let call = Call::internal(InternalCommand::FindNode);
        let _ = Query::new(self.inner.rpc.clone(), *target.as_bytes(), call, &[])
            .run()
            .await;
    }

    /// Ping a node.
    ///
    /// # Errors
    /// [`RpcError::Timeout`] if it does not answer.
    pub async fn ping(&self, addr: SocketAddr) -> Result<Option<NodeId>, RpcError> {
        let reply = self
            .inner
            .rpc
            .request(addr, &Call::internal(InternalCommand::Ping))
            .await?;
        Ok(reply.id)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Iterative FIND_NODE towards `target`.
    ///
    /// # Errors
    /// [`RpcError::NoNodes`] or [`RpcError::Destroyed`].
    pub async fn find_node(&self, target: [u8; 32]) -> Result<QueryResult, RpcError> {
        self.query(target, Call::internal(InternalCommand::FindNode))
            .await
    }

    async fn query(&self, target: [u8; 32], call: Call) -> Result<QueryResult, RpcError> {
        if self.is_destroyed() {
            return Err(RpcError::Destroyed);
        }
        Query::new(self.inner.rpc.clone(), target, call, &self.seeds())
            .run()
            .await
    }

    fn seeds(&self) -> Vec<SocketAddr> {
        if !self.inner.rpc.routing().is_empty() {
            return Vec::new();
        }
        // Routing table is empty: fall back to literal bootstrap addresses.
        let mut seeds: Vec<SocketAddr> = self
            .inner
            .config
            .bootstrap
            .iter()
            .filter_map(|entry| entry.parse::<crate::bootstrap::BootstrapNode>().ok())
            .filter_map(|node| {
                node.host
                    .parse::<IpAddr>()
                    .ok()
                    .or(node.suggested_ip)
                    .map(|ip| SocketAddr::new(ip, node.port))
            })
            .collect();
        seeds.extend(self.inner.config.known_nodes.iter().copied());
        seeds
    }

    /// Send `call` with `target` to every node in `nodes`; count the successes.
    async fn commit(&self, nodes: &[PeerAddr], call: Call) -> (usize, Vec<ErrorCode>) {
        let mut tasks = JoinSet::new();
        for node in nodes {
            let rpc = self.inner.rpc.clone();
            let call = call.clone();
            let addr = node.addr;
            tasks.spawn(async move { rpc.request(addr, &call).await });
        }
        let mut stored = 0;
        let mut errors = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(reply)) if reply.error == ErrorCode::None => stored += 1,
                Ok(Ok(reply)) => errors.push(reply.error),
                _ => {}
            }
        }
        (stored, errors)
    }

    /// Find the announce record of a server key.
    ///
    /// # Errors
    /// [`RpcError::NoNodes`] or [`RpcError::Destroyed`].
    pub async fn find_peer(&self, public_key: &PublicKey) -> Result<Option<FoundPeer>, RpcError> {
        let target = server_target(public_key);
        let result = self.query(target, Call::user(Command::FindPeer)).await?;

        let mut found: Option<FoundPeer> = None;
        for (reply, value) in result.values() {
            let Ok(record) = decode::<PeerRecord>(value) else {
                continue;
            };
            if record.public_key != *public_key {
                continue;
            }
            let entry = found.get_or_insert_with(|| FoundPeer {
                record: record.clone(),
                rendezvous: Vec::new(),
            });
            if !entry.rendezvous.contains(&reply.from) {
                entry.rendezvous.push(reply.from);
            }
        }
        if let Some(entry) = &mut found {
            for relay in entry.record.relay_addresses.clone() {
                if !entry.rendezvous.contains(&relay) {
                    entry.rendezvous.push(relay);
                }
            }
        }
        Ok(found)
    }

    /// Peers announced under `topic`, per answering node.
    ///
    /// # Errors
    /// [`RpcError::NoNodes`] or [`RpcError::Destroyed`].
    pub async fn lookup(&self, topic: [u8; 32]) -> Result<Vec<LookupReply>, RpcError> {
        let result = self.query(topic, Call::user(Command::Lookup)).await?;
        Ok(result
            .values()
            .filter_map(|(reply, value)| {
                decode::<Vec<PeerRecord>>(value)
                    .ok()
                    .filter(|peers| !peers.is_empty())
                    .map(|peers| LookupReply {
                        from: reply.from,
                        peers,
                    })
            })
            .collect())
    }

    /// Announce `key_pair` under `topic` on the closest nodes. Returns those nodes.
    ///
    /// # Errors
    /// [`RpcError::NoNodes`] if nobody could be reached.
    pub async fn announce(
        &self,
        topic: [u8; 32],
        key_pair: &KeyPair,
        relay_addresses: Vec<SocketAddr>,
    ) -> Result<Vec<PeerAddr>, RpcError> {
        let result = self.query(topic, Call::user(Command::Lookup)).await?;
        let record = PeerRecord {
            public_key: key_pair.public_key(),
            relay_addresses,
        };
        let announce = AnnounceRequest::sign(key_pair, &topic, record, next_stamp()).map_err(encode_error)?;
        let value = encode(&announce).map_err(encode_error)?;
        let call = Call::user(Command::Announce)
            .with_target(topic)
            .with_value(value);
        let (stored, _) = self.commit(&result.closest, call).await;
        tracing::debug!(
            "announced {} on {} nodes",
            hex::encode(&topic[..8]),
            stored
        );
        if stored == 0 {
            return Err(RpcError::NoNodes);
        }
        Ok(result.closest)
    }

    /// Remove `key_pair`'s announcement under `topic`.
    ///
    /// # Errors
    /// [`RpcError::NoNodes`] or [`RpcError::Destroyed`].
    pub async fn unannounce(&self, topic: [u8; 32], key_pair: &KeyPair) -> Result<(), RpcError> {
        let result = self.query(topic, Call::user(Command::Lookup)).await?;
        let request = UnannounceRequest::sign(key_pair, &topic, next_stamp()).map_err(encode_error)?;
        let value = encode(&request).map_err(encode_error)?;
        let call = Call::user(Command::Unannounce)
            .with_target(topic)
            .with_value(value);
        self.commit(&result.closest, call).await;
        Ok(())
    }

    /// Store a content-addressed value. Returns its key.
    ///
    /// # Errors
    /// [`RpcError::Store`] for an oversized value, [`RpcError::NoNodes`] if nothing stored it.
    pub async fn immutable_put(&self, value: &[u8]) -> Result<[u8; 32], RpcError> {
        self.check_value_size(value.len())?;
        let key = immutable_key(value);
        let result = self.query(key, Call::user(Command::ImmutableGet)).await?;
        let call = Call::user(Command::ImmutablePut)
            .with_target(key)
            .with_value(value.to_vec());
        let (stored, _) = self.commit(&result.closest, call).await;
        if stored == 0 {
            return Err(RpcError::NoNodes);
        }
        Ok(key)
    }

    /// Fetch a content-addressed value, verifying it against the key.
    ///
    /// # Errors
    /// [`RpcError::NoNodes`] or [`RpcError::Destroyed`].
    pub async fn immutable_get(&self, key: [u8; 32]) -> Result<Option<Vec<u8>>, RpcError> {
        let result = self.query(key, Call::user(Command::ImmutableGet)).await?;
        Ok(result
            .values()
            .map(|(_, value)| value)
            .find(|value| immutable_key(value) == key)
            .map(<[u8]>::to_vec))
    }

    /// Store a signed mutable value. Returns its key.
    ///
    /// # Errors
    /// - [`RpcError::Remote`] with `SeqTooLow` / `SeqReused` if every node refused
    /// - [`RpcError::Store`] for an oversized value
    /// - [`RpcError::NoNodes`] if nobody could be reached
    pub async fn mutable_put(
        &self,
        key_pair: &KeyPair,
        value: &[u8],
        seq: u64,
        salt: Option<&[u8]>,
    ) -> Result<[u8; 32], RpcError> {
        self.check_value_size(value.len())?;
        let key = mutable_key(&key_pair.public_key(), salt);
        let result = self
            .query(
                key,
                Call::user(Command::MutableGet).with_value(encode(&0u64).map_err(encode_error)?),
            )
            .await?;
        let put = MutablePutRequest::sign(key_pair, seq, value.to_vec(), salt.map(<[u8]>::to_vec))
            .map_err(encode_error)?;
        let call = Call::user(Command::MutablePut)
            .with_target(key)
            .with_value(encode(&put).map_err(encode_error)?);
        let (stored, errors) = self.commit(&result.closest, call).await;
        if stored > 0 {
            return Ok(key);
        }
        match errors.into_iter().find(|e| *e != ErrorCode::None) {
            Some(code) => Err(RpcError::Remote(code)),
            None => Err(RpcError::NoNodes),
        }
    }

    /// Fetch the newest mutable value with `seq >= min_seq`.
    ///
    /// # Errors
    /// [`RpcError::NoNodes`] or [`RpcError::Destroyed`].
    pub async fn mutable_get(
        &self,
        public_key: &PublicKey,
        salt: Option<&[u8]>,
        min_seq: u64,
    ) -> Result<Option<MutableGetResult>, RpcError> {
        let key = mutable_key(public_key, salt);
        let call = Call::user(Command::MutableGet).with_value(encode(&min_seq).map_err(encode_error)?);
        let result = self.query(key, call).await?;

        let mut best: Option<MutableGetResult> = None;
        for (reply, value) in result.values() {
            let Ok(record) = decode::<MutableValue>(value) else {
                continue;
            };
            if record.seq < min_seq
                || verify_mutable(public_key, record.seq, salt, &record.value, &record.signature)
                    .is_err()
            {
                continue;
            }
            if best.as_ref().is_none_or(|b| record.seq > b.seq) {
                best = Some(MutableGetResult {
                    seq: record.seq,
                    value: record.value,
                    signature: record.signature,
                    from: reply.from,
                });
            }
        }
        Ok(best)
    }

    fn check_value_size(&self, size: usize) -> Result<(), RpcError> {
        let max = self.inner.config.store.max_value_size;
        if size > max {
            return Err(StoreError::ValueTooLarge { size, max }.into());
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Servers and signaling
    // ------------------------------------------------------------------

    /// Route signaling for `target` to `handler`.
    pub fn register_server(&self, target: [u8; 32], handler: Arc<dyn SignalHandler>) {
        self.inner.servers.insert(target, handler);
    }

    /// Stop routing signaling for `target`.
    pub fn unregister_server(&self, target: &[u8; 32]) {
        self.inner.servers.remove(target);
    }

    /// True if a server for `target` runs on this node
    #[must_use]
    pub fn has_server(&self, target: &[u8; 32]) -> bool {
        self.inner.servers.contains_key(target)
    }

    /// Drive the client side of a connect: signal through a rendezvous node,
    /// punch if needed and fall back to a relay when punching fails.
    ///
    /// # Errors
    /// See [`HolepunchError`]. A policy refusal on either side yields
    /// [`HolepunchError::Aborted`] and never falls back to a relay.
    pub async fn connect_peer(
        &self,
        request: PeerConnectRequest,
        session: &HolepunchSession,
    ) -> Result<PeerPath, HolepunchError> {
        let result = self.drive_connect(request, session).await;
        match &result {
            Ok(_) => self.report_connect_success(),
            Err(e) => {
                tracing::debug!("connect attempt {:08x} failed: {}", session.id(), e);
                session.transition(HolepunchState::Failed);
                if !matches!(e, HolepunchError::Aborted) {
                    self.report_connect_failure();
                }
            }
        }
        result
    }

    async fn drive_connect(
        &self,
        request: PeerConnectRequest,
        session: &HolepunchSession,
    ) -> Result<PeerPath, HolepunchError> {
        let server_key = request.remote_public_key;
        let target = server_target(&server_key);
        let found = self
            .find_peer(&server_key)
            .await?
            .ok_or(HolepunchError::PeerNotFound)?;

        session.transition(HolepunchState::Signaling);
        let local_firewall = self.firewall();
        let hello = HandshakePayload {
            target_key: server_key,
            firewall: local_firewall,
            addresses: request.local_addresses.clone(),
            stream_id: request.stream_id,
            session: session.id(),
            relay: request.relay,
            error: ErrorCode::None,
        };
        let signed = SignedPayload::sign(&request.key_pair, Command::PeerHandshake, &hello)
            .map_err(invalid_reply)?;

        let mut outcome = None;
        let mut last_error = HolepunchError::PeerNotFound;
        for rendezvous in &found.rendezvous {
            match self
                .signal(&request.socket, *rendezvous, Command::PeerHandshake, target, &signed)
                .await
            {
                Ok(reply) => {
                    outcome = Some((*rendezvous, reply));
                    break;
                }
                Err(HolepunchError::Aborted) => return Err(HolepunchError::Aborted),
                Err(e) => {
                    tracing::debug!("rendezvous {} could not signal: {}", rendezvous, e);
                    last_error = e;
                }
            }
        }
        let Some((rendezvous, (reply_signal, reply_from))) = outcome else {
            return Err(last_error);
        };
        let server: HandshakePayload = open_from(&reply_signal, &server_key, Command::PeerHandshake)?;
        if server.error != ErrorCode::None {
            return Err(rejected(server.error));
        }
        let server_addr = reply_signal.peer_address.unwrap_or(reply_from);

        if server.firewall == FirewallClass::Open {
            session.transition(HolepunchState::Connected {
                remote: server_addr,
            });
            return Ok(PeerPath::Direct {
                remote: server_addr,
                stream_id: server.stream_id,
            });
        }

        let config = self.inner.holepuncher.config().clone();
        let mut probes = self.inner.holepuncher.open_session(session.id());

        let same_network = self
            .observed_address()
            .is_some_and(|ours| ours.ip() == server_addr.ip());
        if request.local_connection && same_network && !server.addresses.is_empty() {
            if let Some(remote) = probes.punch(&request.socket, &server.addresses, &config).await {
                session.transition(HolepunchState::Connected { remote });
                return Ok(PeerPath::Local {
                    remote,
                    stream_id: server.stream_id,
                });
            }
        }

        let mut remote_addresses = vec![server_addr];
        remote_addresses.extend(server.addresses.iter().copied());
        let info = HolepunchInfo {
            remote_public_key: server_key,
            remote_firewall: server.firewall,
            local_firewall,
            remote_addresses,
        };
        if !request.policy.holepunch(&info) {
            let _ = self
                .punch_signal(&request, rendezvous, target, session, 0, PunchPhase::Abort)
                .await;
            return Err(HolepunchError::Aborted);
        }

        for round in 0..config.max_rounds {
            session.transition(HolepunchState::Punching { round });
            let answer = self
                .punch_signal(&request, rendezvous, target, session, round, PunchPhase::Punch)
                .await?;
            let candidates = punch_candidates(server_addr, answer.firewall, round, &config);
            if let Some(remote) = probes.punch(&request.socket, &candidates, &config).await {
                session.transition(HolepunchState::Connected { remote });
                return Ok(PeerPath::Holepunched {
                    remote,
                    stream_id: server.stream_id,
                });
            }
        }

        let Some(relay) = request.relay.or(server.relay) else {
            return Err(HolepunchError::Failed);
        };
        self.punch_signal(
            &request,
            rendezvous,
            target,
            session,
            config.max_rounds,
            PunchPhase::Relay,
        )
        .await?;
        session.transition(HolepunchState::Relaying);
        Ok(PeerPath::Relayed {
            relay,
            stream_id: server.stream_id,
        })
    }

    async fn punch_signal(
        &self,
        request: &PeerConnectRequest,
        rendezvous: SocketAddr,
        target: [u8; 32],
        session: &HolepunchSession,
        round: u32,
        phase: PunchPhase,
    ) -> Result<HolepunchPayload, HolepunchError> {
        let body = HolepunchPayload {
            session: session.id(),
            round,
            phase,
            firewall: self.firewall(),
            addresses: request.local_addresses.clone(),
            error: ErrorCode::None,
        };
        let signed = SignedPayload::sign(&request.key_pair, Command::PeerHolepunch, &body)
            .map_err(invalid_reply)?;
        let (signal, _) = self
            .signal(&request.socket, rendezvous, Command::PeerHolepunch, target, &signed)
            .await?;
        let answer: HolepunchPayload =
            open_from(&signal, &request.remote_public_key, Command::PeerHolepunch)?;
        if answer.error != ErrorCode::None {
            return Err(rejected(answer.error));
        }
        Ok(answer)
    }

    /// Send one signaling message through `rendezvous` and return the reply envelope.
    async fn signal(
        &self,
        socket: &UdpMux,
        rendezvous: SocketAddr,
        command: Command,
        target: [u8; 32],
        signed: &SignedPayload,
    ) -> Result<(Signal, SocketAddr), HolepunchError> {
        let envelope = Signal {
            mode: SignalMode::FromClient,
            peer_address: None,
            signed: signed.clone(),
        };
        let call = Call::user(command)
            .with_target(target)
            .with_value(encode(&envelope).map_err(invalid_reply)?);
        // Forwarding adds a hop and the server's own work, so allow more time.
        let timeout = self.inner.config.rpc.timeout * 4;
        let reply = match self
            .inner
            .rpc
            .request_once(socket, rendezvous, &call, timeout)
            .await
        {
            Err(RpcError::Timeout) => {
                self.inner
                    .rpc
                    .request_once(socket, rendezvous, &call, timeout * 2)
                    .await?
            }
            other => other?,
        };
        if reply.error != ErrorCode::None {
            return Err(rejected(reply.error));
        }
        let value = reply
            .value
            .ok_or_else(|| HolepunchError::InvalidReply("empty reply".into()))?;
        let signal: Signal = decode(&value).map_err(invalid_reply)?;
        if signal.mode != SignalMode::Reply {
            return Err(HolepunchError::InvalidReply(format!("unexpected mode {:?}", signal.mode)));
        }
        Ok((signal, reply.from))
    }
}

fn open_from<T: serde::de::DeserializeOwned>(
    signal: &Signal,
    expected: &PublicKey,
    command: Command,
) -> Result<T, HolepunchError> {
    if signal.signed.public_key != *expected {
        return Err(HolepunchError::InvalidReply("reply signed by another key".into()));
    }
    signal.signed.open(command).map_err(invalid_reply)
}

fn rejected(code: ErrorCode) -> HolepunchError {
    match code {
        ErrorCode::Aborted => HolepunchError::Aborted,
        other => HolepunchError::Rejected(other),
    }
}

fn invalid_reply(e: MessageError) -> HolepunchError {
    HolepunchError::InvalidReply(e.to_string())
}

fn encode_error(e: MessageError) -> RpcError {
    RpcError::Encode(e.to_string())
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn shut_down(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_: &T) {}

    fn local_config(bootstrap: Vec<SocketAddr>) -> DhtConfig {
        DhtConfig {
            bootstrap: bootstrap.iter().map(ToString::to_string).collect(),
            rpc: RpcConfig {
                timeout: Duration::from_millis(200),
                ..RpcConfig::default()
            },
            ..DhtConfig::default()
        }
    }

    async fn node(bootstrap: Vec<SocketAddr>) -> (Dht, KeyPair) {
        let kp = KeyPair::generate();
        let dht = Dht::bind("127.0.0.1:0".parse().unwrap(), kp.public_key(), local_config(bootstrap))
            .await
            .unwrap();
        dht.fully_bootstrapped().await.unwrap();
        (dht, kp)
    }

    async fn swarm(size: usize) -> (Dht, Vec<(Dht, KeyPair)>) {
        let (boot, _) = node(vec![]).await;
        let addr = boot.local_addr().unwrap();
        let mut nodes = Vec::new();
        for _ in 0..size {
            nodes.push(node(vec![addr]).await);
        }
        (boot, nodes)
    }

    #[test]
    fn test_server_target_is_namespaced() {
        let pk = KeyPair::from_seed([1u8; 32]).public_key();
        assert_ne!(server_target(&pk), spaceswarm_crypto::hash(pk.as_bytes()));
        assert_eq!(server_target(&pk), server_target(&pk));
    }

    #[tokio::test]
    async fn test_background_loops_are_send_and_stop_on_destroy() {
        let (dht, _) = node(vec![]).await;
        let (_mux, inbound) = UdpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let maintenance = dht.clone().maintenance_loop();
        let dispatch = dht.clone().dispatch_loop(inbound);
        assert_send(&maintenance);
        assert_send(&dispatch);

        let maintenance = tokio::spawn(maintenance);
        let dispatch = tokio::spawn(dispatch);
        dht.destroy().await;
        tokio::time::timeout(Duration::from_secs(2), maintenance)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), dispatch)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_fills_routing_tables() {
        let (boot, nodes) = swarm(4).await;
        for (dht, _) in &nodes {
            assert!(!dht.to_array().is_empty());
            assert_eq!(dht.firewall(), FirewallClass::Open);
        }
        assert!(boot.to_array().len() >= 4);
    }

    #[tokio::test]
    async fn test_immutable_roundtrip() {
        let (_boot, nodes) = swarm(3).await;
        let key = nodes[0].0.immutable_put(b"testing").await.unwrap();
        assert_eq!(key, spaceswarm_crypto::hash(b"testing"));
        let value = nodes[2].0.immutable_get(key).await.unwrap();
        assert_eq!(value.as_deref(), Some(b"testing".as_slice()));
    }

    #[tokio::test]
    async fn test_mutable_roundtrip_and_seq_errors() {
        let (_boot, nodes) = swarm(3).await;
        let (writer, kp) = &nodes[0];
        writer.mutable_put(kp, b"one", 1, None).await.unwrap();
        writer.mutable_put(kp, b"two", 2, None).await.unwrap();

        let got = nodes[1].0.mutable_get(&kp.public_key(), None, 0).await.unwrap().unwrap();
        assert_eq!((got.seq, got.value.as_slice()), (2, b"two".as_slice()));

        assert_eq!(
            writer.mutable_put(kp, b"old", 1, None).await,
            Err(RpcError::Remote(ErrorCode::SeqTooLow))
        );
        assert_eq!(
            writer.mutable_put(kp, b"other", 2, None).await,
            Err(RpcError::Remote(ErrorCode::SeqReused))
        );
        assert!(nodes[1].0.mutable_get(&kp.public_key(), None, 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_value_rejected_locally() {
        let (_boot, nodes) = swarm(1).await;
        let err = nodes[0].0.immutable_put(&[0u8; 2000]).await.unwrap_err();
        assert!(matches!(err, RpcError::Store(StoreError::ValueTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_announce_lookup_unannounce() {
        let (_boot, nodes) = swarm(3).await;
        let topic = spaceswarm_crypto::hash(b"topic");
        let (announcer, kp) = &nodes[0];
        announcer.announce(topic, kp, vec![]).await.unwrap();

        let replies = nodes[2].0.lookup(topic).await.unwrap();
        assert!(!replies.is_empty());
        assert!(replies.iter().all(|r| r.peers[0].public_key == kp.public_key()));

        announcer.unannounce(topic, kp).await.unwrap();
        assert!(nodes[2].0.lookup(topic).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_peer_reports_rendezvous() {
        let (_boot, nodes) = swarm(3).await;
        let (server, kp) = &nodes[0];
        server
            .announce(server_target(&kp.public_key()), kp, vec![])
            .await
            .unwrap();
        let found = nodes[1].0.find_peer(&kp.public_key()).await.unwrap().unwrap();
        assert_eq!(found.record.public_key, kp.public_key());
        assert!(!found.rendezvous.is_empty());

        let missing = KeyPair::generate().public_key();
        assert!(nodes[1].0.find_peer(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lonely_node_has_no_nodes() {
        let (dht, _) = node(vec![]).await;
        assert_eq!(dht.lookup([1u8; 32]).await, Err(RpcError::NoNodes));
    }

    #[tokio::test]
    async fn test_destroy_fails_queries() {
        let (_boot, nodes) = swarm(1).await;
        let dht = &nodes[0].0;
        dht.destroy().await;
        assert!(dht.is_destroyed());
        assert_eq!(dht.lookup([1u8; 32]).await, Err(RpcError::Destroyed));
        assert_eq!(dht.fully_bootstrapped().await, Err(RpcError::Destroyed));
    }

    #[tokio::test]
    async fn test_ephemeral_node_stays_out_of_tables() {
        let (boot, _) = node(vec![]).await;
        let kp = KeyPair::generate();
        let config = DhtConfig {
            ephemeral: true,
            ..local_config(vec![boot.local_addr().unwrap()])
        };
        let ephemeral = Dht::bind("127.0.0.1:0".parse().unwrap(), kp.public_key(), config)
            .await
            .unwrap();
        ephemeral.fully_bootstrapped().await.unwrap();
        assert!(!ephemeral.to_array().is_empty());
        assert!(boot.to_array().iter().all(|c| c.id != ephemeral.id()));
    }

    #[tokio::test]
    async fn test_pinned_firewall() {
        let (boot, _) = node(vec![]).await;
        let kp = KeyPair::generate();
        let config = DhtConfig {
            firewall: Some(FirewallClass::Consistent),
            ..local_config(vec![boot.local_addr().unwrap()])
        };
        let dht = Dht::bind("127.0.0.1:0".parse().unwrap(), kp.public_key(), config)
            .await
            .unwrap();
        dht.fully_bootstrapped().await.unwrap();
        assert_eq!(dht.firewall(), FirewallClass::Consistent);
    }
}
