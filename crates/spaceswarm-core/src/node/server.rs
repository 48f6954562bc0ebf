//! Servers: announce a key pair and accept encrypted connections.
//!
//! A listening server announces itself under its server target and answers
//! signaling forwarded by rendezvous nodes. Each accepted handshake reserves
//! a stream on the node's primary socket, starts answering holepunch probes
//! and waits for the client's Noise handshake on that stream (or on a relay
//! channel when the client falls back to one).

use crate::node::connection::{Connection, ConnectionMode, WeakConnection};
use crate::node::error::{NodeError, Result};
use crate::node::node::{Node, NodeAddress, NodeInner};
use crate::secret_stream::SecretStream;
use async_trait::async_trait;
use dashmap::DashMap;
use spaceswarm_crypto::{KeyPair, PublicKey};
use spaceswarm_dht::holepunch::{ProbeSession, punch_candidates};
use spaceswarm_dht::{
    AllowAll, Command, ConnectionPolicy, ErrorCode, FirewallClass, HandshakePayload,
    HolepunchInfo, HolepunchPayload, PunchPhase, RelayInfo, SignalHandler, SignedPayload,
    server_target,
};
use spaceswarm_transport::RawStream;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

/// Time a client gets to finish the encrypted handshake after signaling
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Nodes from the previous announce advertised as signaling relays
const MAX_RELAY_ADDRESSES: usize = 3;

/// Server settings
#[derive(Clone)]
pub struct ServerOptions {
    /// Key pair to serve; the node's default key pair when `None`
    pub key_pair: Option<KeyPair>,
    /// Offer LAN addresses so clients behind the same NAT connect locally
    pub share_local_address: bool,
    /// Share one socket between this server's relay links
    pub reusable_socket: bool,
    /// Relay node offered to clients when punching fails
    pub relay_through: Option<PublicKey>,
    /// Accept filter and holepunch hook
    pub policy: Arc<dyn ConnectionPolicy>,
    /// Keep-alive for accepted connections; `None` inherits the node's, zero disables
    pub keep_alive: Option<Duration>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            key_pair: None,
            share_local_address: true,
            reusable_socket: false,
            relay_through: None,
            policy: Arc::new(AllowAll),
            keep_alive: None,
        }
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("share_local_address", &self.share_local_address)
            .field("reusable_socket", &self.reusable_socket)
            .field("relay_through", &self.relay_through)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    Listening,
    Closed,
}

/// Handshake accepted but not yet turned into a connection
struct PendingSession {
    client: PublicKey,
    reply: SignedPayload,
    client_relay: Option<RelayInfo>,
    server_relay: Option<RelayInfo>,
    _probes: ProbeSession,
    responder: AbortHandle,
    relaying: bool,
    created: Instant,
}

pub(crate) struct ServerInner {
    node: Weak<NodeInner>,
    key_pair: KeyPair,
    target: [u8; 32],
    options: ServerOptions,
    state: Mutex<ServerState>,
    closed: watch::Sender<bool>,
    incoming_tx: mpsc::UnboundedSender<Connection>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Connection>>,
    sessions: DashMap<u32, PendingSession>,
    connections: DashMap<u64, WeakConnection>,
    refresh: Mutex<Option<AbortHandle>>,
}

/// A server accepting connections for one key pair
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub(crate) fn new(node: &Node, options: ServerOptions) -> Self {
        let key_pair = options
            .key_pair
            .clone()
            .unwrap_or_else(|| node.default_key_pair().clone());
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                node: node.downgrade(),
                target: server_target(&key_pair.public_key()),
                key_pair,
                options,
                state: Mutex::new(ServerState::Idle),
                closed,
                incoming_tx,
                incoming_rx: tokio::sync::Mutex::new(incoming_rx),
                sessions: DashMap::new(),
                connections: DashMap::new(),
                refresh: Mutex::new(None),
            }),
        }
    }

    /// Key clients connect to
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.inner.key_pair.public_key()
    }

    /// Public key and primary socket address, once listening
    #[must_use]
    pub fn address(&self) -> Option<NodeAddress> {
        if self.inner.state() != ServerState::Listening {
            return None;
        }
        let node = self.inner.node()?;
        let mut address = node.address();
        address.public_key = self.public_key();
        Some(address)
    }

    /// True between `listen` and `close`
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.inner.state() == ServerState::Listening
    }

    /// Accepted connections that are still open
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|c| c.value().upgrade().is_some_and(|c| !c.is_closed()))
            .count()
    }

    /// Register with the node and announce the key pair.
    ///
    /// An announce that reaches nobody is logged and retried by the refresh
    /// task; clients on the same node can connect regardless.
    ///
    /// # Errors
    /// - [`NodeError::ServerClosed`] if the server was closed or is already listening
    /// - [`NodeError::Destroyed`] if the node is gone
    pub async fn listen(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            if *state != ServerState::Idle {
                return Err(NodeError::ServerClosed);
            }
            *state = ServerState::Listening;
        }
        let node = self.inner.node().ok_or(NodeError::Destroyed)?;
        if node.is_destroyed() {
            return Err(NodeError::Destroyed);
        }
        let public_key = self.public_key();
        if !node.register_server(public_key, Arc::downgrade(&self.inner)) {
            *self.inner.lock_state() = ServerState::Closed;
            return Err(NodeError::ServerClosed);
        }
        node.dht().register_server(
            self.inner.target,
            Arc::new(ServerSignals {
                server: Arc::downgrade(&self.inner),
            }),
        );

        let announced = self.inner.announce(&node, Vec::new()).await;
        let refresh = tokio::spawn(Arc::clone(&self.inner).refresh_loop(announced));
        *self.inner.refresh.lock().unwrap_or_else(|e| e.into_inner()) = Some(refresh.abort_handle());
        tracing::info!("server {} listening", public_key);
        Ok(())
    }

    /// Wait for the next accepted connection.
    ///
    /// # Errors
    /// [`NodeError::ServerClosed`] once the server is closed.
    pub async fn accept(&self) -> Result<Connection> {
        let mut closed = self.inner.closed.subscribe();
        let mut incoming = self.inner.incoming_rx.lock().await;
        tokio::select! {
            connection = incoming.recv() => connection.ok_or(NodeError::ServerClosed),
            _ = closed.wait_for(|c| *c) => Err(NodeError::ServerClosed),
        }
    }

    /// Stop listening, withdraw the announcement and close accepted connections.
    ///
    /// Connections are ended first and destroyed after the node's close grace.
    pub async fn close(&self) {
        self.inner.close(true).await;
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("public_key", &self.public_key())
            .field("state", &self.inner.state())
            .finish()
    }
}

impl ServerInner {
    fn node(&self) -> Option<Node> {
        self.node.upgrade().map(Node::from_inner)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> ServerState {
        *self.lock_state()
    }

    fn keep_alive(&self, node: &Node) -> Option<Duration> {
        match self.options.keep_alive {
            Some(interval) => Some(interval).filter(|d| !d.is_zero()),
            None => node.config().keep_alive(),
        }
    }

    async fn announce(&self, node: &Node, relay_addresses: Vec<SocketAddr>) -> Vec<SocketAddr> {
        match node
            .dht()
            .announce(self.target, &self.key_pair, relay_addresses)
            .await
        {
            Ok(nodes) => nodes
                .into_iter()
                .take(MAX_RELAY_ADDRESSES)
                .map(|peer| peer.addr)
                .collect(),
            Err(e) => {
                tracing::warn!("announce of {} failed: {}", self.key_pair.public_key(), e);
                Vec::new()
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>, mut relay_addresses: Vec<SocketAddr>) {
        let Some(interval) = self
            .node()
            .map(|node| node.config().store.ttl / 2)
            .filter(|d| !d.is_zero())
        else {
            return;
        };
        loop {
            tokio::time::sleep(interval).await;
            let Some(node) = self.node() else {
                return;
            };
            if self.state() != ServerState::Listening || node.is_destroyed() {
                return;
            }
            relay_addresses = self.announce(&node, relay_addresses).await;
        }
    }

    pub(crate) async fn close(&self, graceful: bool) {
        {
            let mut state = self.lock_state();
            if *state == ServerState::Closed {
                return;
            }
            let was_listening = *state == ServerState::Listening;
            *state = ServerState::Closed;
            if !was_listening {
                self.closed.send_replace(true);
                return;
            }
        }
        self.closed.send_replace(true);
        if let Some(refresh) = self.refresh.lock().unwrap_or_else(|e| e.into_inner()).take() {
            refresh.abort();
        }
        for entry in self.sessions.iter() {
            entry.value().responder.abort();
        }
        self.sessions.clear();

        let node = self.node();
        if let Some(node) = &node {
            node.unregister_server(&self.key_pair.public_key());
            node.dht().unregister_server(&self.target);
            if graceful && !node.is_destroyed() {
                if let Err(e) = node.dht().unannounce(self.target, &self.key_pair).await {
                    tracing::debug!("unannounce failed: {}", e);
                }
            }
        }

        let connections: Vec<Connection> = self
            .connections
            .iter()
            .filter_map(|c| c.value().upgrade())
            .collect();
        self.connections.clear();
        let grace = match (&node, graceful) {
            (Some(node), true) => node.config().close_grace,
            _ => Duration::ZERO,
        };
        for connection in &connections {
            let _ = connection.end().await;
        }
        if !grace.is_zero() {
            let mut pending = JoinSet::new();
            for connection in &connections {
                let connection = connection.clone();
                pending.spawn(async move { connection.closed().await });
            }
            let all_closed = async { while pending.join_next().await.is_some() {} };
            if tokio::time::timeout(grace, all_closed).await.is_err() {
                tracing::debug!("close grace elapsed with connections still open");
            }
        }
        for connection in connections {
            connection.destroy().await;
        }
        tracing::info!("server {} closed", self.key_pair.public_key());
    }

    fn is_listening(&self) -> bool {
        self.state() == ServerState::Listening
    }

    fn deliver(&self, connection: Connection) {
        if !self.is_listening() {
            return;
        }
        let id = connection.id();
        self.connections.insert(id, connection.downgrade());
        let _ = self.incoming_tx.send(connection);
    }

    /// Spawn the Noise responder for `raw` and deliver the connection.
    fn respond(self: &Arc<Self>, raw: Arc<dyn RawStream>, mode: ConnectionMode, session: Option<u32>) -> AbortHandle {
        let server = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result =
                tokio::time::timeout(HANDSHAKE_TIMEOUT, SecretStream::respond(raw, &server.key_pair))
                    .await;
            if let Some(session) = session {
                server.sessions.remove(&session);
            }
            let stream = match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::debug!("inbound handshake failed: {}", e);
                    return;
                }
                Err(_) => {
                    tracing::debug!("inbound handshake timed out");
                    return;
                }
            };
            let Some(node) = server.node() else {
                return;
            };
            let socket = node.dht().socket().clone();
            let connection = Connection::new(stream, mode, server.keep_alive(&node), Some(socket));
            tracing::debug!(
                "accepted {:?} connection from {}",
                mode,
                connection.remote_public_key()
            );
            server.deliver(connection);
        });
        task.abort_handle()
    }

    /// Accept an in-process connection from a client on the same node.
    pub(crate) fn accept_local(self: &Arc<Self>, raw: Arc<dyn RawStream>) -> Result<()> {
        if !self.is_listening() {
            return Err(NodeError::ServerClosed);
        }
        self.respond(raw, ConnectionMode::Local, None);
        Ok(())
    }

    fn sweep_sessions(&self) {
        self.sessions
            .retain(|_, session| session.created.elapsed() < HANDSHAKE_TIMEOUT * 2);
    }

    async fn on_handshake(
        self: &Arc<Self>,
        request: SignedPayload,
        peer_address: SocketAddr,
    ) -> std::result::Result<SignedPayload, ErrorCode> {
        if !self.is_listening() {
            return Err(ErrorCode::Aborted);
        }
        let client = request.public_key;
        let hello: HandshakePayload = request
            .open(Command::PeerHandshake)
            .map_err(|_| ErrorCode::Aborted)?;
        if hello.target_key != self.key_pair.public_key() {
            return Err(ErrorCode::Aborted);
        }
        self.sweep_sessions();
        if let Some(existing) = self.sessions.get(&hello.session) {
            // Retransmitted handshake: same answer.
            if existing.client == client {
                return Ok(existing.reply.clone());
            }
            return Err(ErrorCode::Aborted);
        }

        let mut candidates = vec![peer_address];
        candidates.extend(hello.addresses.iter().copied());
        if !self.options.policy.firewall(&client, &candidates) {
            tracing::debug!("server firewall refused {}", client);
            return Err(ErrorCode::Aborted);
        }

        let node = self.node().ok_or(ErrorCode::Aborted)?;
        let dht = node.dht();
        let firewall = dht.firewall();
        if firewall != FirewallClass::Open {
            let info = HolepunchInfo {
                remote_public_key: client,
                remote_firewall: hello.firewall,
                local_firewall: firewall,
                remote_addresses: candidates,
            };
            if !self.options.policy.holepunch(&info) {
                tracing::debug!("server holepunch policy refused {}", client);
                return Err(ErrorCode::Aborted);
            }
        }

        let socket = dht.socket().clone();
        let stream = socket.create_stream();
        stream.connect(None, hello.stream_id).await;
        let probes = dht.holepuncher().open_session(hello.session);
        let server_relay = self.options.relay_through.map(|relay_key| RelayInfo {
            relay_key,
            token: rand::random(),
        });
        let addresses = match (self.options.share_local_address, socket.local_addr()) {
            (true, Ok(bound)) => dht.local_addresses(bound.port()),
            _ => Vec::new(),
        };
        let body = HandshakePayload {
            target_key: client,
            firewall,
            addresses,
            stream_id: stream.id(),
            session: hello.session,
            relay: server_relay,
            error: ErrorCode::None,
        };
        let reply = SignedPayload::sign(&self.key_pair, Command::PeerHandshake, &body)
            .map_err(|_| ErrorCode::Aborted)?;

        let mode = match firewall {
            FirewallClass::Open => ConnectionMode::Direct,
            _ => ConnectionMode::Holepunched,
        };
        let responder = self.respond(Arc::new(stream), mode, Some(hello.session));
        self.sessions.insert(
            hello.session,
            PendingSession {
                client,
                reply: reply.clone(),
                client_relay: hello.relay,
                server_relay,
                _probes: probes,
                responder,
                relaying: false,
                created: Instant::now(),
            },
        );
        tracing::debug!(
            "handshake {:08x} from {} at {}",
            hello.session,
            client,
            peer_address
        );
        Ok(reply)
    }

    async fn on_holepunch(
        self: &Arc<Self>,
        request: SignedPayload,
        peer_address: SocketAddr,
    ) -> std::result::Result<SignedPayload, ErrorCode> {
        let body: HolepunchPayload = request
            .open(Command::PeerHolepunch)
            .map_err(|_| ErrorCode::Aborted)?;
        let client_matches = self
            .sessions
            .get(&body.session)
            .is_some_and(|s| s.client == request.public_key);
        if !client_matches {
            return Err(ErrorCode::Aborted);
        }
        let node = self.node().ok_or(ErrorCode::Aborted)?;
        let dht = node.dht().clone();
        let firewall = dht.firewall();

        match body.phase {
            PunchPhase::Punch => {
                let candidates =
                    punch_candidates(peer_address, body.firewall, body.round, dht.holepuncher().config());
                let session = body.session;
                tokio::spawn(async move {
                    dht.holepuncher()
                        .fire(dht.socket(), session, &candidates)
                        .await;
                });
            }
            PunchPhase::Abort => {
                if let Some((_, session)) = self.sessions.remove(&body.session) {
                    session.responder.abort();
                }
                tracing::debug!("client aborted holepunch {:08x}", body.session);
            }
            PunchPhase::Relay => {
                let relay = {
                    let Some(mut session) = self.sessions.get_mut(&body.session) else {
                        return Err(ErrorCode::Aborted);
                    };
                    let Some(relay) = session.client_relay.or(session.server_relay) else {
                        return Err(ErrorCode::Aborted);
                    };
                    if session.relaying {
                        None
                    } else {
                        session.relaying = true;
                        session.responder.abort();
                        session.created = Instant::now();
                        Some(relay)
                    }
                };
                let server = Arc::clone(self);
                let session = body.session;
                let node = node.clone();
                tokio::spawn(async move {
                    let Some(relay) = relay else {
                        return;
                    };
                    let channel = node
                        .relay_channel(relay, false, server.options.reusable_socket)
                        .await;
                    match channel {
                        Ok(channel) => {
                            server.respond(Arc::new(channel), ConnectionMode::Relayed, Some(session));
                        }
                        Err(e) => {
                            tracing::debug!("relay for session {:08x} failed: {}", session, e);
                            server.sessions.remove(&session);
                        }
                    }
                });
            }
        }

        let reply = HolepunchPayload {
            session: body.session,
            round: body.round,
            phase: body.phase,
            firewall,
            addresses: Vec::new(),
            error: ErrorCode::None,
        };
        SignedPayload::sign(&self.key_pair, Command::PeerHolepunch, &reply)
            .map_err(|_| ErrorCode::Aborted)
    }
}

/// Signaling entry point registered with the DHT
struct ServerSignals {
    server: Weak<ServerInner>,
}

#[async_trait]
impl SignalHandler for ServerSignals {
    async fn handshake(
        &self,
        request: SignedPayload,
        peer_address: SocketAddr,
    ) -> std::result::Result<SignedPayload, ErrorCode> {
        let server = self.server.upgrade().ok_or(ErrorCode::Aborted)?;
        server.on_handshake(request, peer_address).await
    }

    async fn holepunch(
        &self,
        request: SignedPayload,
        peer_address: SocketAddr,
    ) -> std::result::Result<SignedPayload, ErrorCode> {
        let server = self.server.upgrade().ok_or(ErrorCode::Aborted)?;
        server.on_holepunch(request, peer_address).await
    }
}
