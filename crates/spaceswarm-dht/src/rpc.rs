//! RPC engine.
//!
//! Sends DHT requests over a [`UdpMux`] and matches responses to them by
//! transaction id and source address. A request is retried with exponential
//! backoff; a contact that exhausts its retries is charged one failure in the
//! routing table and dropped after [`MAX_FAILURES`](crate::routing::MAX_FAILURES).
//!
//! The engine also keeps the addresses remote nodes report for us, which the
//! firewall classifier reads.

use crate::messages::{
    Command, ErrorCode, InternalCommand, Message, PROTOCOL_VERSION, PeerAddr, Request, RequestKind,
    Response,
};
use crate::node_id::NodeId;
use crate::routing::{Contact, InsertOutcome, RoutingTable};
use dashmap::DashMap;
use spaceswarm_transport::{CHANNEL_DHT, UdpMux};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{oneshot, watch};

/// Number of observed addresses remembered
const OBSERVATIONS: usize = 16;

/// RPC and lookup tuning
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Timeout of the first attempt; doubled on each retry
    pub timeout: Duration,
    /// Retries after the first attempt
    pub retries: u32,
    /// Lookup concurrency
    pub alpha: usize,
    /// Bucket size and lookup result size
    pub k: usize,
    /// Lookup round cap
    pub max_rounds: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            retries: 2,
            alpha: 3,
            k: crate::routing::K,
            max_rounds: 20,
        }
    }
}

/// RPC errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// No response after every retry
    #[error("request timed out")]
    Timeout,

    /// A lookup found nobody to ask
    #[error("no nodes to query")]
    NoNodes,

    /// The engine was shut down
    #[error("node destroyed")]
    Destroyed,

    /// Remote answered with an error code
    #[error("remote error: {0:?}")]
    Remote(ErrorCode),

    /// Message could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),

    /// Socket error
    #[error("transport error: {0}")]
    Transport(String),

    /// Value rejected before sending
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
}

/// An outgoing request before it is addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Command
    pub kind: RequestKind,
    /// Target key or id
    pub target: Option<[u8; 32]>,
    /// Payload
    pub value: Option<Vec<u8>>,
}

impl Call {
    /// Internal command call
    #[must_use]
    pub fn internal(command: InternalCommand) -> Self {
        Self {
            kind: RequestKind::Internal(command),
            target: None,
            value: None,
        }
    }

    /// User command call
    #[must_use]
    pub fn user(command: Command) -> Self {
        Self {
            kind: RequestKind::User(command),
            target: None,
            value: None,
        }
    }

    /// Set the target
    #[must_use]
    pub fn with_target(mut self, target: [u8; 32]) -> Self {
        self.target = Some(target);
        self
    }

    /// Set the payload
    #[must_use]
    pub fn with_value(mut self, value: Vec<u8>) -> Self {
        self.value = Some(value);
        self
    }
}

/// A response matched to its request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Responder address
    pub from: SocketAddr,
    /// Responder id, absent for ephemeral nodes
    pub id: Option<NodeId>,
    /// Our address as the responder saw it
    pub to: SocketAddr,
    /// Nodes closer to the target
    pub closer_nodes: Vec<PeerAddr>,
    /// Error code
    pub error: ErrorCode,
    /// Result payload
    pub value: Option<Vec<u8>>,
    /// Round-trip time of the successful attempt
    pub rtt: Duration,
}

struct Pending {
    to: SocketAddr,
    tx: oneshot::Sender<Response>,
}

/// Request/response engine bound to a primary socket
pub struct RpcEngine {
    mux: UdpMux,
    local_id: NodeId,
    ephemeral: bool,
    config: RpcConfig,
    routing: Mutex<RoutingTable>,
    pending: DashMap<u32, Pending>,
    next_tid: AtomicU32,
    observed: Mutex<VecDeque<(SocketAddr, SocketAddr)>>,
    shutdown: watch::Sender<bool>,
}

impl RpcEngine {
    /// Create an engine on `mux`.
    #[must_use]
    pub fn new(mux: UdpMux, local_id: NodeId, ephemeral: bool, config: RpcConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            routing: Mutex::new(RoutingTable::new(local_id, config.k)),
            mux,
            local_id,
            ephemeral,
            config,
            pending: DashMap::new(),
            next_tid: AtomicU32::new(rand::random()),
            observed: Mutex::new(VecDeque::with_capacity(OBSERVATIONS)),
            shutdown,
        }
    }

    /// Local node id
    #[must_use]
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// True if this node keeps its id out of messages
    #[must_use]
    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Tuning
    #[must_use]
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Primary socket
    #[must_use]
    pub fn mux(&self) -> &UdpMux {
        &self.mux
    }

    /// Lock the routing table.
    pub fn routing(&self) -> MutexGuard<'_, RoutingTable> {
        self.routing.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of requests awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// True after [`close`](Self::close)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Subscribe to shutdown
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Send `call` to `to` on the primary socket, retrying on timeout.
    ///
    /// # Errors
    /// - [`RpcError::Timeout`] once every attempt timed out
    /// - [`RpcError::Destroyed`] if the engine shuts down meanwhile
    pub async fn request(&self, to: SocketAddr, call: &Call) -> Result<Reply, RpcError> {
        self.request_via(&self.mux, to, call).await
    }

    /// Send `call` to `to` through `mux`, retrying on timeout.
    ///
    /// # Errors
    /// As [`request`](Self::request).
    pub async fn request_via(
        &self,
        mux: &UdpMux,
        to: SocketAddr,
        call: &Call,
    ) -> Result<Reply, RpcError> {
        let mut timeout = self.config.timeout;
        for attempt in 0..=self.config.retries {
            match self.request_once(mux, to, call, timeout).await {
                Err(RpcError::Timeout) => {
                    tracing::trace!("request {:?} to {} timed out (attempt {})", call.kind, to, attempt);
                    timeout = timeout.saturating_mul(2);
                }
                result => return result,
            }
        }
        self.charge_failure(to);
        Err(RpcError::Timeout)
    }

    /// Single attempt with an explicit timeout and no failure accounting.
    ///
    /// # Errors
    /// [`RpcError::Timeout`], [`RpcError::Destroyed`] or a send failure.
    pub async fn request_once(
        &self,
        mux: &UdpMux,
        to: SocketAddr,
        call: &Call,
        timeout: Duration,
    ) -> Result<Reply, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Destroyed);
        }
        let tid = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let message = Message::Request(Request {
            version: PROTOCOL_VERSION,
            tid,
            id: self.wire_id(),
            to,
            kind: call.kind,
            target: call.target,
            value: call.value.clone(),
        });
        let bytes = message.encode().map_err(|e| RpcError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(tid, Pending { to, tx });
        let started = Instant::now();

        if let Err(e) = mux.send_datagram(CHANNEL_DHT, &bytes, to).await {
            self.pending.remove(&tid);
            return Err(RpcError::Transport(e.to_string()));
        }

        let mut shutdown = self.shutdown.subscribe();
        let outcome = tokio::select! {
            response = rx => response.map_err(|_| RpcError::Destroyed),
            _ = tokio::time::sleep(timeout) => Err(RpcError::Timeout),
            _ = shutdown.wait_for(|closed| *closed) => Err(RpcError::Destroyed),
        };
        self.pending.remove(&tid);
        let response = outcome?;
        let rtt = started.elapsed();

        if let Some(id) = response.id {
            self.observe(id, to, Some(rtt));
        }
        if mux.id() == self.mux.id() {
            self.record_observation(to, response.to);
        }

        Ok(Reply {
            from: to,
            id: response.id,
            to: response.to,
            closer_nodes: response.closer_nodes,
            error: response.error,
            value: response.value,
            rtt,
        })
    }

    /// Route an inbound response to its waiting request. Returns false if unmatched.
    pub fn on_response(&self, response: Response, from: SocketAddr) -> bool {
        let matches = self
            .pending
            .get(&response.tid)
            .is_some_and(|pending| pending.to == from);
        if !matches {
            tracing::trace!("unmatched response tid {} from {}", response.tid, from);
            return false;
        }
        match self.pending.remove(&response.tid) {
            Some((_, pending)) => pending.tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Answer a request on the socket it arrived on.
    ///
    /// # Errors
    /// [`RpcError::Encode`] or [`RpcError::Transport`].
    pub async fn reply(
        &self,
        socket: &UdpMux,
        request: &Request,
        from: SocketAddr,
        closer_nodes: Vec<PeerAddr>,
        error: ErrorCode,
        value: Option<Vec<u8>>,
    ) -> Result<(), RpcError> {
        let message = Message::Response(Response {
            tid: request.tid,
            id: self.wire_id(),
            to: from,
            closer_nodes,
            error,
            value,
        });
        let bytes = message.encode().map_err(|e| RpcError::Encode(e.to_string()))?;
        socket
            .send_datagram(CHANNEL_DHT, &bytes, from)
            .await
            .map_err(|e| RpcError::Transport(e.to_string()))
    }

    /// Learn about a node that talked to us or answered us.
    pub fn observe(&self, id: NodeId, addr: SocketAddr, rtt: Option<Duration>) {
        if id == self.local_id {
            return;
        }
        let mut table = self.routing();
        match table.insert(Contact::new(id, addr)) {
            InsertOutcome::Added => tracing::trace!("added contact {} at {}", id, addr),
            InsertOutcome::Replaced(old) => {
                tracing::trace!("contact {} replaced stale {}", id, old);
            }
            _ => {}
        }
        if rtt.is_some() {
            table.mark_seen(&id, rtt);
        }
    }

    /// Closest known contacts to `target`, as wire addresses
    #[must_use]
    pub fn closer_nodes(&self, target: &[u8; 32]) -> Vec<PeerAddr> {
        self.routing()
            .closest(&NodeId::from_bytes(*target), self.config.k)
            .into_iter()
            .map(|c| PeerAddr {
                id: c.id,
                addr: c.addr,
            })
            .collect()
    }

    /// Addresses remote nodes reported for us, as (remote, observed) pairs
    #[must_use]
    pub fn observations(&self) -> Vec<(SocketAddr, SocketAddr)> {
        self.observed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Fail every in-flight request with [`RpcError::Destroyed`].
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
        self.pending.clear();
    }

    fn wire_id(&self) -> Option<NodeId> {
        (!self.ephemeral).then_some(self.local_id)
    }

    fn record_observation(&self, remote: SocketAddr, observed: SocketAddr) {
        let mut list = self.observed.lock().unwrap_or_else(|e| e.into_inner());
        list.retain(|(r, _)| *r != remote);
        if list.len() == OBSERVATIONS {
            list.pop_front();
        }
        list.push_back((remote, observed));
    }

    fn charge_failure(&self, addr: SocketAddr) {
        let mut table = self.routing();
        let id = table.contacts().find(|c| c.addr == addr).map(|c| c.id);
        if let Some(id) = id {
            if table.record_failure(&id) {
                tracing::debug!("dropped unresponsive contact {} at {}", id, addr);
            }
        }
    }
}

impl std::fmt::Debug for RpcEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcEngine")
            .field("local_id", &self.local_id)
            .field("ephemeral", &self.ephemeral)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaceswarm_transport::Datagram;
    use tokio::sync::mpsc;

    async fn engine(ephemeral: bool) -> (RpcEngine, mpsc::UnboundedReceiver<Datagram>) {
        let (mux, rx) = UdpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let config = RpcConfig {
            timeout: Duration::from_millis(50),
            retries: 1,
            ..RpcConfig::default()
        };
        (RpcEngine::new(mux, NodeId::random(), ephemeral, config), rx)
    }

    /// Answer every request on `rx` with an empty response.
    fn spawn_echo(engine: std::sync::Arc<RpcEngine>, mut rx: mpsc::UnboundedReceiver<Datagram>) {
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                match Message::decode(&datagram.payload) {
                    Ok(Message::Request(req)) => {
                        let value = req.value.clone();
                        let _ = engine
                            .reply(&datagram.socket, &req, datagram.from, vec![], ErrorCode::None, value)
                            .await;
                    }
                    Ok(Message::Response(resp)) => {
                        engine.on_response(resp, datagram.from);
                    }
                    Err(_) => {}
                }
            }
        });
    }

    fn spawn_client_loop(engine: std::sync::Arc<RpcEngine>, mut rx: mpsc::UnboundedReceiver<Datagram>) {
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                if let Ok(Message::Response(resp)) = Message::decode(&datagram.payload) {
                    engine.on_response(resp, datagram.from);
                }
            }
        });
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (server, server_rx) = engine(false).await;
        let server = std::sync::Arc::new(server);
        let server_id = server.local_id();
        let server_addr = server.mux().local_addr().unwrap();
        spawn_echo(server.clone(), server_rx);

        let (client, client_rx) = engine(false).await;
        let client = std::sync::Arc::new(client);
        spawn_client_loop(client.clone(), client_rx);

        let call = Call::internal(InternalCommand::Ping).with_value(b"ping".to_vec());
        let reply = client.request(server_addr, &call).await.unwrap();
        assert_eq!(reply.id, Some(server_id));
        assert_eq!(reply.value.as_deref(), Some(b"ping".as_slice()));
        assert_eq!(reply.to, client.mux().local_addr().unwrap());
        assert_eq!(client.pending_count(), 0);

        // Responder joined the routing table with a measured rtt
        let table = client.routing();
        let contact = table.get(&server_id).unwrap();
        assert!(contact.rtt.is_some());
        drop(table);

        assert_eq!(client.observations().len(), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_responder_not_added() {
        let (server, server_rx) = engine(true).await;
        let server = std::sync::Arc::new(server);
        let server_addr = server.mux().local_addr().unwrap();
        spawn_echo(server.clone(), server_rx);

        let (client, client_rx) = engine(false).await;
        let client = std::sync::Arc::new(client);
        spawn_client_loop(client.clone(), client_rx);

        let reply = client
            .request(server_addr, &Call::internal(InternalCommand::Ping))
            .await
            .unwrap();
        assert_eq!(reply.id, None);
        assert!(client.routing().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_charges_failures_and_evicts() {
        let (client, _rx) = engine(false).await;
        let (silent, _silent_rx) = UdpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let silent_addr = silent.local_addr().unwrap();
        let silent_id = NodeId::random();
        client.observe(silent_id, silent_addr, None);

        let call = Call::internal(InternalCommand::Ping);
        assert_eq!(client.request(silent_addr, &call).await, Err(RpcError::Timeout));
        assert_eq!(client.routing().get(&silent_id).unwrap().failures, 1);

        assert_eq!(client.request(silent_addr, &call).await, Err(RpcError::Timeout));
        assert!(client.routing().get(&silent_id).is_none());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_in_flight_requests() {
        let (client, _rx) = engine(false).await;
        let client = std::sync::Arc::new(client);
        let (silent, _silent_rx) = UdpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = silent.local_addr().unwrap();

        let task = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .request_once(client.mux(), addr, &Call::internal(InternalCommand::Ping), Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close();
        assert_eq!(task.await.unwrap(), Err(RpcError::Destroyed));
        assert_eq!(client.request(addr, &Call::internal(InternalCommand::Ping)).await, Err(RpcError::Destroyed));
    }

    #[tokio::test]
    async fn test_response_from_wrong_address_ignored() {
        let (client, _rx) = engine(false).await;
        let response = Response {
            tid: 1,
            id: None,
            to: "127.0.0.1:1".parse().unwrap(),
            closer_nodes: vec![],
            error: ErrorCode::None,
            value: None,
        };
        assert!(!client.on_response(response, "127.0.0.1:2".parse().unwrap()));
    }

    #[test]
    fn test_call_builders() {
        let call = Call::user(Command::Lookup).with_target([1u8; 32]).with_value(vec![2]);
        assert_eq!(call.kind, RequestKind::User(Command::Lookup));
        assert_eq!(call.target, Some([1u8; 32]));
        assert_eq!(call.value, Some(vec![2]));
    }
}
