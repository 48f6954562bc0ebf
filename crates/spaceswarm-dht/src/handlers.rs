//! Inbound request handlers.
//!
//! Storage commands answer from the local [`RecordStore`](crate::store::RecordStore)
//! and always include the closest known nodes so lookups can keep iterating.
//! Signaling commands are either answered by a server registered on this
//! node or forwarded to the announcer the store knows for the target.

use crate::dht::Dht;
use crate::firewall::send_nat_probe;
use crate::messages::{
    AnnounceRequest, Command, ErrorCode, InternalCommand, MutablePutRequest, MutableValue,
    NatProbe, PROTOCOL_VERSION, PeerAddr, PeerRecord, Request, RequestKind, Signal, SignalMode,
    UnannounceRequest, decode, encode,
};
use crate::node_id::NodeId;
use crate::rpc::Call;
use spaceswarm_transport::{Datagram, UdpMux};
use std::net::SocketAddr;

/// Reply body: error code and optional value
type Answer = (ErrorCode, Option<Vec<u8>>);

impl Dht {
    pub(crate) async fn on_request(&self, request: Request, datagram: Datagram) {
        let from = datagram.from;
        let socket = datagram.socket;

        if request.version != PROTOCOL_VERSION {
            tracing::debug!("version {} from {} rejected", request.version, from);
            self.respond(&socket, &request, from, Vec::new(), (ErrorCode::VersionMismatch, None))
                .await;
            return;
        }
        if let Some(id) = request.id {
            self.inner.rpc.observe(id, from, None);
        }

        match request.kind {
            RequestKind::Internal(command) => self.on_internal(command, request, from, socket).await,
            RequestKind::User(command @ (Command::PeerHandshake | Command::PeerHolepunch)) => {
                // Signaling may wait on a forwarded request or a server; keep the dispatch loop free.
                let dht = self.clone();
                tokio::spawn(async move { dht.on_signal(command, request, from, socket).await });
            }
            RequestKind::User(command) => {
                let closer = request
                    .target
                    .map(|t| self.inner.rpc.closer_nodes(&t))
                    .unwrap_or_default();
                let answer = match request.target {
                    Some(target) => self.on_command(command, target, &request, from),
                    None => (ErrorCode::Aborted, None),
                };
                self.respond(&socket, &request, from, closer, answer).await;
            }
        }
    }

    async fn on_internal(
        &self,
        command: InternalCommand,
        request: Request,
        from: SocketAddr,
        socket: UdpMux,
    ) {
        match command {
            InternalCommand::Ping => {
                self.respond(&socket, &request, from, Vec::new(), (ErrorCode::None, None))
                    .await;
            }
            InternalCommand::PingNat => {
                let Some(probe) = request
                    .value
                    .as_deref()
                    .and_then(|v| decode::<NatProbe>(v).ok())
                else {
                    self.respond(&socket, &request, from, Vec::new(), (ErrorCode::Aborted, None))
                        .await;
                    return;
                };
                self.respond(&socket, &request, from, Vec::new(), (ErrorCode::None, None))
                    .await;
                tokio::spawn(async move {
                    if let Err(e) = send_nat_probe(from, probe.token).await {
                        tracing::debug!("nat probe to {} failed: {}", from, e);
                    }
                });
            }
            InternalCommand::FindNode => {
                let answer = match request.target {
                    Some(_) => (ErrorCode::None, None),
                    None => (ErrorCode::Aborted, None),
                };
                let closer = request
                    .target
                    .map(|t| self.inner.rpc.closer_nodes(&t))
                    .unwrap_or_default();
                self.respond(&socket, &request, from, closer, answer).await;
            }
            InternalCommand::DownHint => {
                self.respond(&socket, &request, from, Vec::new(), (ErrorCode::None, None))
                    .await;
                let Some(hint) = request
                    .value
                    .as_deref()
                    .and_then(|v| decode::<PeerAddr>(v).ok())
                else {
                    return;
                };
                let known = self
                    .inner
                    .rpc
                    .routing()
                    .get(&hint.id)
                    .is_some_and(|c| c.addr == hint.addr);
                if known {
                    // A timed-out ping charges the failure to the contact.
                    let rpc = self.inner.rpc.clone();
                    tokio::spawn(async move {
                        let _ = rpc
                            .request(hint.addr, &Call::internal(InternalCommand::Ping))
                            .await;
                    });
                }
            }
            InternalCommand::Unrecognized(code) => {
                tracing::trace!("unknown internal command {} from {}", code, from);
                self.respond(&socket, &request, from, Vec::new(), (ErrorCode::Aborted, None))
                    .await;
            }
        }
    }

    fn on_command(
        &self,
        command: Command,
        target: [u8; 32],
        request: &Request,
        from: SocketAddr,
    ) -> Answer {
        let value = request.value.as_deref();
        match command {
            Command::FindPeer => {
                let record = self.store().find_peer(&target).map(|p| p.record.clone());
                (ErrorCode::None, record.and_then(|r| encode(&r).ok()))
            }
            Command::Lookup => {
                let peers: Vec<PeerRecord> = self
                    .store()
                    .lookup(&target)
                    .into_iter()
                    .map(|p| p.record.clone())
                    .collect();
                if peers.is_empty() {
                    return (ErrorCode::None, None);
                }
                (ErrorCode::None, encode(&peers).ok())
            }
            Command::Announce => {
                let Some(announce) = value.and_then(|v| decode::<AnnounceRequest>(v).ok()) else {
                    return (ErrorCode::Aborted, None);
                };
                if announce.verify(&target).is_err() {
                    tracing::debug!("bad announce signature from {}", from);
                    return (ErrorCode::Aborted, None);
                }
                if !self.is_closest(&target) {
                    return (ErrorCode::None, None);
                }
                let mut store = self.store();
                if let Err(e) = store.check_stamp(target, &announce.peer.public_key, announce.stamp) {
                    tracing::debug!("announce from {} rejected: {}", from, e);
                    return (e.code(), None);
                }
                store.announce(target, announce.peer, from);
                (ErrorCode::None, None)
            }
            Command::Unannounce => {
                let Some(unannounce) = value.and_then(|v| decode::<UnannounceRequest>(v).ok())
                else {
                    return (ErrorCode::Aborted, None);
                };
                if unannounce.verify(&target).is_err() {
                    return (ErrorCode::Aborted, None);
                }
                let mut store = self.store();
                if let Err(e) = store.check_stamp(target, &unannounce.public_key, unannounce.stamp) {
                    tracing::debug!("unannounce from {} rejected: {}", from, e);
                    return (e.code(), None);
                }
                store.unannounce(&target, &unannounce.public_key);
                (ErrorCode::None, None)
            }
            Command::MutablePut => {
                let Some(put) = value.and_then(|v| decode::<MutablePutRequest>(v).ok()) else {
                    return (ErrorCode::Aborted, None);
                };
                match self.store().put_mutable(target, put) {
                    Ok(()) => (ErrorCode::None, None),
                    Err(e) => {
                        tracing::trace!("mutable put from {} rejected: {}", from, e);
                        (e.code(), None)
                    }
                }
            }
            Command::MutableGet => {
                let min_seq = value.and_then(|v| decode::<u64>(v).ok()).unwrap_or(0);
                let found = self
                    .store()
                    .get_mutable(&target)
                    .filter(|m| m.seq >= min_seq)
                    .map(|m| MutableValue {
                        seq: m.seq,
                        value: m.value.clone(),
                        signature: m.signature,
                    });
                (ErrorCode::None, found.and_then(|m| encode(&m).ok()))
            }
            Command::ImmutablePut => {
                let Some(value) = value else {
                    return (ErrorCode::Aborted, None);
                };
                match self.store().put_immutable(target, value.to_vec()) {
                    Ok(()) => (ErrorCode::None, None),
                    Err(e) => (e.code(), None),
                }
            }
            Command::ImmutableGet => {
                let found = self.store().get_immutable(&target).map(<[u8]>::to_vec);
                (ErrorCode::None, found)
            }
            Command::PeerHandshake | Command::PeerHolepunch | Command::Unrecognized(_) => {
                (ErrorCode::Aborted, None)
            }
        }
    }

    /// True if this node ranks among the k closest known nodes to `target`
    fn is_closest(&self, target: &[u8; 32]) -> bool {
        let k = self.inner.config.rpc.k;
        let closest = self.inner.rpc.closer_nodes(target);
        if closest.len() < k {
            return true;
        }
        let target = NodeId::from_bytes(*target);
        let local = self.id();
        closest
            .iter()
            .any(|p| target.cmp_distance(&local, &p.id).is_lt())
    }

    async fn on_signal(
        &self,
        command: Command,
        request: Request,
        from: SocketAddr,
        socket: UdpMux,
    ) {
        let closer = request
            .target
            .map(|t| self.inner.rpc.closer_nodes(&t))
            .unwrap_or_default();
        let signal = request
            .value
            .as_deref()
            .and_then(|v| decode::<Signal>(v).ok());
        let (Some(target), Some(signal)) = (request.target, signal) else {
            self.respond(&socket, &request, from, closer, (ErrorCode::Aborted, None))
                .await;
            return;
        };

        let answer = match signal.mode {
            SignalMode::FromClient if self.has_server(&target) => {
                self.answer_locally(command, target, signal, from).await
            }
            SignalMode::FromClient => {
                let announcer = self.store().find_peer(&target).map(|p| p.address);
                match announcer {
                    Some(server) => self.forward(command, target, signal, from, server).await,
                    None => {
                        // Unknown target: closer nodes only, so the client moves on.
                        self.respond(&socket, &request, from, closer, (ErrorCode::None, None))
                            .await;
                        return;
                    }
                }
            }
            SignalMode::FromRelay => {
                let client = signal.peer_address.unwrap_or(from);
                self.answer_locally(command, target, signal, client).await
            }
            SignalMode::Reply | SignalMode::Unrecognized(_) => (ErrorCode::Aborted, None),
        };
        self.respond(&socket, &request, from, closer, answer).await;
    }

    async fn answer_locally(
        &self,
        command: Command,
        target: [u8; 32],
        signal: Signal,
        client: SocketAddr,
    ) -> Answer {
        let Some(handler) = self.inner.servers.get(&target).map(|h| h.value().clone()) else {
            return (ErrorCode::Aborted, None);
        };
        let result = match command {
            Command::PeerHandshake => handler.handshake(signal.signed, client).await,
            _ => handler.holepunch(signal.signed, client).await,
        };
        match result {
            Ok(signed) => {
                let reply = Signal {
                    mode: SignalMode::Reply,
                    peer_address: None,
                    signed,
                };
                (ErrorCode::None, encode(&reply).ok())
            }
            Err(code) => (code, None),
        }
    }

    /// Relay a client's signal to the announcer and carry its answer back.
    async fn forward(
        &self,
        command: Command,
        target: [u8; 32],
        signal: Signal,
        client: SocketAddr,
        server: SocketAddr,
    ) -> Answer {
        let relayed = Signal {
            mode: SignalMode::FromRelay,
            peer_address: Some(client),
            signed: signal.signed,
        };
        let Ok(value) = encode(&relayed) else {
            return (ErrorCode::Aborted, None);
        };
        let call = Call::user(command).with_target(target).with_value(value);
        let reply = match self.inner.rpc.request(server, &call).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!("forwarding {:?} to {} failed: {}", command, server, e);
                return (ErrorCode::TryLater, None);
            }
        };
        if reply.error != ErrorCode::None {
            return (reply.error, None);
        }
        let Some(mut answer) = reply.value.as_deref().and_then(|v| decode::<Signal>(v).ok()) else {
            return (ErrorCode::Aborted, None);
        };
        answer.peer_address = Some(server);
        (ErrorCode::None, encode(&answer).ok())
    }

    async fn respond(
        &self,
        socket: &UdpMux,
        request: &Request,
        from: SocketAddr,
        closer: Vec<PeerAddr>,
        (error, value): Answer,
    ) {
        if let Err(e) = self
            .inner
            .rpc
            .reply(socket, request, from, closer, error, value)
            .await
        {
            tracing::debug!("reply to {} failed: {}", from, e);
        }
    }
}
