//! Holepunch coordination.
//!
//! Both peers fire probe datagrams at each other's candidate addresses during
//! a round window. A peer answers every probe for a session it knows with an
//! echo, so either an echo of our own probe or a probe from the peer proves a
//! bidirectional path. The first verified address wins.
//!
//! A connect attempt is tracked by a [`HolepunchSession`] whose state
//! (`INIT → SIGNALING → PUNCHING → CONNECTED | RELAYING | FAILED`) is
//! published through a watch channel.

use crate::messages::{ErrorCode, FirewallClass, Probe, decode, encode};
use crate::rpc::RpcError;
use dashmap::DashMap;
use rand::Rng;
use spaceswarm_crypto::PublicKey;
use spaceswarm_transport::{CHANNEL_HOLEPUNCH, Datagram, UdpMux};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Holepunch timing and candidate settings
#[derive(Debug, Clone)]
pub struct HolepunchConfig {
    /// How long one punching round waits for a verified path
    pub round_window: Duration,
    /// Punching rounds before falling back to a relay
    pub max_rounds: u32,
    /// Probes sent to each candidate per round
    pub probes_per_round: u32,
    /// Gap between probe bursts
    pub probe_interval: Duration,
    /// Extra ports tried around the reported one for RANDOM peers
    pub random_spread: u16,
}

impl Default for HolepunchConfig {
    fn default() -> Self {
        Self {
            round_window: Duration::from_secs(1),
            max_rounds: 4,
            probes_per_round: 10,
            probe_interval: Duration::from_millis(50),
            random_spread: 16,
        }
    }
}

/// Holepunch failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HolepunchError {
    /// No announce record for the target key
    #[error("peer not found")]
    PeerNotFound,

    /// A policy hook on either side refused
    #[error("holepunch aborted")]
    Aborted,

    /// The remote answered with an error code
    #[error("rejected by remote: {0:?}")]
    Rejected(ErrorCode),

    /// Every round expired and no relay was available
    #[error("holepunch failed")]
    Failed,

    /// Signaling reply could not be verified
    #[error("invalid signaling reply: {0}")]
    InvalidReply(String),

    /// Signaling request failed
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Connection attempt state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HolepunchState {
    /// Resolving the target
    Init,
    /// Exchanging PEER_HANDSHAKE
    Signaling,
    /// Firing probes
    Punching {
        /// Current round
        round: u32,
    },
    /// Verified path found, or no punching needed
    Connected {
        /// Remote address of the path
        remote: SocketAddr,
    },
    /// Traffic goes through a relay
    Relaying,
    /// Gave up
    Failed,
}

impl HolepunchState {
    /// True for CONNECTED, RELAYING and FAILED
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected { .. } | Self::Relaying | Self::Failed)
    }

    fn can_move_to(&self, next: &HolepunchState) -> bool {
        use HolepunchState::*;
        match (self, next) {
            (_, Failed) => !self.is_terminal(),
            (Init, Signaling | Connected { .. }) => true,
            (Signaling, Punching { .. } | Connected { .. } | Relaying) => true,
            (Punching { round: a }, Punching { round: b }) => b > a,
            (Punching { .. }, Connected { .. } | Relaying) => true,
            _ => false,
        }
    }
}

/// One connect attempt
#[derive(Debug)]
pub struct HolepunchSession {
    id: u32,
    state: watch::Sender<HolepunchState>,
}

impl HolepunchSession {
    /// New session in INIT with a random id
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(HolepunchState::Init);
        Self {
            id: rand::random(),
            state,
        }
    }

    /// Session id shared with the peer
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> HolepunchState {
        self.state.borrow().clone()
    }

    /// Subscribe to transitions
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HolepunchState> {
        self.state.subscribe()
    }

    /// Move to `next`. Returns false, leaving the state unchanged, for an invalid transition.
    pub fn transition(&self, next: HolepunchState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|current| {
            if current.can_move_to(&next) {
                tracing::trace!("holepunch session {:08x}: {:?} -> {:?}", self.id, current, next);
                *current = next.clone();
                moved = true;
            }
            moved
        });
        moved
    }
}

impl Default for HolepunchSession {
    fn default() -> Self {
        Self::new()
    }
}

/// What a policy hook sees before punching starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolepunchInfo {
    /// Key of the other peer
    pub remote_public_key: PublicKey,
    /// Other peer's firewall class
    pub remote_firewall: FirewallClass,
    /// Our firewall class
    pub local_firewall: FirewallClass,
    /// Other peer's candidate addresses
    pub remote_addresses: Vec<SocketAddr>,
}

/// Application hooks consulted during connection setup
pub trait ConnectionPolicy: Send + Sync {
    /// Allow punching towards the peer. Returning false aborts without relay fallback.
    fn holepunch(&self, _info: &HolepunchInfo) -> bool {
        true
    }

    /// Server-side accept filter on the client key and addresses.
    fn firewall(&self, _remote: &PublicKey, _addresses: &[SocketAddr]) -> bool {
        true
    }
}

/// Policy that allows everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectionPolicy for AllowAll {}

impl<F> ConnectionPolicy for F
where
    F: Fn(&HolepunchInfo) -> bool + Send + Sync,
{
    fn holepunch(&self, info: &HolepunchInfo) -> bool {
        self(info)
    }
}

/// Policy built from a firewall closure
pub struct FirewallPolicy<F>(pub F);

impl<F> ConnectionPolicy for FirewallPolicy<F>
where
    F: Fn(&PublicKey, &[SocketAddr]) -> bool + Send + Sync,
{
    fn firewall(&self, remote: &PublicKey, addresses: &[SocketAddr]) -> bool {
        (self.0)(remote, addresses)
    }
}

/// Candidate addresses to probe for a peer reported at `peer`.
///
/// CONSISTENT and OPEN peers keep their mapping, so only the reported
/// address is tried. RANDOM peers get neighbouring ports in the first round
/// and random high ports afterwards.
#[must_use]
pub fn punch_candidates(
    peer: SocketAddr,
    firewall: FirewallClass,
    round: u32,
    config: &HolepunchConfig,
) -> Vec<SocketAddr> {
    let mut out = vec![peer];
    if firewall != FirewallClass::Random {
        return out;
    }
    let spread = config.random_spread;
    if round == 0 {
        for offset in 1..=spread {
            for port in [peer.port().checked_add(offset), peer.port().checked_sub(offset)] {
                if let Some(port) = port.filter(|p| *p != 0) {
                    out.push(SocketAddr::new(peer.ip(), port));
                }
            }
        }
    } else {
        let mut rng = rand::thread_rng();
        for _ in 0..spread {
            out.push(SocketAddr::new(peer.ip(), rng.gen_range(1024..=u16::MAX)));
        }
    }
    out.dedup();
    out
}

/// Probe evidence delivered to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeEvent {
    /// Sender of the probe or echo
    pub from: SocketAddr,
    /// True for an echo of our own probe
    pub echo: bool,
    /// Socket it arrived on
    pub socket_id: u64,
}

type SessionTable = Arc<DashMap<u32, mpsc::UnboundedSender<ProbeEvent>>>;

/// Probe dispatcher shared by all sessions of a node
#[derive(Clone)]
pub struct Holepuncher {
    sessions: SessionTable,
    config: HolepunchConfig,
}

impl Holepuncher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(config: HolepunchConfig) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Timing settings
    #[must_use]
    pub fn config(&self) -> &HolepunchConfig {
        &self.config
    }

    /// Start answering probes for `session`. Dropping the returned handle stops it.
    #[must_use]
    pub fn open_session(&self, session: u32) -> ProbeSession {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(session, tx);
        ProbeSession {
            id: session,
            sessions: self.sessions.clone(),
            events: rx,
        }
    }

    /// Number of sessions answering probes
    #[must_use]
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Handle an inbound holepunch datagram.
    pub async fn on_probe(&self, datagram: &Datagram) {
        let Ok(probe) = decode::<Probe>(&datagram.payload) else {
            return;
        };
        let Some(tx) = self.sessions.get(&probe.session).map(|tx| tx.clone()) else {
            return;
        };
        if !probe.echo {
            let echo = Probe {
                session: probe.session,
                echo: true,
            };
            if let Ok(bytes) = encode(&echo) {
                let _ = datagram
                    .socket
                    .send_datagram(CHANNEL_HOLEPUNCH, &bytes, datagram.from)
                    .await;
            }
        }
        let _ = tx.send(ProbeEvent {
            from: datagram.from,
            echo: probe.echo,
            socket_id: datagram.socket.id(),
        });
    }

    /// Fire probes for `session` at `candidates` for one round.
    pub async fn fire(&self, socket: &UdpMux, session: u32, candidates: &[SocketAddr]) {
        fire_probes(socket, session, candidates, &self.config).await;
    }
}

impl std::fmt::Debug for Holepuncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Holepuncher")
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

async fn fire_probes(
    socket: &UdpMux,
    session: u32,
    candidates: &[SocketAddr],
    config: &HolepunchConfig,
) {
    let Ok(bytes) = encode(&Probe {
        session,
        echo: false,
    }) else {
        return;
    };
    for _ in 0..config.probes_per_round {
        for candidate in candidates {
            let _ = socket
                .send_datagram(CHANNEL_HOLEPUNCH, &bytes, *candidate)
                .await;
        }
        tokio::time::sleep(config.probe_interval).await;
    }
}

/// Registration of one session with the dispatcher
#[derive(Debug)]
pub struct ProbeSession {
    id: u32,
    sessions: SessionTable,
    events: mpsc::UnboundedReceiver<ProbeEvent>,
}

impl ProbeSession {
    /// Session id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Run one round from `socket`: fire probes at `candidates` and wait up to
    /// the round window for a verified path on that socket.
    pub async fn punch(
        &mut self,
        socket: &UdpMux,
        candidates: &[SocketAddr],
        config: &HolepunchConfig,
    ) -> Option<SocketAddr> {
        let socket_id = socket.id();
        let firing = {
            let socket = socket.clone();
            let candidates = candidates.to_vec();
            let config = config.clone();
            let session = self.id;
            tokio::spawn(async move { fire_probes(&socket, session, &candidates, &config).await })
        };

        let wait = async {
            while let Some(event) = self.events.recv().await {
                if event.socket_id == socket_id {
                    return Some(event.from);
                }
            }
            None
        };
        let verified = tokio::time::timeout(config.round_window, wait)
            .await
            .ok()
            .flatten();
        firing.abort();
        if let Some(remote) = verified {
            tracing::debug!("holepunch session {:08x} verified path to {}", self.id, remote);
        }
        verified
    }
}

impl Drop for ProbeSession {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
    }
}
