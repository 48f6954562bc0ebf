//! Reliable ordered message streams over a [`UdpMux`](crate::mux::UdpMux).
//!
//! Each message travels in one datagram. Reliable packets (data and end) carry
//! a sequence number and are retransmitted every [`RETRANSMIT_TIMEOUT`] until
//! acknowledged; after [`MAX_RETRANSMITS`] attempts the stream fails with
//! [`TransportError::TimedOut`]. At most [`SEND_WINDOW`] packets are in flight.
//!
//! A stream is created with a local id and later connected to the remote id.
//! If no remote address is given at connect time the stream adopts the source
//! address of the first packet that reaches it.

use crate::mux::UdpMux;
use crate::packet::{PacketKind, StreamHeader};
use crate::transport::{Transport, TransportError, TransportResult};
use crate::udp::UdpTransport;
use crate::MAX_STREAM_PAYLOAD;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};

/// Retransmission timeout for unacknowledged packets
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(200);

/// Attempts before a stream is declared dead
pub const MAX_RETRANSMITS: u8 = 10;

/// Maximum unacknowledged packets in flight
pub const SEND_WINDOW: usize = 64;

/// Packets further ahead than this are dropped unacknowledged
const MAX_REORDER: u32 = 1024;

#[derive(Default)]
struct RegistryInner {
    table: DashMap<u32, Arc<StreamShared>>,
    next_id: AtomicU32,
}

/// Stream id space shared by a group of mux sockets.
///
/// A stream registered here receives packets arriving on any socket of the
/// group, and can be moved to another socket of the group when it connects.
#[derive(Clone, Default)]
pub struct StreamRegistry {
    inner: Arc<RegistryInner>,
}

impl StreamRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live streams
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    /// True when no stream is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }

    fn allocate_id(&self) -> u32 {
        // Zero is never handed out.
        loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 && !self.inner.table.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn get(&self, id: u32) -> Option<Arc<StreamShared>> {
        self.inner.table.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn on_socket(&self, socket_id: u64) -> Vec<Arc<StreamShared>> {
        self.inner
            .table
            .iter()
            .filter(|entry| entry.value().socket_id() == socket_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

#[derive(Debug)]
pub(crate) enum StreamEvent {
    Data(Vec<u8>),
    End,
    Reset,
    TimedOut,
    Closed,
}

struct Unacked {
    packet: Vec<u8>,
    sent_at: Instant,
    attempts: u8,
}

#[derive(Default)]
struct StreamState {
    remote_id: Option<u32>,
    next_seq: u32,
    unacked: BTreeMap<u32, Unacked>,
    recv_next: u32,
    reorder: BTreeMap<u32, (PacketKind, Vec<u8>)>,
    local_ended: bool,
    remote_ended: bool,
    failure: Option<Failure>,
}

#[derive(Debug, Clone, Copy)]
enum Failure {
    Closed,
    Reset,
    TimedOut,
}

impl From<Failure> for TransportError {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Closed => TransportError::Closed,
            Failure::Reset => TransportError::Reset,
            Failure::TimedOut => TransportError::TimedOut,
        }
    }
}

impl StreamState {
    fn is_finished(&self) -> bool {
        self.failure.is_some()
            || (self.local_ended && self.remote_ended && self.unacked.is_empty())
    }
}

pub(crate) struct StreamShared {
    local_id: u32,
    transport: RwLock<(UdpTransport, u64)>,
    registry: Weak<RegistryInner>,
    remote: RwLock<Option<SocketAddr>>,
    state: Mutex<StreamState>,
    events: mpsc::UnboundedSender<StreamEvent>,
    window: Semaphore,
    flushed: Notify,
    created: Instant,
    activity_ms: AtomicU64,
}

impl StreamShared {
    pub(crate) fn spawn(
        registry: &StreamRegistry,
        transport: UdpTransport,
        socket_id: u64,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StreamEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let local_id = registry.allocate_id();
        let shared = Arc::new(Self {
            local_id,
            transport: RwLock::new((transport, socket_id)),
            registry: Arc::downgrade(&registry.inner),
            remote: RwLock::new(None),
            state: Mutex::new(StreamState::default()),
            events,
            window: Semaphore::new(SEND_WINDOW),
            flushed: Notify::new(),
            created: Instant::now(),
            activity_ms: AtomicU64::new(0),
        });
        registry.inner.table.insert(local_id, Arc::clone(&shared));

        let weak = Arc::downgrade(&shared);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RETRANSMIT_TIMEOUT / 2);
            loop {
                tick.tick().await;
                let Some(stream) = weak.upgrade() else { break };
                if !stream.retransmit_tick().await {
                    break;
                }
            }
        });

        (shared, rx)
    }

    pub(crate) fn socket_id(&self) -> u64 {
        self.transport.read().map(|guard| guard.1).unwrap_or_default()
    }

    fn rehome(&self, transport: UdpTransport, socket_id: u64) {
        if let Ok(mut guard) = self.transport.write() {
            *guard = (transport, socket_id);
        }
    }

    fn remote(&self) -> Option<SocketAddr> {
        self.remote.read().ok().and_then(|guard| *guard)
    }

    fn set_remote(&self, addr: SocketAddr) {
        if let Ok(mut guard) = self.remote.write() {
            *guard = Some(addr);
        }
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.activity_ms.store(elapsed, Ordering::Relaxed);
    }

    pub(crate) fn last_activity(&self) -> Instant {
        self.created + Duration::from_millis(self.activity_ms.load(Ordering::Relaxed))
    }

    fn detach(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.table.remove(&self.local_id);
        }
    }

    fn fail(&self, state: &mut StreamState, failure: Failure) {
        if state.failure.is_some() {
            return;
        }
        state.failure = Some(failure);
        let event = match failure {
            Failure::Closed => StreamEvent::Closed,
            Failure::Reset => StreamEvent::Reset,
            Failure::TimedOut => StreamEvent::TimedOut,
        };
        let _ = self.events.send(event);
        self.window.close();
        self.flushed.notify_waiters();
        self.detach();
    }

    fn release(&self, state: &mut StreamState, acked: impl Fn(u32) -> bool) {
        let before = state.unacked.len();
        state.unacked.retain(|seq, _| !acked(*seq));
        let released = before - state.unacked.len();
        if released > 0 {
            self.window.add_permits(released);
        }
        if state.unacked.is_empty() {
            self.flushed.notify_waiters();
        }
    }

    async fn send_raw(&self, packet: &[u8], remote: SocketAddr) {
        let Some(transport) = self.transport.read().ok().map(|guard| guard.0.clone()) else {
            return;
        };
        if let Err(e) = transport.send_to(packet, remote).await {
            tracing::trace!("stream {} send to {} failed: {}", self.local_id, remote, e);
        }
    }

    pub(crate) async fn on_packet(&self, header: StreamHeader, payload: &[u8], from: SocketAddr) {
        let mut state = self.state.lock().await;
        if state.failure.is_some() {
            return;
        }
        // Packets before connect cannot be acknowledged; the sender retransmits.
        let Some(remote_id) = state.remote_id else {
            return;
        };
        match self.remote() {
            Some(remote) if remote != from => return,
            Some(_) => {}
            None => {
                tracing::debug!("stream {} adopted remote {}", self.local_id, from);
                self.set_remote(from);
            }
        }
        self.touch();
        self.release(&mut state, |seq| seq < header.ack);

        match header.kind {
            PacketKind::Data | PacketKind::End => {
                let seq = header.seq;
                if seq >= state.recv_next {
                    if seq - state.recv_next >= MAX_REORDER {
                        return;
                    }
                    state.reorder.insert(seq, (header.kind, payload.to_vec()));
                    loop {
                        let next = state.recv_next;
                        let Some((kind, data)) = state.reorder.remove(&next) else {
                            break;
                        };
                        state.recv_next += 1;
                        if kind == PacketKind::End {
                            state.remote_ended = true;
                            let _ = self.events.send(StreamEvent::End);
                        } else {
                            let _ = self.events.send(StreamEvent::Data(data));
                        }
                    }
                }
                let ack = StreamHeader {
                    kind: PacketKind::Ack,
                    stream_id: remote_id,
                    seq,
                    ack: state.recv_next,
                }
                .encode(&[]);
                self.send_raw(&ack, from).await;
            }
            PacketKind::Ack => {
                let seq = header.seq;
                self.release(&mut state, |s| s == seq);
            }
            PacketKind::Reset => {
                tracing::debug!("stream {} reset by {}", self.local_id, from);
                self.fail(&mut state, Failure::Reset);
                return;
            }
            PacketKind::Ping => {
                let pong = StreamHeader {
                    kind: PacketKind::Pong,
                    stream_id: remote_id,
                    seq: 0,
                    ack: state.recv_next,
                }
                .encode(&[]);
                self.send_raw(&pong, from).await;
            }
            PacketKind::Pong => {}
        }

        if state.is_finished() {
            self.detach();
        }
    }

    async fn retransmit_tick(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.failure.is_some() {
            return false;
        }
        if state.is_finished() {
            self.detach();
            return false;
        }
        let Some(remote) = self.remote() else {
            return true;
        };

        let now = Instant::now();
        let mut resend = Vec::new();
        let mut exhausted = false;
        for unacked in state.unacked.values_mut() {
            if now.duration_since(unacked.sent_at) < RETRANSMIT_TIMEOUT {
                continue;
            }
            if unacked.attempts >= MAX_RETRANSMITS {
                exhausted = true;
                break;
            }
            unacked.attempts += 1;
            unacked.sent_at = now;
            resend.push(unacked.packet.clone());
        }
        if exhausted {
            tracing::debug!("stream {} to {} timed out", self.local_id, remote);
            self.fail(&mut state, Failure::TimedOut);
            return false;
        }
        drop(state);

        for packet in resend {
            self.send_raw(&packet, remote).await;
        }
        true
    }

    async fn send_reliable(&self, kind: PacketKind, payload: &[u8]) -> TransportResult<()> {
        if payload.len() > MAX_STREAM_PAYLOAD {
            return Err(TransportError::MessageTooLarge {
                size: payload.len(),
                max: MAX_STREAM_PAYLOAD,
            });
        }

        let permit = match self.window.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let state = self.state.lock().await;
                return Err(state.failure.unwrap_or(Failure::Closed).into());
            }
        };
        permit.forget();

        let mut state = self.state.lock().await;
        let checked = if let Some(failure) = state.failure {
            Err(failure.into())
        } else if state.local_ended {
            Err(TransportError::Ended)
        } else {
            match (self.remote(), state.remote_id) {
                (Some(remote), Some(remote_id)) => Ok((remote, remote_id)),
                _ => Err(TransportError::NotConnected),
            }
        };
        let (remote, remote_id) = match checked {
            Ok(target) => target,
            Err(e) => {
                self.window.add_permits(1);
                return Err(e);
            }
        };

        let seq = state.next_seq;
        state.next_seq += 1;
        if kind == PacketKind::End {
            state.local_ended = true;
        }
        let packet = StreamHeader {
            kind,
            stream_id: remote_id,
            seq,
            ack: state.recv_next,
        }
        .encode(payload);
        state.unacked.insert(
            seq,
            Unacked {
                packet: packet.clone(),
                sent_at: Instant::now(),
                attempts: 1,
            },
        );
        drop(state);

        self.send_raw(&packet, remote).await;
        Ok(())
    }

    async fn send_unreliable(&self, kind: PacketKind) -> TransportResult<()> {
        let state = self.state.lock().await;
        if let Some(failure) = state.failure {
            return Err(failure.into());
        }
        let (Some(remote), Some(remote_id)) = (self.remote(), state.remote_id) else {
            return Err(TransportError::NotConnected);
        };
        let packet = StreamHeader {
            kind,
            stream_id: remote_id,
            seq: 0,
            ack: state.recv_next,
        }
        .encode(&[]);
        drop(state);
        self.send_raw(&packet, remote).await;
        Ok(())
    }

    pub(crate) async fn reset(&self) {
        let mut state = self.state.lock().await;
        if state.failure.is_some() {
            return;
        }
        if let (Some(remote), Some(remote_id)) = (self.remote(), state.remote_id) {
            let packet = StreamHeader {
                kind: PacketKind::Reset,
                stream_id: remote_id,
                seq: 0,
                ack: state.recv_next,
            }
            .encode(&[]);
            self.send_raw(&packet, remote).await;
        }
        self.fail(&mut state, Failure::Closed);
    }
}

struct Reader {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    terminal: Option<TransportResult<()>>,
}

/// One reliable ordered message stream on a mux socket
pub struct MuxStream {
    shared: Arc<StreamShared>,
    reader: Mutex<Reader>,
}

impl MuxStream {
    pub(crate) fn new(shared: Arc<StreamShared>, events: mpsc::UnboundedReceiver<StreamEvent>) -> Self {
        Self {
            shared,
            reader: Mutex::new(Reader {
                events,
                terminal: None,
            }),
        }
    }

    /// Local stream id, given to the remote side during signaling
    #[must_use]
    pub fn id(&self) -> u32 {
        self.shared.local_id
    }

    /// Identifier of the mux socket carrying this stream
    #[must_use]
    pub fn socket_id(&self) -> u64 {
        self.shared.socket_id()
    }

    /// Bind the stream to the remote stream id.
    ///
    /// With `remote = None` the first packet's source address is adopted.
    pub async fn connect(&self, remote: Option<SocketAddr>, remote_id: u32) {
        let mut state = self.shared.state.lock().await;
        state.remote_id = Some(remote_id);
        if let Some(addr) = remote {
            self.shared.set_remote(addr);
        }
        self.shared.touch();
    }

    /// Move the stream onto `mux` and bind it to the remote stream id.
    ///
    /// `mux` must share this stream's registry, otherwise replies never reach it.
    pub async fn connect_via(&self, mux: &UdpMux, remote: Option<SocketAddr>, remote_id: u32) {
        self.shared.rehome(mux.transport().clone(), mux.id());
        self.connect(remote, remote_id).await;
    }

    /// Send one message reliably.
    ///
    /// # Errors
    /// Fails if the message is larger than [`MAX_STREAM_PAYLOAD`], the stream
    /// is not connected, was ended, or has failed.
    pub async fn send(&self, message: &[u8]) -> TransportResult<()> {
        self.shared.send_reliable(PacketKind::Data, message).await
    }

    /// Receive the next message. `Ok(None)` once the remote has ended.
    ///
    /// # Errors
    /// Returns the failure that terminated the stream.
    pub async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        let mut reader = self.reader.lock().await;
        if let Some(terminal) = &reader.terminal {
            return match terminal {
                Ok(()) => Ok(None),
                Err(e) => Err(clone_error(e)),
            };
        }
        let outcome = match reader.events.recv().await {
            Some(StreamEvent::Data(data)) => return Ok(Some(data)),
            Some(StreamEvent::End) => Ok(()),
            Some(StreamEvent::Reset) => Err(TransportError::Reset),
            Some(StreamEvent::TimedOut) => Err(TransportError::TimedOut),
            Some(StreamEvent::Closed) | None => Err(TransportError::Closed),
        };
        let result = match &outcome {
            Ok(()) => Ok(None),
            Err(e) => Err(clone_error(e)),
        };
        reader.terminal = Some(outcome);
        result
    }

    /// Half-close the stream for writing.
    ///
    /// # Errors
    /// Fails if the stream is not connected or already failed.
    pub async fn end(&self) -> TransportResult<()> {
        self.shared.send_reliable(PacketKind::End, &[]).await
    }

    /// Send a keep-alive probe.
    ///
    /// # Errors
    /// Fails if the stream is not connected or already failed.
    pub async fn ping(&self) -> TransportResult<()> {
        self.shared.send_unreliable(PacketKind::Ping).await
    }

    /// Wait until every sent packet is acknowledged or the stream fails.
    pub async fn flushed(&self) {
        loop {
            let notified = self.shared.flushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.shared.state.lock().await;
                if state.unacked.is_empty() || state.failure.is_some() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Abort the stream and notify the remote.
    pub async fn close(&self) {
        self.shared.reset().await;
    }

    /// Current remote address, if known
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.shared.remote()
    }

    /// Time of the last packet received from the remote
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.shared.last_activity()
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let shared = Arc::clone(&self.shared);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                // An ended stream may still be draining its last packets.
                let deadline = Instant::now() + RETRANSMIT_TIMEOUT * u32::from(MAX_RETRANSMITS);
                loop {
                    {
                        let state = shared.state.lock().await;
                        if !state.local_ended
                            || state.unacked.is_empty()
                            || state.failure.is_some()
                            || Instant::now() >= deadline
                        {
                            break;
                        }
                    }
                    tokio::time::sleep(RETRANSMIT_TIMEOUT).await;
                }
                shared.reset().await;
            });
        }
    }
}

fn clone_error(err: &TransportError) -> TransportError {
    match err {
        TransportError::Reset => TransportError::Reset,
        TransportError::TimedOut => TransportError::TimedOut,
        _ => TransportError::Closed,
    }
}
