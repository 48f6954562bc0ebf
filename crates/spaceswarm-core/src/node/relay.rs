//! Blind relaying between two peers that cannot reach each other.
//!
//! Both peers open an encrypted connection to the relay node and ask it to
//! pair a channel under a shared token. The relay matches one initiator with
//! one responder and forwards frames between them without reading the
//! end-to-end ciphertext inside. One connection to a relay carries any number
//! of channels.

use crate::node::connection::Connection;
use crate::node::error::{NodeError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use spaceswarm_crypto::PublicKey;
use spaceswarm_transport::{RawStream, TransportError, TransportResult};
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

/// Bytes reserved for the frame envelope inside one connection message
pub const RELAY_FRAME_OVERHEAD: usize = 32;

/// How long a channel waits for its counterpart at the relay
pub const PAIR_TIMEOUT: Duration = Duration::from_secs(20);

/// Unpaired channels a relay keeps at once
const MAX_WAITING: usize = 1024;

/// Messages exchanged with a relay node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum RelayFrame {
    /// Ask the relay to pair `channel` with the opposite side of `token`
    Pair {
        channel: u32,
        token: [u8; 32],
        initiator: bool,
    },
    /// Relay found the counterpart
    Paired { channel: u32 },
    /// Payload for the paired channel
    Data { channel: u32, payload: Vec<u8> },
    /// Sender finished writing
    End { channel: u32 },
    /// Channel aborted
    Reset { channel: u32 },
}

impl RelayFrame {
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| NodeError::Protocol(e.to_string().into()))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| NodeError::Protocol(e.to_string().into()))
    }
}

// ============================================================================
// Relay node side
// ============================================================================

struct Waiting {
    connection: Connection,
    channel: u32,
    initiator: bool,
    since: Instant,
}

#[derive(Clone)]
struct Route {
    connection: Connection,
    channel: u32,
}

/// Pairs channels by token and forwards frames between them
#[derive(Default)]
pub(crate) struct RelayService {
    waiting: Mutex<HashMap<[u8; 32], Waiting>>,
    routes: DashMap<(u64, u32), Route>,
}

impl RelayService {
    /// Serve one inbound connection until it closes.
    pub(crate) async fn serve(self: Arc<Self>, connection: Connection) {
        tracing::debug!(
            "relaying for {}",
            hex::encode(&connection.remote_public_key().as_bytes()[..8])
        );
        while let Ok(Some(bytes)) = connection.read().await {
            let frame = match RelayFrame::decode(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("dropping malformed relay frame: {}", e);
                    continue;
                }
            };
            match frame {
                RelayFrame::Pair {
                    channel,
                    token,
                    initiator,
                } => self.pair(&connection, channel, token, initiator).await,
                RelayFrame::Data { channel, payload } => {
                    self.forward(&connection, channel, |channel| RelayFrame::Data {
                        channel,
                        payload,
                    })
                    .await;
                }
                RelayFrame::End { channel } => {
                    self.forward(&connection, channel, |channel| RelayFrame::End { channel })
                        .await;
                }
                RelayFrame::Reset { channel } => self.reset(&connection, channel).await,
                RelayFrame::Paired { .. } => {}
            }
        }
        self.drop_connection(&connection).await;
    }

    async fn pair(&self, connection: &Connection, channel: u32, token: [u8; 32], initiator: bool) {
        let matched = {
            let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
            waiting.retain(|_, w| w.since.elapsed() < PAIR_TIMEOUT && !w.connection.is_closed());
            match waiting.remove(&token) {
                Some(other) if other.initiator != initiator => Some(other),
                _ => {
                    if waiting.len() >= MAX_WAITING {
                        None
                    } else {
                        waiting.insert(
                            token,
                            Waiting {
                                connection: connection.clone(),
                                channel,
                                initiator,
                                since: Instant::now(),
                            },
                        );
                        return;
                    }
                }
            }
        };
        let Some(other) = matched else {
            tracing::warn!("relay waiting table full, refusing channel {}", channel);
            send_frame(connection, &RelayFrame::Reset { channel }).await;
            return;
        };

        self.routes.insert(
            (connection.id(), channel),
            Route {
                connection: other.connection.clone(),
                channel: other.channel,
            },
        );
        self.routes.insert(
            (other.connection.id(), other.channel),
            Route {
                connection: connection.clone(),
                channel,
            },
        );
        tracing::debug!("relay paired channels {} and {}", channel, other.channel);
        send_frame(connection, &RelayFrame::Paired { channel }).await;
        send_frame(
            &other.connection,
            &RelayFrame::Paired {
                channel: other.channel,
            },
        )
        .await;
    }

    async fn forward(
        &self,
        connection: &Connection,
        channel: u32,
        frame: impl FnOnce(u32) -> RelayFrame,
    ) {
        let Some(route) = self
            .routes
            .get(&(connection.id(), channel))
            .map(|r| r.value().clone())
        else {
            send_frame(connection, &RelayFrame::Reset { channel }).await;
            return;
        };
        send_frame(&route.connection, &frame(route.channel)).await;
    }

    async fn reset(&self, connection: &Connection, channel: u32) {
        {
            let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
            waiting.retain(|_, w| !(w.connection.id() == connection.id() && w.channel == channel));
        }
        if let Some((_, route)) = self.routes.remove(&(connection.id(), channel)) {
            self.routes.remove(&(route.connection.id(), route.channel));
            send_frame(
                &route.connection,
                &RelayFrame::Reset {
                    channel: route.channel,
                },
            )
            .await;
        }
    }

    async fn drop_connection(&self, connection: &Connection) {
        {
            let mut waiting = self.waiting.lock().unwrap_or_else(|e| e.into_inner());
            waiting.retain(|_, w| w.connection.id() != connection.id());
        }
        let channels: Vec<u32> = self
            .routes
            .iter()
            .filter(|entry| entry.key().0 == connection.id())
            .map(|entry| entry.key().1)
            .collect();
        for channel in channels {
            self.reset(connection, channel).await;
        }
    }

    /// Channels currently paired
    pub(crate) fn paired_channels(&self) -> usize {
        self.routes.len() / 2
    }
}

async fn send_frame(connection: &Connection, frame: &RelayFrame) {
    match frame.encode() {
        Ok(bytes) => {
            if let Err(e) = connection.send_message(&bytes).await {
                tracing::trace!("relay frame to connection {} lost: {}", connection.id(), e);
            }
        }
        Err(e) => tracing::warn!("could not encode relay frame: {}", e),
    }
}

// ============================================================================
// Peer side
// ============================================================================

enum ChannelEvent {
    Data(Vec<u8>),
    End,
    Reset,
}

struct RelayLink {
    connection: Connection,
    channels: DashMap<u32, mpsc::UnboundedSender<ChannelEvent>>,
    pending: DashMap<u32, oneshot::Sender<()>>,
    next_channel: AtomicU32,
}

impl RelayLink {
    fn start(connection: Connection) -> Arc<Self> {
        let link = Arc::new(Self {
            connection,
            channels: DashMap::new(),
            pending: DashMap::new(),
            next_channel: AtomicU32::new(1),
        });
        tokio::spawn(Arc::clone(&link).read_loop());
        link
    }

    async fn read_loop(self: Arc<Self>) {
        while let Ok(Some(bytes)) = self.connection.read().await {
            let Ok(frame) = RelayFrame::decode(&bytes) else {
                continue;
            };
            match frame {
                RelayFrame::Paired { channel } => {
                    if let Some((_, waiter)) = self.pending.remove(&channel) {
                        let _ = waiter.send(());
                    }
                }
                RelayFrame::Data { channel, payload } => {
                    self.deliver(channel, ChannelEvent::Data(payload));
                }
                RelayFrame::End { channel } => self.deliver(channel, ChannelEvent::End),
                RelayFrame::Reset { channel } => {
                    self.pending.remove(&channel);
                    if let Some((_, tx)) = self.channels.remove(&channel) {
                        let _ = tx.send(ChannelEvent::Reset);
                    }
                }
                RelayFrame::Pair { .. } => {}
            }
        }
        tracing::debug!("relay link {} closed", self.connection.id());
        self.pending.clear();
        for entry in self.channels.iter() {
            let _ = entry.value().send(ChannelEvent::Reset);
        }
        self.channels.clear();
        self.connection.destroy().await;
    }

    fn deliver(&self, channel: u32, event: ChannelEvent) {
        if let Some(tx) = self.channels.get(&channel) {
            let _ = tx.send(event);
        }
    }

    async fn send(&self, frame: &RelayFrame) -> Result<()> {
        self.connection.send_message(&frame.encode()?).await
    }

    async fn open(self: &Arc<Self>, token: [u8; 32], initiator: bool) -> Result<RelayChannel> {
        let channel = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let (paired_tx, paired_rx) = oneshot::channel();
        self.channels.insert(channel, tx);
        self.pending.insert(channel, paired_tx);

        let paired = async {
            self.send(&RelayFrame::Pair {
                channel,
                token,
                initiator,
            })
            .await?;
            match tokio::time::timeout(PAIR_TIMEOUT, paired_rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(NodeError::ConnectionClosed),
                Err(_) => Err(NodeError::timeout("relay pairing")),
            }
        };
        if let Err(e) = paired.await {
            self.pending.remove(&channel);
            self.channels.remove(&channel);
            let _ = self.send(&RelayFrame::Reset { channel }).await;
            return Err(e);
        }
        tracing::debug!(
            "relay channel {} paired via {}",
            channel,
            hex::encode(&self.connection.remote_public_key().as_bytes()[..8])
        );
        Ok(RelayChannel {
            link: Arc::clone(self),
            channel,
            events: tokio::sync::Mutex::new(rx),
            ended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }
}

/// Connections to relay nodes, one per relay key
#[derive(Default)]
pub(crate) struct RelayClient {
    links: tokio::sync::Mutex<HashMap<PublicKey, Arc<RelayLink>>>,
}

impl RelayClient {
    /// Open a channel through `relay_key`, connecting to it first if needed.
    pub(crate) async fn channel<F>(
        &self,
        relay_key: PublicKey,
        token: [u8; 32],
        initiator: bool,
        connect: F,
    ) -> Result<RelayChannel>
    where
        F: Future<Output = Result<Connection>>,
    {
        let link = {
            let mut links = self.links.lock().await;
            match links.get(&relay_key).filter(|l| !l.connection.is_closed()) {
                Some(link) => Arc::clone(link),
                None => {
                    let link = RelayLink::start(connect.await?);
                    links.insert(relay_key, Arc::clone(&link));
                    link
                }
            }
        };
        link.open(token, initiator).await
    }

    /// Tear down every relay link.
    pub(crate) async fn close(&self) {
        let links: Vec<Arc<RelayLink>> = self.links.lock().await.drain().map(|(_, l)| l).collect();
        for link in links {
            link.connection.destroy().await;
        }
    }
}

/// One paired channel through a relay, usable as a raw stream
pub struct RelayChannel {
    link: Arc<RelayLink>,
    channel: u32,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelEvent>>,
    ended: AtomicBool,
    closed: AtomicBool,
}

impl RelayChannel {
    /// Key of the relay node
    #[must_use]
    pub fn relay_key(&self) -> PublicKey {
        self.link.connection.remote_public_key()
    }
}

fn transport_error(err: NodeError) -> TransportError {
    match err {
        NodeError::ConnectionClosed => TransportError::Closed,
        NodeError::Timeout(_) => TransportError::TimedOut,
        other => TransportError::Io(std::io::Error::other(other.to_string())),
    }
}

#[async_trait]
impl RawStream for RelayChannel {
    async fn send(&self, message: &[u8]) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let max = self.max_message_size();
        if message.len() > max {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                max,
            });
        }
        self.link
            .send(&RelayFrame::Data {
                channel: self.channel,
                payload: message.to_vec(),
            })
            .await
            .map_err(transport_error)
    }

    async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        if self.ended.load(Ordering::Acquire) {
            return Ok(None);
        }
        let mut events = self.events.lock().await;
        match events.recv().await {
            Some(ChannelEvent::Data(payload)) => Ok(Some(payload)),
            Some(ChannelEvent::End) => {
                self.ended.store(true, Ordering::Release);
                Ok(None)
            }
            Some(ChannelEvent::Reset) | None => Err(TransportError::Reset),
        }
    }

    async fn end(&self) -> TransportResult<()> {
        self.link
            .send(&RelayFrame::End {
                channel: self.channel,
            })
            .await
            .map_err(transport_error)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.channels.remove(&self.channel);
        let _ = self
            .link
            .send(&RelayFrame::Reset {
                channel: self.channel,
            })
            .await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn max_message_size(&self) -> usize {
        self.link
            .connection
            .max_message_size()
            .saturating_sub(RELAY_FRAME_OVERHEAD)
    }

    fn last_activity(&self) -> Instant {
        self.link.connection.last_activity()
    }

    async fn ping(&self) -> TransportResult<()> {
        self.link.connection.ping().await.map_err(transport_error)
    }

    fn socket_id(&self) -> Option<u64> {
        self.link.connection.raw_socket_id()
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.channels.remove(&self.channel);
        let link = Arc::clone(&self.link);
        let channel = self.channel;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = link.send(&RelayFrame::Reset { channel }).await;
            });
        }
    }
}

impl std::fmt::Debug for RelayChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayChannel")
            .field("channel", &self.channel)
            .field("relay", &self.relay_key())
            .finish()
    }
}
