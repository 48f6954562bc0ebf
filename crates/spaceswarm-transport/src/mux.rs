//! Socket multiplexer.
//!
//! A [`UdpMux`] owns one bound UDP socket and a background receive task.
//! Stream packets are routed to their [`MuxStream`]; every other channel is
//! handed to the datagram sink as a [`Datagram`].

use crate::packet::StreamHeader;
use crate::stream::{MuxStream, StreamRegistry, StreamShared};
use crate::transport::{Transport, TransportError, TransportResult};
use crate::udp::UdpTransport;
use crate::{CHANNEL_DHT, CHANNEL_HOLEPUNCH, CHANNEL_NAT_PROBE, CHANNEL_STREAM};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// A non-stream datagram received on a mux socket
#[derive(Clone)]
pub struct Datagram {
    /// Channel tag
    pub channel: u8,
    /// Bytes after the channel tag
    pub payload: Vec<u8>,
    /// Sender address
    pub from: SocketAddr,
    /// Socket the datagram arrived on
    pub socket: UdpMux,
}

impl std::fmt::Debug for Datagram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Datagram")
            .field("channel", &self.channel)
            .field("len", &self.payload.len())
            .field("from", &self.from)
            .field("socket", &self.socket.id())
            .finish()
    }
}

struct MuxInner {
    id: u64,
    transport: UdpTransport,
    streams: StreamRegistry,
    sink: mpsc::UnboundedSender<Datagram>,
    shutdown: watch::Sender<bool>,
}

/// One UDP socket shared by DHT traffic and message streams
#[derive(Clone)]
pub struct UdpMux {
    inner: Arc<MuxInner>,
}

impl UdpMux {
    /// Bind a socket and return the receiver for its datagrams.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
    ) -> TransportResult<(Self, mpsc::UnboundedReceiver<Datagram>)> {
        let (sink, rx) = mpsc::unbounded_channel();
        let mux = Self::bind_with_sink(addr, sink).await?;
        Ok((mux, rx))
    }

    /// Bind a socket whose datagrams are fed into an existing sink.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address cannot be bound.
    pub async fn bind_with_sink(
        addr: SocketAddr,
        sink: mpsc::UnboundedSender<Datagram>,
    ) -> TransportResult<Self> {
        Self::bind_shared(addr, sink, StreamRegistry::new()).await
    }

    /// Bind a socket that joins an existing stream registry.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if the address cannot be bound.
    pub async fn bind_shared(
        addr: SocketAddr,
        sink: mpsc::UnboundedSender<Datagram>,
        streams: StreamRegistry,
    ) -> TransportResult<Self> {
        let transport = UdpTransport::bind(addr).await?;
        let (shutdown, _) = watch::channel(false);
        let mux = Self {
            inner: Arc::new(MuxInner {
                id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
                transport,
                streams,
                sink,
                shutdown,
            }),
        };
        tracing::debug!(
            "mux socket {} bound to {:?}",
            mux.id(),
            mux.inner.transport.local_addr().ok()
        );
        tokio::spawn(mux.clone().recv_loop());
        Ok(mux)
    }

    /// Process-unique socket identifier
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Bound local address
    ///
    /// # Errors
    /// Propagates the socket error.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.inner.transport.local_addr()
    }

    /// Send a datagram on a channel.
    ///
    /// # Errors
    /// Fails if the socket is closed or the send fails.
    pub async fn send_datagram(
        &self,
        channel: u8,
        payload: &[u8],
        addr: SocketAddr,
    ) -> TransportResult<()> {
        let mut buf = Vec::with_capacity(1 + payload.len());
        buf.push(channel);
        buf.extend_from_slice(payload);
        self.inner.transport.send_to(&buf, addr).await?;
        Ok(())
    }

    /// Open a new unconnected stream on this socket.
    #[must_use]
    pub fn create_stream(&self) -> MuxStream {
        let (shared, events) =
            StreamShared::spawn(&self.inner.streams, self.inner.transport.clone(), self.inner.id);
        MuxStream::new(shared, events)
    }

    /// Number of live streams carried by this socket
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.streams.on_socket(self.inner.id).len()
    }

    /// Registry this socket resolves stream ids in
    #[must_use]
    pub fn registry(&self) -> &StreamRegistry {
        &self.inner.streams
    }

    pub(crate) fn transport(&self) -> &UdpTransport {
        &self.inner.transport
    }

    /// True after [`close`](Self::close)
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.transport.is_closed()
    }

    /// Reset every stream and stop the receive task.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        for stream in self.inner.streams.on_socket(self.inner.id) {
            stream.reset().await;
        }
        let _ = self.inner.shutdown.send(true);
        let _ = self.inner.transport.close().await;
        tracing::debug!("mux socket {} closed", self.id());
    }

    async fn recv_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut buf = vec![0u8; 65536];
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = self.inner.transport.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.dispatch(&buf[..len], from).await,
                    Err(TransportError::Closed) => break,
                    Err(e) => {
                        tracing::trace!("mux socket {} receive error: {}", self.id(), e);
                    }
                },
            }
        }
    }

    async fn dispatch(&self, buf: &[u8], from: SocketAddr) {
        let Some((&channel, body)) = buf.split_first() else {
            return;
        };
        match channel {
            CHANNEL_STREAM => {
                let Some((header, payload)) = StreamHeader::decode(body) else {
                    return;
                };
                if let Some(stream) = self.inner.streams.get(header.stream_id) {
                    stream.on_packet(header, payload, from).await;
                }
            }
            CHANNEL_DHT | CHANNEL_HOLEPUNCH | CHANNEL_NAT_PROBE => {
                let _ = self.inner.sink.send(Datagram {
                    channel,
                    payload: body.to_vec(),
                    from,
                    socket: self.clone(),
                });
            }
            other => {
                tracing::trace!("dropping datagram with unknown channel {} from {}", other, from);
            }
        }
    }
}
