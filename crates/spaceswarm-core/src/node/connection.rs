//! Encrypted peer connections and keep-alive.
//!
//! A [`Connection`] owns a [`SecretStream`] and a watch channel that flips
//! once the connection is torn down. Teardown happens on `destroy`, on a
//! stream failure, once both directions have ended, or when keep-alive sees
//! no inbound traffic for [`KEEP_ALIVE_MISSES`] intervals.

use crate::node::error::{NodeError, Result};
use crate::secret_stream::SecretStream;
use spaceswarm_crypto::PublicKey;
use spaceswarm_transport::{MuxStream, RawStream, UdpMux};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;

/// Silent keep-alive intervals tolerated before teardown
pub const KEEP_ALIVE_MISSES: u32 = 4;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How the connection reached the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionMode {
    /// Peer was reachable without punching
    Direct,
    /// Path opened by holepunching
    Holepunched,
    /// Bytes travel through a relay peer
    Relayed,
    /// Same host or same LAN
    Local,
}

type CloseHook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Lifecycle {
    local_ended: bool,
    remote_ended: bool,
    hooks: Vec<CloseHook>,
}

struct ConnectionInner {
    id: u64,
    stream: SecretStream,
    mode: ConnectionMode,
    keep_alive: Option<Duration>,
    socket: Option<UdpMux>,
    lifecycle: Mutex<Lifecycle>,
    closed: watch::Sender<bool>,
}

impl ConnectionInner {
    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark closed and run the close hooks, once.
    fn finalize(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let hooks = std::mem::take(&mut self.lifecycle().hooks);
        tracing::debug!(
            "connection {} to {} closed",
            self.id,
            hex::encode(&self.stream.remote_public_key().as_bytes()[..8])
        );
        for hook in hooks {
            hook();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// An authenticated, encrypted connection to a peer
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub(crate) fn new(
        stream: SecretStream,
        mode: ConnectionMode,
        keep_alive: Option<Duration>,
        socket: Option<UdpMux>,
    ) -> Self {
        let keep_alive = keep_alive.filter(|d| !d.is_zero());
        let (closed, _) = watch::channel(false);
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                stream,
                mode,
                keep_alive,
                socket,
                lifecycle: Mutex::new(Lifecycle::default()),
                closed,
            }),
        };
        // In-process pairs have no path to keep alive.
        let has_path = connection.inner.stream.raw().remote_addr().is_some()
            || mode == ConnectionMode::Relayed;
        if let Some(interval) = keep_alive.filter(|_| has_path) {
            tokio::spawn(keep_alive_loop(Arc::downgrade(&connection.inner), interval));
        }
        connection
    }

    /// Process-unique connection id
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Our key on this connection
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.inner.stream.public_key()
    }

    /// Authenticated key of the peer
    #[must_use]
    pub fn remote_public_key(&self) -> PublicKey {
        self.inner.stream.remote_public_key()
    }

    /// How the peer was reached
    #[must_use]
    pub fn mode(&self) -> ConnectionMode {
        self.inner.mode
    }

    /// Keep-alive interval, `None` when disabled
    #[must_use]
    pub fn keep_alive(&self) -> Option<Duration> {
        self.inner.keep_alive
    }

    /// Peer address of the underlying path, if it has one
    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.stream.raw().remote_addr()
    }

    /// Identifier of the UDP socket carrying the connection
    #[must_use]
    pub fn raw_socket_id(&self) -> Option<u64> {
        self.inner.stream.raw().socket_id()
    }

    /// Largest payload [`send_message`](Self::send_message) accepts
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.inner.stream.max_message_size()
    }

    /// True once the connection is torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Write `data`, split into messages as needed.
    ///
    /// # Errors
    /// [`NodeError::ConnectionClosed`] after teardown or a stream failure.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.check_open()?;
        let result = self.inner.stream.write(data).await;
        self.on_result(result)
    }

    /// Send one message of at most [`max_message_size`](Self::max_message_size) bytes.
    ///
    /// # Errors
    /// As [`write`](Self::write), plus an oversized message.
    pub async fn send_message(&self, message: &[u8]) -> Result<()> {
        self.check_open()?;
        let result = self.inner.stream.send(message).await;
        self.on_result(result)
    }

    /// Read the next message; `None` once the peer ended its side.
    ///
    /// # Errors
    /// [`NodeError::ConnectionClosed`] after teardown or a stream failure.
    pub async fn read(&self) -> Result<Option<Vec<u8>>> {
        if self.is_closed() && !self.inner.lifecycle().remote_ended {
            return Err(NodeError::ConnectionClosed);
        }
        let mut closed = self.inner.closed.subscribe();
        let result = tokio::select! {
            result = self.inner.stream.recv() => result,
            _ = closed.wait_for(|c| *c) => return Err(NodeError::ConnectionClosed),
        };
        match result {
            Ok(Some(message)) => Ok(Some(message)),
            Ok(None) => {
                let both = {
                    let mut lifecycle = self.inner.lifecycle();
                    lifecycle.remote_ended = true;
                    lifecycle.local_ended
                };
                if both {
                    self.inner.finalize();
                }
                Ok(None)
            }
            Err(e) => {
                self.inner.finalize();
                Err(e)
            }
        }
    }

    /// Half-close: the peer reads end-of-stream after our last write.
    ///
    /// # Errors
    /// [`NodeError::ConnectionClosed`] after teardown.
    pub async fn end(&self) -> Result<()> {
        self.check_open()?;
        let result = self.inner.stream.end().await;
        self.on_result(result)?;
        let both = {
            let mut lifecycle = self.inner.lifecycle();
            lifecycle.local_ended = true;
            lifecycle.remote_ended
        };
        if both {
            self.inner.finalize();
        }
        Ok(())
    }

    /// Abort both directions immediately.
    pub async fn destroy(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.stream.close().await;
        self.inner.finalize();
    }

    /// Resolve once the connection is torn down.
    pub async fn closed(&self) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|c| *c).await;
    }

    /// Point `raw` at the peer over this connection's socket.
    ///
    /// `raw` must come from the same node, e.g. `Node::create_raw_stream`.
    ///
    /// # Errors
    /// [`NodeError::Transport`] if the connection has no UDP path.
    pub async fn connect_raw_stream(&self, raw: &MuxStream, remote_id: u32) -> Result<()> {
        let (Some(socket), Some(remote)) = (&self.inner.socket, self.remote_addr()) else {
            return Err(NodeError::Transport("connection has no udp path".into()));
        };
        raw.connect_via(socket, Some(remote), remote_id).await;
        Ok(())
    }

    /// Run `hook` once when the connection closes.
    pub(crate) fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        if self.is_closed() {
            hook();
            return;
        }
        self.inner.lifecycle().hooks.push(Box::new(hook));
    }

    pub(crate) fn last_activity(&self) -> std::time::Instant {
        self.inner.stream.raw().last_activity()
    }

    pub(crate) async fn ping(&self) -> Result<()> {
        self.inner.stream.raw().ping().await?;
        Ok(())
    }

    pub(crate) fn downgrade(&self) -> WeakConnection {
        WeakConnection(Arc::downgrade(&self.inner))
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(NodeError::ConnectionClosed);
        }
        Ok(())
    }

    fn on_result(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            if matches!(e, NodeError::ConnectionClosed | NodeError::Timeout(_)) {
                self.inner.finalize();
            }
        }
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.remote_public_key())
            .field("mode", &self.inner.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Non-owning handle used by servers to track accepted connections
#[derive(Clone)]
pub(crate) struct WeakConnection(Weak<ConnectionInner>);

impl WeakConnection {
    pub(crate) fn upgrade(&self) -> Option<Connection> {
        self.0.upgrade().map(|inner| Connection { inner })
    }
}

async fn keep_alive_loop(connection: Weak<ConnectionInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    let limit = interval * KEEP_ALIVE_MISSES;
    loop {
        ticker.tick().await;
        let Some(inner) = connection.upgrade() else {
            return;
        };
        if *inner.closed.borrow() {
            return;
        }
        let raw = inner.stream.raw();
        if raw.last_activity().elapsed() >= limit {
            tracing::debug!(
                "connection {} silent for {:?}, tearing down",
                inner.id,
                raw.last_activity().elapsed()
            );
            raw.close().await;
            inner.finalize();
            return;
        }
        if let Err(e) = raw.ping().await {
            tracing::trace!("keep-alive ping on connection {} failed: {}", inner.id, e);
        }
    }
}
