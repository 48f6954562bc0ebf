//! Tokio UDP socket behind the [`Transport`] seam.

use crate::transport::{Transport, TransportError, TransportResult};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;

/// Requested kernel buffer size for both directions
pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// UDP socket shared by a mux and its streams. Clones share the socket.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<AtomicBool>,
}

impl UdpTransport {
    /// Bind `addr`.
    ///
    /// Buffers are enlarged when the platform allows it. Address reuse is
    /// never enabled, so two sockets never share a port.
    ///
    /// # Errors
    /// [`TransportError::BindFailed`] if the socket cannot be created or bound.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        let addr = addr.into();
        let failed = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(failed)?;
        for (what, result) in [
            ("recv", socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE)),
            ("send", socket.set_send_buffer_size(SOCKET_BUFFER_SIZE)),
        ] {
            if let Err(e) = result {
                tracing::debug!("{} buffer not resized on {}: {}", what, addr, e);
            }
        }
        socket.bind(&addr.into()).map_err(failed)?;
        socket.set_nonblocking(true).map_err(failed)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(failed)?;
        Ok(Self {
            socket: Arc::new(socket),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn check_open(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        self.check_open()?;
        Ok(self.socket.send_to(buf, addr).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        self.check_open()?;
        Ok(self.socket.recv_from(buf).await?)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
