//! Message-oriented raw stream abstraction.
//!
//! Encrypted connections run on top of any [`RawStream`]: a mux stream over
//! UDP, a relay channel, or an in-process loopback pair.

use crate::stream::MuxStream;
use crate::transport::{TransportError, TransportResult};
use crate::MAX_STREAM_PAYLOAD;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, mpsc};

/// Reliable, ordered, message-preserving byte stream
#[async_trait]
pub trait RawStream: Send + Sync {
    /// Send one message
    async fn send(&self, message: &[u8]) -> TransportResult<()>;

    /// Receive one message; `Ok(None)` after the remote ended
    async fn recv(&self) -> TransportResult<Option<Vec<u8>>>;

    /// Half-close for writing
    async fn end(&self) -> TransportResult<()>;

    /// Abort both directions
    async fn close(&self);

    /// Remote address, when the stream has one
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Largest message accepted by [`send`](Self::send)
    fn max_message_size(&self) -> usize;

    /// Time of the last inbound traffic
    fn last_activity(&self) -> Instant;

    /// Probe the remote to keep the path alive
    async fn ping(&self) -> TransportResult<()> {
        Ok(())
    }

    /// Identifier of the UDP socket carrying the stream
    fn socket_id(&self) -> Option<u64> {
        None
    }
}

#[async_trait]
impl RawStream for MuxStream {
    async fn send(&self, message: &[u8]) -> TransportResult<()> {
        MuxStream::send(self, message).await
    }

    async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        MuxStream::recv(self).await
    }

    async fn end(&self) -> TransportResult<()> {
        MuxStream::end(self).await
    }

    async fn close(&self) {
        MuxStream::close(self).await;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        MuxStream::remote_addr(self)
    }

    fn max_message_size(&self) -> usize {
        MAX_STREAM_PAYLOAD
    }

    fn last_activity(&self) -> Instant {
        MuxStream::last_activity(self)
    }

    async fn ping(&self) -> TransportResult<()> {
        MuxStream::ping(self).await
    }

    fn socket_id(&self) -> Option<u64> {
        Some(MuxStream::socket_id(self))
    }
}

enum Frame {
    Data(Vec<u8>),
    End,
    Reset,
}

/// One end of an in-process stream pair
pub struct LoopbackStream {
    tx: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: Mutex<(mpsc::UnboundedReceiver<Frame>, Option<bool>)>,
    created: Instant,
    activity_ms: AtomicU64,
}

/// Create two connected loopback streams.
#[must_use]
pub fn loopback_pair() -> (LoopbackStream, LoopbackStream) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (LoopbackStream::new(a_tx, b_rx), LoopbackStream::new(b_tx, a_rx))
}

impl LoopbackStream {
    fn new(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new((rx, None)),
            created: Instant::now(),
            activity_ms: AtomicU64::new(0),
        }
    }

    async fn push(&self, frame: Frame, closing: bool) -> TransportResult<()> {
        let mut tx = self.tx.lock().await;
        let sender = tx.as_ref().ok_or(TransportError::Ended)?;
        sender.send(frame).map_err(|_| TransportError::Closed)?;
        if closing {
            *tx = None;
        }
        Ok(())
    }
}

#[async_trait]
impl RawStream for LoopbackStream {
    async fn send(&self, message: &[u8]) -> TransportResult<()> {
        self.push(Frame::Data(message.to_vec()), false).await
    }

    async fn recv(&self) -> TransportResult<Option<Vec<u8>>> {
        let mut guard = self.rx.lock().await;
        let (rx, terminal) = &mut *guard;
        if let Some(clean) = *terminal {
            return if clean {
                Ok(None)
            } else {
                Err(TransportError::Reset)
            };
        }
        let frame = rx.recv().await;
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.activity_ms.store(elapsed, Ordering::Relaxed);
        match frame {
            Some(Frame::Data(data)) => Ok(Some(data)),
            Some(Frame::End) => {
                *terminal = Some(true);
                Ok(None)
            }
            Some(Frame::Reset) | None => {
                *terminal = Some(false);
                Err(TransportError::Reset)
            }
        }
    }

    async fn end(&self) -> TransportResult<()> {
        self.push(Frame::End, true).await
    }

    async fn close(&self) {
        let mut tx = self.tx.lock().await;
        if let Some(sender) = tx.take() {
            let _ = sender.send(Frame::Reset);
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn max_message_size(&self) -> usize {
        MAX_STREAM_PAYLOAD
    }

    fn last_activity(&self) -> Instant {
        self.created + Duration::from_millis(self.activity_ms.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_loopback_delivers_in_order() {
        let (a, b) = loopback_pair();
        a.send(b"one").await.unwrap();
        a.send(b"two").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(b.recv().await.unwrap(), Some(b"two".to_vec()));
    }

    #[tokio::test]
    async fn test_loopback_end_is_half_close() {
        let (a, b) = loopback_pair();
        a.end().await.unwrap();
        assert_eq!(b.recv().await.unwrap(), None);
        assert_eq!(b.recv().await.unwrap(), None);
        assert!(matches!(a.send(b"late").await, Err(TransportError::Ended)));

        b.send(b"still open").await.unwrap();
        assert_eq!(a.recv().await.unwrap(), Some(b"still open".to_vec()));
    }

    #[tokio::test]
    async fn test_loopback_close_resets_peer() {
        let (a, b) = loopback_pair();
        a.close().await;
        assert!(matches!(b.recv().await, Err(TransportError::Reset)));
    }

    #[tokio::test]
    async fn test_loopback_drop_resets_peer() {
        let (a, b) = loopback_pair();
        drop(a);
        assert!(matches!(b.recv().await, Err(TransportError::Reset)));
    }
}
