//! Datagram backend seam and the error type shared by the whole crate.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Socket, mux and stream errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket or stream already closed
    #[error("Transport is closed")]
    Closed,

    /// Could not create or bind the socket
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Stream has no remote yet
    #[error("Stream not connected")]
    NotConnected,

    /// Remote reset the stream
    #[error("Stream reset by peer")]
    Reset,

    /// Retransmissions exhausted without an acknowledgement
    #[error("Stream timed out")]
    TimedOut,

    /// Message exceeds the stream payload limit
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Offending size
        size: usize,
        /// Limit
        max: usize,
    },

    /// Stream was already ended for writing
    #[error("Stream already ended")]
    Ended,
}

/// Result alias for this crate
pub type TransportResult<T> = Result<T, TransportError>;

/// Unreliable datagram socket the mux runs on.
///
/// Once [`close`](Transport::close) returns, sends fail with
/// [`TransportError::Closed`] and a pending receive loop stops at its next call.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Wait for one datagram; returns its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Bound address
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop sending and receiving.
    async fn close(&self) -> TransportResult<()>;

    /// True after [`close`](Transport::close)
    fn is_closed(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::MessageTooLarge { size: 2000, max: 1186 };
        assert_eq!(err.to_string(), "Message too large: 2000 bytes (max 1186)");
        assert_eq!(TransportError::Reset.to_string(), "Stream reset by peer");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        let err: TransportError = io_err.into();
        assert!(matches!(err, TransportError::Io(_)));
    }
}
