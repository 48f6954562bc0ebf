//! Error types for the Node API
//!
//! Errors are grouped the way callers react to them:
//!
//! - **Input**: bad keys or settings, reported before any network I/O
//! - **Protocol**: malformed or unsigned remote data
//! - **Consistency**: mutable writes refused because of their sequence number
//! - **Network**: timeouts and exhausted lookups
//! - **Connectivity**: holepunch and relay failures, policy aborts
//! - **Authentication**: the remote proved a different key
//!
//! `is_transient()` marks the errors worth retrying later.

use spaceswarm_dht::{ErrorCode, HolepunchError, RpcError, StoreError};
use spaceswarm_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors that can occur in Node operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    // ============ Input Errors ============
    /// Key is neither 32 raw bytes nor a 52-character encoding
    #[error("Invalid key: {0}")]
    InvalidKey(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Value exceeds the record size cap
    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge {
        /// Value size
        size: usize,
        /// Cap
        max: usize,
    },

    // ============ Protocol Errors ============
    /// Remote sent malformed or unverifiable data
    #[error("Protocol error: {0}")]
    Protocol(Cow<'static, str>),

    /// Remote rejected a request with an error code
    #[error("Request rejected: {0:?}")]
    Rejected(ErrorCode),

    // ============ Consistency Errors ============
    /// A newer mutable value is stored
    #[error("Sequence number too low")]
    SeqTooLow,

    /// Same sequence number with a different value
    #[error("Sequence number reused")]
    SeqReused,

    // ============ Network Errors ============
    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(Cow<'static, str>),

    /// Lookup found nobody to ask
    #[error("No nodes reachable")]
    NoNodes,

    /// Socket or stream failure
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    // ============ Connectivity Errors ============
    /// No announce record for the key
    #[error("Peer not found: {}", hex::encode(&.0[..8]))]
    PeerNotFound([u8; 32]),

    /// A holepunch policy hook refused the connection
    #[error("Holepunch aborted")]
    HolepunchAborted,

    /// Punching failed and no relay was available
    #[error("Could not connect: {0}")]
    ConnectionFailed(Cow<'static, str>),

    /// Connection is closed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Server is closed or not listening
    #[error("Server closed")]
    ServerClosed,

    // ============ Authentication Errors ============
    /// Remote authenticated a different key than requested
    #[error("Remote public key mismatch")]
    RemoteKeyMismatch,

    /// Encrypted handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(Cow<'static, str>),

    // ============ Lifecycle ============
    /// Node was destroyed
    #[error("Node destroyed")]
    Destroyed,
}

impl NodeError {
    /// Returns true if this error is transient and may succeed on retry
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Timeout(_)
                | NodeError::NoNodes
                | NodeError::Transport(_)
                | NodeError::ConnectionFailed(_)
                | NodeError::Rejected(ErrorCode::TryLater)
        )
    }

    /// Returns true if this error will not succeed without intervention
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeError::InvalidKey(_)
                | NodeError::InvalidConfig(_)
                | NodeError::ValueTooLarge { .. }
                | NodeError::SeqTooLow
                | NodeError::SeqReused
                | NodeError::HolepunchAborted
                | NodeError::RemoteKeyMismatch
                | NodeError::Destroyed
        )
    }

    /// Create an invalid key error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_key(context: &'static str) -> Self {
        NodeError::InvalidKey(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        NodeError::InvalidConfig(Cow::Borrowed(context))
    }

    /// Create a protocol error with static context (zero allocation)
    #[must_use]
    pub const fn protocol(context: &'static str) -> Self {
        NodeError::Protocol(Cow::Borrowed(context))
    }

    /// Create a timeout error with static context (zero allocation)
    #[must_use]
    pub const fn timeout(context: &'static str) -> Self {
        NodeError::Timeout(Cow::Borrowed(context))
    }

    /// Create a handshake error with static context (zero allocation)
    #[must_use]
    pub const fn handshake(context: &'static str) -> Self {
        NodeError::Handshake(Cow::Borrowed(context))
    }

    /// Create a connection failure with static context (zero allocation)
    #[must_use]
    pub const fn connection_failed(context: &'static str) -> Self {
        NodeError::ConnectionFailed(Cow::Borrowed(context))
    }
}

impl From<RpcError> for NodeError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout => NodeError::timeout("request"),
            RpcError::NoNodes => NodeError::NoNodes,
            RpcError::Destroyed => NodeError::Destroyed,
            RpcError::Remote(ErrorCode::SeqTooLow) => NodeError::SeqTooLow,
            RpcError::Remote(ErrorCode::SeqReused) => NodeError::SeqReused,
            RpcError::Remote(code) => NodeError::Rejected(code),
            RpcError::Encode(e) => NodeError::Protocol(e.into()),
            RpcError::Transport(e) => NodeError::Transport(e.into()),
            RpcError::Store(e) => e.into(),
        }
    }
}

impl From<StoreError> for NodeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ValueTooLarge { size, max } => NodeError::ValueTooLarge { size, max },
            StoreError::SeqTooLow => NodeError::SeqTooLow,
            StoreError::SeqReused => NodeError::SeqReused,
            other => NodeError::Protocol(other.to_string().into()),
        }
    }
}

impl From<HolepunchError> for NodeError {
    fn from(err: HolepunchError) -> Self {
        match err {
            HolepunchError::PeerNotFound => NodeError::PeerNotFound([0u8; 32]),
            HolepunchError::Aborted => NodeError::HolepunchAborted,
            HolepunchError::Rejected(code) => NodeError::Rejected(code),
            HolepunchError::Failed => NodeError::connection_failed("holepunch failed, no relay"),
            HolepunchError::InvalidReply(e) => NodeError::Protocol(e.into()),
            HolepunchError::Rpc(e) => e.into(),
        }
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::Reset | TransportError::Ended => {
                NodeError::ConnectionClosed
            }
            TransportError::TimedOut => NodeError::timeout("stream"),
            other => NodeError::Transport(other.to_string().into()),
        }
    }
}

impl From<spaceswarm_crypto::CryptoError> for NodeError {
    fn from(err: spaceswarm_crypto::CryptoError) -> Self {
        match err {
            spaceswarm_crypto::CryptoError::RemoteKeyMismatch => NodeError::RemoteKeyMismatch,
            spaceswarm_crypto::CryptoError::InvalidKeyEncoding
            | spaceswarm_crypto::CryptoError::InvalidKeyLength { .. } => {
                NodeError::InvalidKey(err.to_string().into())
            }
            other => NodeError::Handshake(other.to_string().into()),
        }
    }
}

/// Result type for Node operations
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(NodeError::timeout("test").is_transient());
        assert!(NodeError::NoNodes.is_transient());
        assert!(NodeError::Transport(Cow::Borrowed("test")).is_transient());
        assert!(NodeError::connection_failed("test").is_transient());
        assert!(NodeError::Rejected(ErrorCode::TryLater).is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        assert!(NodeError::invalid_key("test").is_permanent());
        assert!(NodeError::invalid_config("test").is_permanent());
        assert!(NodeError::SeqTooLow.is_permanent());
        assert!(NodeError::SeqReused.is_permanent());
        assert!(NodeError::HolepunchAborted.is_permanent());
        assert!(NodeError::RemoteKeyMismatch.is_permanent());
        assert!(NodeError::Destroyed.is_permanent());
    }

    #[test]
    fn test_mutual_exclusivity() {
        let errors = [
            NodeError::timeout("x"),
            NodeError::NoNodes,
            NodeError::HolepunchAborted,
            NodeError::SeqTooLow,
            NodeError::protocol("x"),
            NodeError::ConnectionClosed,
        ];
        for err in &errors {
            assert!(!(err.is_transient() && err.is_permanent()), "{err}");
        }
    }

    #[test]
    fn test_rpc_conversion() {
        assert_eq!(NodeError::from(RpcError::NoNodes), NodeError::NoNodes);
        assert_eq!(NodeError::from(RpcError::Destroyed), NodeError::Destroyed);
        assert_eq!(
            NodeError::from(RpcError::Remote(ErrorCode::SeqTooLow)),
            NodeError::SeqTooLow
        );
        assert_eq!(
            NodeError::from(RpcError::Remote(ErrorCode::SeqReused)),
            NodeError::SeqReused
        );
        assert_eq!(
            NodeError::from(RpcError::Store(StoreError::ValueTooLarge { size: 2, max: 1 })),
            NodeError::ValueTooLarge { size: 2, max: 1 }
        );
    }

    #[test]
    fn test_holepunch_conversion() {
        assert_eq!(
            NodeError::from(HolepunchError::Aborted),
            NodeError::HolepunchAborted
        );
        assert!(matches!(
            NodeError::from(HolepunchError::Failed),
            NodeError::ConnectionFailed(_)
        ));
        assert_eq!(
            NodeError::from(HolepunchError::Rpc(RpcError::Destroyed)),
            NodeError::Destroyed
        );
    }

    #[test]
    fn test_crypto_conversion() {
        assert_eq!(
            NodeError::from(spaceswarm_crypto::CryptoError::RemoteKeyMismatch),
            NodeError::RemoteKeyMismatch
        );
        assert!(matches!(
            NodeError::from(spaceswarm_crypto::CryptoError::InvalidKeyEncoding),
            NodeError::InvalidKey(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let mut key = [0u8; 32];
        key[..4].copy_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(NodeError::PeerNotFound(key).to_string().contains("deadbeef"));
        assert_eq!(NodeError::Destroyed.to_string(), "Node destroyed");
    }
}
