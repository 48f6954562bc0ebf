//! # Spaceswarm Core
//!
//! Peer-to-peer connectivity for Spaceswarm: reach any peer by its public key.
//!
//! This crate provides:
//! - The [`Node`] facade over a Kademlia DHT node
//! - Servers announced under a key and found by clients through the DHT
//! - Noise-encrypted, mutually authenticated connections over UDP
//! - NAT traversal by coordinated holepunching, with relay fallback
//! - Keep-alive and teardown of silent connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Node                                     │
//! │   (servers, connects, records, relay service)                   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Connection                               │
//! │   (SecretStream over a mux stream, a relay channel or loopback) │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         DHT and transport                        │
//! │   (spaceswarm-dht, spaceswarm-transport)                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod node;
pub mod secret_stream;

pub use node::{
    ConnectHandle, ConnectOptions, Connection, ConnectionMode, KeyInput, Node, NodeAddress,
    NodeConfig, NodeError, Server, ServerOptions,
};
pub use secret_stream::SecretStream;
pub use spaceswarm_crypto::{KeyPair, PublicKey};
pub use spaceswarm_dht::{
    AllowAll, ConnectionPolicy, FirewallClass, FirewallPolicy, HolepunchInfo, HolepunchState,
};
