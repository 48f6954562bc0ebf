//! # Spaceswarm DHT
//!
//! Kademlia DHT for Spaceswarm nodes.
//!
//! This crate provides:
//! - 256-bit node ids with the XOR metric and k-bucket routing (k = 20)
//! - A request/response RPC engine with retries and failure accounting
//! - Iterative lookups with α parallelism
//! - A record store for announcements, mutable and immutable values
//! - Firewall classification through unsolicited NAT probes
//! - Signaling and holepunch coordination for peer connections
//!
//! ## Example
//!
//! ```rust,no_run
//! use spaceswarm_crypto::KeyPair;
//! use spaceswarm_dht::{Dht, DhtConfig};
//!
//! # async fn run() -> Result<(), spaceswarm_dht::RpcError> {
//! let key_pair = KeyPair::generate();
//! let dht = Dht::bind("0.0.0.0:0".parse().unwrap(), key_pair.public_key(), DhtConfig::default()).await?;
//! dht.fully_bootstrapped().await?;
//!
//! let key = dht.immutable_put(b"hello").await?;
//! assert_eq!(dht.immutable_get(key).await?.as_deref(), Some(b"hello".as_slice()));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod dht;
pub mod firewall;
mod handlers;
pub mod holepunch;
pub mod messages;
pub mod node_id;
pub mod query;
pub mod routing;
pub mod rpc;
pub mod store;

pub use bootstrap::{BOOTSTRAP_NODES, BootstrapNode, KNOWN_NODES};
pub use dht::{
    Dht, DhtConfig, FoundPeer, LookupReply, MutableGetResult, PeerConnectRequest, PeerPath,
    SignalHandler, server_target,
};
pub use firewall::FirewallClassifier;
pub use holepunch::{
    AllowAll, ConnectionPolicy, FirewallPolicy, HolepunchConfig, HolepunchError, HolepunchInfo,
    HolepunchSession, HolepunchState, Holepuncher,
};
pub use messages::{
    Command, ErrorCode, FirewallClass, HandshakePayload, HolepunchPayload, PeerAddr, PeerRecord,
    PunchPhase, RelayInfo, SignedPayload,
};
pub use node_id::NodeId;
pub use routing::{Contact, RoutingTable};
pub use rpc::{RpcConfig, RpcError};
pub use store::{RecordStore, StoreConfig, StoreError};
